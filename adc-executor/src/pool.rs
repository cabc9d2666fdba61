use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::MethodRegistry;
use crate::ExecutorError;

/// Sizing and timing knobs for the pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Per-call deadline; a worker that misses it is marked suspect.
    pub dispatch_timeout: Duration,
    /// How often the load sampler runs.
    pub sample_interval: Duration,
    /// Utilization above which a worker is added.
    pub scale_up_threshold: f64,
    /// Utilization below which an idle worker is retired.
    pub scale_down_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: default_max_workers(),
            dispatch_timeout: Duration::from_secs(30),
            sample_interval: Duration::from_secs(5),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
        }
    }
}

/// Default pool ceiling: `max(2, cpu_count - 1)`.
pub fn default_max_workers() -> usize {
    std::cmp::max(2, num_cpus::get().saturating_sub(1))
}

/// Where a worker executes. Pools today are in-process; a remote-node
/// backend slots in here once workers can live off-host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerBackend {
    Local,
}

/// Snapshot of one worker, for introspection endpoints.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    pub id: usize,
    pub task_count: usize,
    pub created_at: DateTime<Utc>,
    pub backend: WorkerBackend,
    pub suspect: bool,
}

struct Invocation {
    method: String,
    args: Vec<Value>,
    reply: oneshot::Sender<Result<Value, ExecutorError>>,
}

struct WorkerHandle {
    id: usize,
    tx: mpsc::Sender<Invocation>,
    in_flight: Arc<AtomicUsize>,
    suspect: Arc<AtomicBool>,
    created_at: DateTime<Utc>,
}

/// Dynamic worker pool.
///
/// Each worker is a single-consumer task running one invocation at a
/// time. Dispatch picks the least-loaded healthy worker (round-robin on
/// ties). A sampler measures utilization — busy workers over pool size —
/// every few seconds and grows or shrinks the pool inside
/// `[min_workers, max_workers]`.
pub struct WorkerPool {
    registry: Arc<MethodRegistry>,
    config: PoolConfig,
    workers: Mutex<Vec<WorkerHandle>>,
    next_id: AtomicUsize,
    rr: AtomicUsize,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(registry: Arc<MethodRegistry>, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            registry,
            config,
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            rr: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });
        for _ in 0..pool.config.min_workers {
            pool.spawn_worker();
        }
        pool
    }

    /// Start the load sampler. Runs until [`WorkerPool::shutdown`].
    pub fn spawn_sampler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = ticker.tick() => pool.rebalance(),
                }
            }
        })
    }

    /// Dispatch a method call to the least-loaded worker.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ExecutorError> {
        let (tx, in_flight, suspect) = {
            let workers = self.workers.lock().unwrap();
            let healthy: Vec<&WorkerHandle> = workers
                .iter()
                .filter(|w| !w.suspect.load(Ordering::SeqCst))
                .collect();
            let candidates: Vec<&WorkerHandle> = if healthy.is_empty() {
                workers.iter().collect()
            } else {
                healthy
            };
            if candidates.is_empty() {
                return Err(ExecutorError::NoWorkers);
            }

            let min_load = candidates
                .iter()
                .map(|w| w.in_flight.load(Ordering::SeqCst))
                .min()
                .unwrap_or(0);
            let tied: Vec<&&WorkerHandle> = candidates
                .iter()
                .filter(|w| w.in_flight.load(Ordering::SeqCst) == min_load)
                .collect();
            let pick = tied[self.rr.fetch_add(1, Ordering::Relaxed) % tied.len()];
            (pick.tx.clone(), pick.in_flight.clone(), pick.suspect.clone())
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        in_flight.fetch_add(1, Ordering::SeqCst);
        if tx
            .send(Invocation {
                method: method.to_string(),
                args,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(ExecutorError::WorkerGone);
        }

        match tokio::time::timeout(self.config.dispatch_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExecutorError::WorkerGone),
            Err(_) => {
                suspect.store(true, Ordering::SeqCst);
                warn!(method, "Worker dispatch timed out; worker marked suspect");
                Err(ExecutorError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Snapshot of the pool.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .map(|w| WorkerInfo {
                id: w.id,
                task_count: w.in_flight.load(Ordering::SeqCst),
                created_at: w.created_at,
                backend: WorkerBackend::Local,
                suspect: w.suspect.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the sampler and all workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.workers.lock().unwrap().clear();
    }

    /// One sampler step: grow on high utilization, retire an idle worker
    /// on low utilization. Also replaces suspect workers.
    fn rebalance(&self) {
        let (len, busy, has_idle, has_suspect) = {
            let workers = self.workers.lock().unwrap();
            let busy = workers
                .iter()
                .filter(|w| w.in_flight.load(Ordering::SeqCst) > 0)
                .count();
            let idle = workers
                .iter()
                .any(|w| w.in_flight.load(Ordering::SeqCst) == 0);
            let suspect = workers.iter().any(|w| w.suspect.load(Ordering::SeqCst));
            (workers.len(), busy, idle, suspect)
        };
        if len == 0 {
            return;
        }

        let utilization = busy as f64 / len as f64;
        debug!(len, busy, utilization, "Sampled worker pool load");

        if has_suspect {
            self.replace_suspects();
        }

        if utilization > self.config.scale_up_threshold && len < self.config.max_workers {
            info!(len, "High load: adding a worker");
            self.spawn_worker();
        } else if utilization < self.config.scale_down_threshold
            && has_idle
            && len > self.config.min_workers
        {
            let mut workers = self.workers.lock().unwrap();
            if let Some(pos) = workers
                .iter()
                .position(|w| w.in_flight.load(Ordering::SeqCst) == 0)
            {
                let retired = workers.remove(pos);
                info!(worker = retired.id, "Low load: retiring idle worker");
                // Dropping the sender ends the worker loop once drained.
            }
        }
    }

    fn replace_suspects(&self) {
        let removed = {
            let mut workers = self.workers.lock().unwrap();
            let before = workers.len();
            workers.retain(|w| !w.suspect.load(Ordering::SeqCst));
            before - workers.len()
        };
        for _ in 0..removed {
            self.spawn_worker();
        }
        if removed > 0 {
            warn!(removed, "Replaced suspect workers");
        }
    }

    fn spawn_worker(&self) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel::<Invocation>(64);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let suspect = Arc::new(AtomicBool::new(false));

        let registry = self.registry.clone();
        let worker_load = in_flight.clone();
        tokio::spawn(async move {
            while let Some(invocation) = rx.recv().await {
                let result = registry.dispatch(&invocation.method, invocation.args).await;
                worker_load.fetch_sub(1, Ordering::SeqCst);
                let _ = invocation.reply.send(result);
            }
        });

        self.workers.lock().unwrap().push(WorkerHandle {
            id,
            tx,
            in_flight,
            suspect,
            created_at: Utc::now(),
        });
    }
}

/// Call-site wrapper for a distributed module: routes invocations to a
/// bound worker pool, or runs them in-process when none is bound.
#[derive(Clone)]
pub struct WorkerProxy {
    registry: Arc<MethodRegistry>,
    pool: Option<Arc<WorkerPool>>,
}

impl WorkerProxy {
    /// In-process proxy: calls run directly on the caller's task.
    pub fn local(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            pool: None,
        }
    }

    /// Pool-bound proxy.
    pub fn pooled(registry: Arc<MethodRegistry>, pool: Arc<WorkerPool>) -> Self {
        Self {
            registry,
            pool: Some(pool),
        }
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ExecutorError> {
        match &self.pool {
            Some(pool) => pool.invoke(method, args).await,
            None => self.registry.dispatch(method, args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow_and_fast() -> Arc<MethodRegistry> {
        Arc::new(
            MethodRegistry::new()
                .register("fast", |_| async { Ok(serde_json::json!("ok")) })
                .register("slow", |_| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(serde_json::json!("slept"))
                })
                .register("hang", |_| async {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(serde_json::json!("never"))
                }),
        )
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            dispatch_timeout: Duration::from_secs(5),
            sample_interval: Duration::from_millis(20),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn invokes_through_a_worker() {
        let pool = WorkerPool::new(slow_and_fast(), config(2, 4));
        let result = pool.invoke("fast", vec![]).await.unwrap();
        assert_eq!(result, serde_json::json!("ok"));
        pool.shutdown();
    }

    #[tokio::test]
    async fn least_loaded_worker_takes_the_call() {
        let pool = WorkerPool::new(slow_and_fast(), config(2, 4));

        // Occupy one worker with a slow call.
        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.invoke("slow", vec![]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The fast call must complete long before the slow one finishes.
        let started = tokio::time::Instant::now();
        pool.invoke("fast", vec![]).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));

        busy.await.unwrap().unwrap();
        pool.shutdown();
    }

    #[tokio::test]
    async fn timeout_marks_the_worker_suspect() {
        let mut cfg = config(1, 2);
        cfg.dispatch_timeout = Duration::from_millis(50);
        let pool = WorkerPool::new(slow_and_fast(), cfg);

        let err = pool.invoke("hang", vec![]).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { .. }));
        assert!(pool.workers().iter().any(|w| w.suspect));
        pool.shutdown();
    }

    #[tokio::test]
    async fn sampler_scales_up_under_load() {
        let pool = WorkerPool::new(slow_and_fast(), config(1, 3));
        let sampler = pool.spawn_sampler();

        // Saturate the single worker.
        let busy: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.invoke("slow", vec![]).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.len() > 1, "expected the sampler to add workers");

        for handle in busy {
            handle.await.unwrap().unwrap();
        }

        // Load gone: the pool shrinks back toward the minimum.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pool.len() < 3 || pool.config.min_workers == pool.len());

        pool.shutdown();
        sampler.await.unwrap();
    }

    #[tokio::test]
    async fn unbound_proxy_runs_in_process() {
        let registry = slow_and_fast();
        let proxy = WorkerProxy::local(registry);
        let result = proxy.call("fast", vec![]).await.unwrap();
        assert_eq!(result, serde_json::json!("ok"));
    }

    #[test]
    fn default_ceiling_is_at_least_two() {
        assert!(default_max_workers() >= 2);
    }
}
