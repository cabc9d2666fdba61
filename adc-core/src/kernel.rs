use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::descriptor::ModuleDescriptor;
use crate::error::{ConfigError, DependencyError, LifecycleError};
use crate::lifecycle::{CapabilityKey, ErasedModule};
use crate::loader::ModuleLoader;
use crate::registry::{ModuleKey, ModuleKind, Registry};

/// Reference to a registered module at `(kind, name)` granularity, used
/// for dependency edges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRef {
    pub kind: ModuleKind,
    pub name: String,
}

impl ModuleRef {
    pub fn new(kind: ModuleKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

struct Registered {
    key: ModuleKey,
    fail_on_error: bool,
}

struct Edge {
    consumer: ModuleRef,
    dependency: ModuleRef,
}

/// The module kernel: owns the registry, the dependency graph, the
/// capability key, and lifecycle ordering.
///
/// Start order is providers → utilities → services → apps; within a kind,
/// recorded dependency edges start first and insertion order breaks ties.
/// Shutdown reverses the actual start order with a bounded per-module
/// deadline.
pub struct Kernel {
    registry: Registry,
    capability: CapabilityKey,
    modules: Mutex<Vec<Registered>>,
    edges: Mutex<Vec<Edge>>,
    started: Mutex<Vec<ModuleKey>>,
    shutdown: CancellationToken,
    module_deadline: Duration,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            capability: CapabilityKey::generate(),
            modules: Mutex::new(Vec::new()),
            edges: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            module_deadline: Duration::from_secs(30),
        }
    }

    /// Override the per-module start/stop deadline (default 30 s).
    pub fn with_module_deadline(mut self, deadline: Duration) -> Self {
        self.module_deadline = deadline;
        self
    }

    /// The kernel capability key.
    ///
    /// Hand this out only to privileged platform initialization code
    /// (bootstrap, system-user retrieval). Modules themselves never
    /// receive it — they are driven by the kernel.
    pub fn capability(&self) -> &CapabilityKey {
        &self.capability
    }

    /// Token cancelled when platform shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal platform shutdown: cancels in-flight start/stop waits.
    ///
    /// `stop()` does not set this — teardown after a failed start leaves
    /// the kernel restartable.
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Register a module instance. The kernel binds its capability key
    /// onto the instance's lifecycle gate.
    pub fn register_module(
        &self,
        instance: Arc<dyn ErasedModule>,
        custom: &serde_json::Map<String, serde_json::Value>,
        fail_on_error: bool,
    ) -> ModuleKey {
        instance.gate().bind(&self.capability);
        let kind = instance.kind();
        let name = instance.name().to_string();
        let key = self.registry.register(kind, &name, instance, custom);

        let mut modules = self.modules.lock().unwrap();
        if !modules.iter().any(|m| m.key == key) {
            modules.push(Registered {
                key: key.clone(),
                fail_on_error,
            });
        } else if let Some(existing) = modules.iter_mut().find(|m| m.key == key) {
            existing.fail_on_error = fail_on_error;
        }
        key
    }

    /// Register a provider instance. Overriding an existing key logs a
    /// warning and succeeds.
    pub fn register_provider(
        &self,
        instance: Arc<dyn ErasedModule>,
        custom: &serde_json::Map<String, serde_json::Value>,
    ) -> ModuleKey {
        self.register_module(instance, custom, true)
    }

    /// Register a utility instance.
    pub fn register_utility(
        &self,
        instance: Arc<dyn ErasedModule>,
        custom: &serde_json::Map<String, serde_json::Value>,
    ) -> ModuleKey {
        self.register_module(instance, custom, true)
    }

    /// Register a service instance.
    pub fn register_service(
        &self,
        instance: Arc<dyn ErasedModule>,
        custom: &serde_json::Map<String, serde_json::Value>,
    ) -> ModuleKey {
        self.register_module(instance, custom, true)
    }

    /// Register an app instance.
    pub fn register_app(
        &self,
        instance: Arc<dyn ErasedModule>,
        custom: &serde_json::Map<String, serde_json::Value>,
    ) -> ModuleKey {
        self.register_module(instance, custom, true)
    }

    /// Record a dependency edge: `dependency` starts before `consumer`.
    pub fn add_module_dependency(&self, consumer: ModuleRef, dependency: ModuleRef) {
        self.edges.lock().unwrap().push(Edge {
            consumer,
            dependency,
        });
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Typed provider lookup.
    pub fn get_provider<T: Send + Sync + 'static>(
        &self,
        name: &str,
        custom: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Arc<T>, DependencyError> {
        self.registry.get_as::<T>(ModuleKind::Provider, name, custom)
    }

    /// Typed utility lookup.
    pub fn get_utility<T: Send + Sync + 'static>(
        &self,
        name: &str,
        custom: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Arc<T>, DependencyError> {
        self.registry.get_as::<T>(ModuleKind::Utility, name, custom)
    }

    /// Typed service lookup.
    pub fn get_service<T: Send + Sync + 'static>(
        &self,
        name: &str,
        custom: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Arc<T>, DependencyError> {
        self.registry.get_as::<T>(ModuleKind::Service, name, custom)
    }

    /// Typed app lookup.
    pub fn get_app<T: Send + Sync + 'static>(
        &self,
        name: &str,
        custom: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Arc<T>, DependencyError> {
        self.registry.get_as::<T>(ModuleKind::App, name, custom)
    }

    // ── Descriptor installation ─────────────────────────────────────────

    /// Instantiate a descriptor tree through the loader and register
    /// everything, recording app → sub-module dependency edges.
    ///
    /// Sub-modules are installed before their parents so that insertion
    /// order alone already reflects the dependency direction.
    pub fn install(
        &self,
        loader: &ModuleLoader,
        descriptors: &[ModuleDescriptor],
    ) -> Result<(), ConfigError> {
        for descriptor in descriptors {
            self.install_one(loader, descriptor, None)?;
        }
        Ok(())
    }

    fn install_one(
        &self,
        loader: &ModuleLoader,
        descriptor: &ModuleDescriptor,
        parent: Option<&ModuleRef>,
    ) -> Result<(), ConfigError> {
        let loaded = match loader.instantiate(descriptor) {
            Ok(loaded) => loaded,
            Err(err) if !descriptor.fail_on_error => {
                warn!(
                    kind = %descriptor.kind,
                    name = %descriptor.name,
                    error = %err,
                    "Skipping module that failed to load"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let merged = loaded.descriptor;
        let this_ref = ModuleRef::new(merged.kind, merged.name.clone());

        // Sub-modules first: providers, then utilities, then services.
        for sub in merged
            .providers
            .iter()
            .chain(merged.utilities.iter())
            .chain(merged.services.iter())
        {
            self.install_one(loader, sub, Some(&this_ref))?;
        }

        self.register_module(loaded.instance, &merged.custom, merged.fail_on_error);

        if let Some(parent) = parent {
            self.add_module_dependency(
                parent.clone(),
                ModuleRef::new(merged.kind, merged.name.clone()),
            );
        }

        for sub in merged
            .providers
            .iter()
            .chain(merged.utilities.iter())
            .chain(merged.services.iter())
        {
            self.add_module_dependency(
                this_ref.clone(),
                ModuleRef::new(sub.kind, sub.name.clone()),
            );
        }

        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Bring every registered module up in dependency order.
    ///
    /// Providers start first (insertion order), then utilities, services,
    /// and apps; within a kind, dependency edges start first. A module
    /// whose start fails is skipped unless it was registered with
    /// `fail_on_error`, in which case everything started so far is torn
    /// down and the error is returned.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        for kind in ModuleKind::START_ORDER {
            let order = self.start_order(kind)?;
            for (key, fail_on_error) in order {
                let Some(module) = self.registry.get_by_key(&key) else {
                    continue;
                };
                if module.gate().is_running() {
                    continue;
                }

                let result = self.drive(&key.name, module.start(&self.capability)).await;
                match result {
                    Ok(()) => {
                        module.gate().mark_started();
                        self.started.lock().unwrap().push(key.clone());
                        info!(module = ?key, "Module started");
                    }
                    Err(err) if fail_on_error => {
                        error!(module = ?key, error = %err, "Module failed to start; tearing down");
                        self.stop().await;
                        return Err(LifecycleError::StartFailed {
                            module: key.name.clone(),
                            reason: err.to_string(),
                        });
                    }
                    Err(err) => {
                        warn!(module = ?key, error = %err, "Module failed to start; skipping");
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop every started module in reverse start order.
    ///
    /// Each stop is bounded by the module deadline; a module that exceeds
    /// it is logged and abandoned so shutdown always completes.
    pub async fn stop(&self) {
        let started: Vec<ModuleKey> = {
            let mut guard = self.started.lock().unwrap();
            let mut keys = std::mem::take(&mut *guard);
            keys.reverse();
            keys
        };

        for key in started {
            let Some(module) = self.registry.get_by_key(&key) else {
                continue;
            };
            if !module.gate().is_running() {
                continue;
            }
            match tokio::time::timeout(self.module_deadline, module.stop(&self.capability)).await {
                Ok(Ok(())) => {
                    module.gate().mark_stopped();
                    info!(module = ?key, "Module stopped");
                }
                Ok(Err(err)) => {
                    module.gate().mark_stopped();
                    warn!(module = ?key, error = %err, "Module stop returned an error");
                }
                Err(_) => {
                    module.gate().mark_stopped();
                    error!(
                        module = ?key,
                        seconds = self.module_deadline.as_secs(),
                        "Module exceeded shutdown deadline; moving on"
                    );
                }
            }
        }
    }

    /// Stop, replace, and restart one module instance.
    ///
    /// Hot reload stays out of the core: a watcher collaborator constructs
    /// the replacement (through the loader) and calls this.
    pub async fn reload(
        &self,
        instance: Arc<dyn ErasedModule>,
        custom: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), LifecycleError> {
        let kind = instance.kind();
        let name = instance.name().to_string();

        if let Ok(old) = self.registry.get(kind, &name, Some(custom)) {
            if old.gate().is_running() {
                match tokio::time::timeout(self.module_deadline, old.stop(&self.capability)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(LifecycleError::ShutdownTimeout {
                            module: name,
                            seconds: self.module_deadline.as_secs(),
                        })
                    }
                }
                old.gate().mark_stopped();
            }
        }

        let key = self.register_module(instance.clone(), custom, true);
        self.drive(&key.name, instance.start(&self.capability))
            .await?;
        instance.gate().mark_started();
        let mut started = self.started.lock().unwrap();
        if !started.contains(&key) {
            started.push(key);
        }
        Ok(())
    }

    /// Run a lifecycle future under the module deadline and the shutdown
    /// signal.
    async fn drive<F>(&self, module: &str, fut: F) -> Result<(), LifecycleError>
    where
        F: std::future::Future<Output = Result<(), LifecycleError>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(LifecycleError::Cancelled),
            result = tokio::time::timeout(self.module_deadline, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(LifecycleError::StartFailed {
                    module: module.to_string(),
                    reason: format!("deadline of {}s exceeded", self.module_deadline.as_secs()),
                }),
            },
        }
    }

    /// Start order for one kind: insertion order refined by dependency
    /// edges (Kahn's algorithm; FIFO queue keeps insertion order among
    /// independent modules).
    fn start_order(
        &self,
        kind: ModuleKind,
    ) -> Result<Vec<(ModuleKey, bool)>, DependencyError> {
        let nodes: Vec<Registered> = {
            let modules = self.modules.lock().unwrap();
            modules
                .iter()
                .filter(|m| m.key.kind == kind)
                .map(|m| Registered {
                    key: m.key.clone(),
                    fail_on_error: m.fail_on_error,
                })
                .collect()
        };
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        // name -> node indices (several instances may share a name).
        let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            by_name.entry(node.key.name.as_str()).or_default().push(i);
        }

        let mut in_degree = vec![0usize; nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        {
            let edges = self.edges.lock().unwrap();
            for edge in edges.iter() {
                if edge.consumer.kind != kind || edge.dependency.kind != kind {
                    // Cross-kind ordering is already covered by the kind
                    // sequence itself.
                    continue;
                }
                let consumers = by_name.get(edge.consumer.name.as_str());
                let providers = by_name.get(edge.dependency.name.as_str());
                if let (Some(consumers), Some(providers)) = (consumers, providers) {
                    for &c in consumers {
                        for &p in providers {
                            if c != p {
                                dependents[p].push(c);
                                in_degree[c] += 1;
                            }
                        }
                    }
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &dep in &dependents[i] {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    queue.push_back(dep);
                }
            }
        }

        if order.len() != nodes.len() {
            let cycle: Vec<String> = (0..nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| nodes[i].key.name.clone())
                .collect();
            return Err(DependencyError::CyclicDependency { cycle });
        }

        Ok(order
            .into_iter()
            .map(|i| (nodes[i].key.clone(), nodes[i].fail_on_error))
            .collect())
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleGate, Module};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SEQ: AtomicUsize = AtomicUsize::new(0);

    struct Tracked {
        name: String,
        kind: ModuleKind,
        gate: LifecycleGate,
        started_at: AtomicUsize,
        stopped_at: AtomicUsize,
        fail_start: bool,
    }

    impl Tracked {
        fn new(name: &str, kind: ModuleKind) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                kind,
                gate: LifecycleGate::new(),
                started_at: AtomicUsize::new(0),
                stopped_at: AtomicUsize::new(0),
                fail_start: false,
            })
        }

        fn failing(name: &str, kind: ModuleKind) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                kind,
                gate: LifecycleGate::new(),
                started_at: AtomicUsize::new(0),
                stopped_at: AtomicUsize::new(0),
                fail_start: true,
            })
        }
    }

    impl Module for Tracked {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> ModuleKind {
            self.kind
        }
        fn gate(&self) -> &LifecycleGate {
            &self.gate
        }

        async fn start(&self, key: &CapabilityKey) -> Result<(), LifecycleError> {
            self.gate.authorize(key)?;
            if self.fail_start {
                return Err(LifecycleError::StartFailed {
                    module: self.name.clone(),
                    reason: "refused".into(),
                });
            }
            self.started_at
                .store(SEQ.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, key: &CapabilityKey) -> Result<(), LifecycleError> {
            self.gate.authorize(key)?;
            self.stopped_at
                .store(SEQ.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn empty() -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    #[tokio::test]
    async fn starts_kinds_in_order_and_stops_in_reverse() {
        let kernel = Kernel::new();
        let provider = Tracked::new("db", ModuleKind::Provider);
        let service = Tracked::new("sessions", ModuleKind::Service);
        let app = Tracked::new("portal", ModuleKind::App);

        // Register out of order on purpose.
        kernel.register_app(app.clone(), &empty());
        kernel.register_provider(provider.clone(), &empty());
        kernel.register_service(service.clone(), &empty());

        kernel.start().await.unwrap();
        let p = provider.started_at.load(Ordering::SeqCst);
        let s = service.started_at.load(Ordering::SeqCst);
        let a = app.started_at.load(Ordering::SeqCst);
        assert!(p < s && s < a, "expected provider < service < app, got {p} {s} {a}");

        kernel.stop().await;
        let ps = provider.stopped_at.load(Ordering::SeqCst);
        let ss = service.stopped_at.load(Ordering::SeqCst);
        let as_ = app.stopped_at.load(Ordering::SeqCst);
        assert!(as_ < ss && ss < ps, "expected app < service < provider, got {as_} {ss} {ps}");
    }

    #[tokio::test]
    async fn dependency_edges_order_same_kind_modules() {
        let kernel = Kernel::new();
        let consumer = Tracked::new("consumer", ModuleKind::Service);
        let dependency = Tracked::new("dependency", ModuleKind::Service);

        // Insertion order puts the consumer first; the edge must win.
        kernel.register_service(consumer.clone(), &empty());
        kernel.register_service(dependency.clone(), &empty());
        kernel.add_module_dependency(
            ModuleRef::new(ModuleKind::Service, "consumer"),
            ModuleRef::new(ModuleKind::Service, "dependency"),
        );

        kernel.start().await.unwrap();
        assert!(
            dependency.started_at.load(Ordering::SeqCst)
                < consumer.started_at.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn cyclic_same_kind_dependencies_are_rejected() {
        let kernel = Kernel::new();
        kernel.register_service(Tracked::new("a", ModuleKind::Service), &empty());
        kernel.register_service(Tracked::new("b", ModuleKind::Service), &empty());
        kernel.add_module_dependency(
            ModuleRef::new(ModuleKind::Service, "a"),
            ModuleRef::new(ModuleKind::Service, "b"),
        );
        kernel.add_module_dependency(
            ModuleRef::new(ModuleKind::Service, "b"),
            ModuleRef::new(ModuleKind::Service, "a"),
        );

        let err = kernel.start().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Dependency(DependencyError::CyclicDependency { .. })
        ));
    }

    #[tokio::test]
    async fn restart_is_a_no_op_while_running() {
        let kernel = Kernel::new();
        let service = Tracked::new("sessions", ModuleKind::Service);
        kernel.register_service(service.clone(), &empty());

        kernel.start().await.unwrap();
        let first = service.started_at.load(Ordering::SeqCst);
        kernel.start().await.unwrap();
        assert_eq!(service.started_at.load(Ordering::SeqCst), first);
    }

    #[tokio::test]
    async fn failing_module_without_policy_is_skipped() {
        let kernel = Kernel::new();
        let flaky = Tracked::failing("flaky", ModuleKind::Service);
        let solid = Tracked::new("solid", ModuleKind::Service);
        kernel.register_module(flaky.clone(), &empty(), false);
        kernel.register_service(solid.clone(), &empty());

        kernel.start().await.unwrap();
        assert!(!flaky.gate.is_running());
        assert!(solid.gate.is_running());
    }

    #[tokio::test]
    async fn failing_module_with_policy_tears_down() {
        let kernel = Kernel::new();
        let provider = Tracked::new("db", ModuleKind::Provider);
        let flaky = Tracked::failing("flaky", ModuleKind::Service);
        kernel.register_provider(provider.clone(), &empty());
        kernel.register_module(flaky, &empty(), true);

        let err = kernel.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartFailed { .. }));
        // The provider that had started was stopped during teardown.
        assert!(!provider.gate.is_running());
        assert!(provider.stopped_at.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn install_wires_a_descriptor_tree() {
        let root = tempfile::tempdir().unwrap();
        let loader = ModuleLoader::new(root.path());
        for (kind, name) in [
            (ModuleKind::Provider, "object-provider"),
            (ModuleKind::Service, "sessions"),
            (ModuleKind::App, "portal"),
        ] {
            loader.register_factory(kind, name, |ctx: &crate::loader::LoadContext| {
                Ok(Tracked::new(&ctx.descriptor.name, ctx.descriptor.kind)
                    as Arc<dyn crate::lifecycle::ErasedModule>)
            });
        }

        let descriptor = ModuleDescriptor::from_json(
            r#"{
                "name": "portal",
                "type": "app",
                "providers": [{"name": "object-provider", "type": "provider"}],
                "services": [{"name": "sessions", "type": "service"}]
            }"#,
        )
        .unwrap();

        let kernel = Kernel::new();
        kernel.install(&loader, &[descriptor]).unwrap();
        kernel.start().await.unwrap();

        let provider = kernel
            .get_provider::<Tracked>("object-provider", None)
            .unwrap();
        let service = kernel.get_service::<Tracked>("sessions", None).unwrap();
        let app = kernel.get_app::<Tracked>("portal", None).unwrap();
        assert!(provider.gate.is_running());
        assert!(service.gate.is_running());
        assert!(app.gate.is_running());

        let p = provider.started_at.load(Ordering::SeqCst);
        let s = service.started_at.load(Ordering::SeqCst);
        let a = app.started_at.load(Ordering::SeqCst);
        assert!(p < s && s < a, "expected provider < service < app, got {p} {s} {a}");
    }

    #[tokio::test]
    async fn slow_stop_does_not_wedge_shutdown() {
        struct Sluggish {
            gate: LifecycleGate,
        }
        impl Module for Sluggish {
            fn name(&self) -> &str {
                "sluggish"
            }
            fn kind(&self) -> ModuleKind {
                ModuleKind::Service
            }
            fn gate(&self) -> &LifecycleGate {
                &self.gate
            }
            async fn stop(&self, key: &CapabilityKey) -> Result<(), LifecycleError> {
                self.gate.authorize(key)?;
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(())
            }
        }

        let kernel = Kernel::new().with_module_deadline(Duration::from_millis(50));
        kernel.register_service(
            Arc::new(Sluggish {
                gate: LifecycleGate::new(),
            }),
            &empty(),
        );
        kernel.start().await.unwrap();
        // Must return despite the module never finishing its stop.
        kernel.stop().await;
    }
}
