use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::refresh::RefreshTokenStoreErased;

/// Block state reported to callers and mirrored onto user records.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStatus {
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<i64>,
    pub permanent: bool,
    pub reason: String,
}

impl BlockStatus {
    pub fn open() -> Self {
        Self {
            blocked: false,
            blocked_until: None,
            permanent: false,
            reason: String::new(),
        }
    }
}

/// Windows and thresholds for attempt tracking.
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Window for counting failed logins.
    pub login_window: Duration,
    /// Failures within the window before a temporary block.
    pub login_max: u64,
    /// Length of a temporary block.
    pub temp_block: Duration,
    /// Window for counting failed refreshes.
    pub refresh_window: Duration,
    /// Failures within the window before a permanent block.
    pub refresh_max: u64,
    /// TTL of the permanent-block mirror entry in the store.
    pub perm_block: Duration,
    /// How long "was temporarily blocked" escalation state is remembered.
    pub was_blocked_memory: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            login_window: Duration::from_secs(24 * 3600),
            login_max: 3,
            temp_block: Duration::from_secs(3600),
            refresh_window: Duration::from_secs(5 * 60),
            refresh_max: 3,
            perm_block: Duration::from_secs(30 * 24 * 3600),
            was_blocked_memory: Duration::from_secs(24 * 3600),
        }
    }
}

/// Small-set/string-counter storage for attempt state.
///
/// Backed by a shared store in production so counters survive restarts;
/// the in-memory implementation is the fallback.
pub trait AttemptStore: Send + Sync + 'static {
    /// Increment a counter, (re)arming its TTL. Returns the new count.
    fn incr(&self, key: &str, ttl: Duration) -> impl Future<Output = u64> + Send;
    fn get(&self, key: &str) -> impl Future<Output = u64> + Send;
    fn clear(&self, key: &str) -> impl Future<Output = ()> + Send;
    fn set_flag(&self, key: &str, ttl: Duration) -> impl Future<Output = ()> + Send;
    fn has_flag(&self, key: &str) -> impl Future<Output = bool> + Send;
    fn clear_flag(&self, key: &str) -> impl Future<Output = ()> + Send;
    /// Epoch seconds at which a live flag expires.
    fn flag_expires_at(&self, key: &str) -> impl Future<Output = Option<i64>> + Send;
}

/// Object-safe wrapper for `AttemptStore`.
pub trait AttemptStoreErased: Send + Sync {
    fn incr<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = u64> + Send + 'a>>;
    fn get<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = u64> + Send + 'a>>;
    fn clear<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
    fn set_flag<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
    fn has_flag<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
    fn clear_flag<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
    fn flag_expires_at<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<i64>> + Send + 'a>>;
}

impl<T: AttemptStore> AttemptStoreErased for T {
    fn incr<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = u64> + Send + 'a>> {
        Box::pin(AttemptStore::incr(self, key, ttl))
    }
    fn get<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = u64> + Send + 'a>> {
        Box::pin(AttemptStore::get(self, key))
    }
    fn clear<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(AttemptStore::clear(self, key))
    }
    fn set_flag<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(AttemptStore::set_flag(self, key, ttl))
    }
    fn has_flag<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(AttemptStore::has_flag(self, key))
    }
    fn clear_flag<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(AttemptStore::clear_flag(self, key))
    }
    fn flag_expires_at<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<i64>> + Send + 'a>> {
        Box::pin(AttemptStore::flag_expires_at(self, key))
    }
}

/// In-process fallback attempt store with lazy expiry and a periodic
/// cleanup task.
pub struct InMemoryAttemptStore {
    counters: DashMap<String, (u64, Instant)>,
    flags: DashMap<String, Instant>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            flags: DashMap::new(),
        }
    }

    /// Spawn the hourly cleanup task. Stops when `shutdown` fires.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.purge_expired();
                        if removed > 0 {
                            info!(removed, "Purged expired attempt-tracker entries");
                        }
                    }
                }
            }
        })
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len() + self.flags.len();
        self.counters.retain(|_, (_, expires)| *expires > now);
        self.flags.retain(|_, expires| *expires > now);
        before - (self.counters.len() + self.flags.len())
    }
}

impl Default for InMemoryAttemptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptStore for InMemoryAttemptStore {
    fn incr(&self, key: &str, ttl: Duration) -> impl Future<Output = u64> + Send {
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert((0, now + ttl));
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        entry.0 += 1;
        entry.1 = now + ttl;
        let count = entry.0;
        drop(entry);
        std::future::ready(count)
    }

    fn get(&self, key: &str) -> impl Future<Output = u64> + Send {
        let now = Instant::now();
        let count = match self.counters.get(key) {
            Some(entry) if entry.1 > now => entry.0,
            _ => 0,
        };
        std::future::ready(count)
    }

    fn clear(&self, key: &str) -> impl Future<Output = ()> + Send {
        self.counters.remove(key);
        std::future::ready(())
    }

    fn set_flag(&self, key: &str, ttl: Duration) -> impl Future<Output = ()> + Send {
        self.flags.insert(key.to_string(), Instant::now() + ttl);
        std::future::ready(())
    }

    fn has_flag(&self, key: &str) -> impl Future<Output = bool> + Send {
        let live = match self.flags.get(key) {
            Some(expires) => *expires > Instant::now(),
            None => false,
        };
        std::future::ready(live)
    }

    fn clear_flag(&self, key: &str) -> impl Future<Output = ()> + Send {
        self.flags.remove(key);
        std::future::ready(())
    }

    fn flag_expires_at(&self, key: &str) -> impl Future<Output = Option<i64>> + Send {
        let now = Instant::now();
        let expires_at = self.flags.get(key).and_then(|expires| {
            let remaining = expires.checked_duration_since(now)?;
            Some(Utc::now().timestamp() + remaining.as_secs() as i64)
        });
        std::future::ready(expires_at)
    }
}

/// Callbacks invoked on block transitions. Their failures are swallowed —
/// a broken mailer must never break the tracker.
pub trait BlockNotifier: Send + Sync {
    fn block_status_changed<'a>(
        &'a self,
        subject: &'a str,
        status: &'a BlockStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

    fn send_alert<'a>(
        &'a self,
        subject: &'a str,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;
}

/// Counts login and refresh failures per subject, with temporary and
/// escalated permanent blocking.
///
/// State machine per subject:
///
/// ```text
/// OPEN ── fail×3 ──► TEMP_BLOCKED (1h)
/// TEMP_BLOCKED ── timeout ──► WAS_TEMP_BLOCKED
/// WAS_TEMP_BLOCKED ── fail×3 ──► PERM_BLOCKED
/// PERM_BLOCKED — only admin unblock
/// ```
///
/// Three failed refreshes inside their 5-minute window go straight to
/// PERM_BLOCKED, and any permanent transition erases the subject's
/// refresh tokens.
pub struct LoginAttemptTracker {
    store: Arc<dyn AttemptStoreErased>,
    refresh_tokens: Option<Arc<dyn RefreshTokenStoreErased>>,
    notifier: Option<Arc<dyn BlockNotifier>>,
    config: TrackerConfig,
}

impl LoginAttemptTracker {
    pub fn new(store: Arc<dyn AttemptStoreErased>) -> Self {
        Self {
            store,
            refresh_tokens: None,
            notifier: None,
            config: TrackerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the refresh-token store so permanent blocks erase tokens.
    pub fn with_refresh_tokens(mut self, store: Arc<dyn RefreshTokenStoreErased>) -> Self {
        self.refresh_tokens = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn BlockNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Current block status for a subject.
    pub async fn status(&self, subject: &str) -> BlockStatus {
        if self.store.has_flag(&perm_key(subject)).await {
            return BlockStatus {
                blocked: true,
                blocked_until: None,
                permanent: true,
                reason: "too many failed attempts after a temporary block".into(),
            };
        }
        if self.store.has_flag(&temp_key(subject)).await {
            return BlockStatus {
                blocked: true,
                blocked_until: self.store.flag_expires_at(&temp_key(subject)).await,
                permanent: false,
                reason: "too many failed login attempts".into(),
            };
        }
        BlockStatus::open()
    }

    /// Record a failed login. Returns the status after the failure.
    ///
    /// `user_id` is the resolved account id when one exists — permanent
    /// escalation erases that account's refresh tokens. Failures for
    /// unresolved usernames still consume the subject's budget.
    pub async fn record_login_failure(
        &self,
        subject: &str,
        user_id: Option<&str>,
    ) -> BlockStatus {
        let count = self
            .store
            .incr(&login_key(subject), self.config.login_window)
            .await;
        if count < self.config.login_max {
            return BlockStatus::open();
        }

        if self.store.has_flag(&was_key(subject)).await {
            self.block_permanently(subject, user_id).await
        } else {
            self.store
                .set_flag(&temp_key(subject), self.config.temp_block)
                .await;
            self.store
                .set_flag(&was_key(subject), self.config.was_blocked_memory)
                .await;
            self.store.clear(&login_key(subject)).await;

            let status = BlockStatus {
                blocked: true,
                blocked_until: self.store.flag_expires_at(&temp_key(subject)).await,
                permanent: false,
                reason: "too many failed login attempts".into(),
            };
            warn!(subject, "Subject temporarily blocked");
            self.notify(subject, &status).await;
            status
        }
    }

    /// Record a successful login: resets the failure counter. The
    /// escalation memory survives — only an admin unblock clears it.
    pub async fn record_login_success(&self, subject: &str) {
        self.store.clear(&login_key(subject)).await;
    }

    /// Record a failed refresh. Three inside the window block the subject
    /// permanently and erase their refresh tokens.
    pub async fn record_refresh_failure(&self, subject: &str, user_id: Option<&str>) -> BlockStatus {
        let count = self
            .store
            .incr(&refresh_key(subject), self.config.refresh_window)
            .await;
        if count < self.config.refresh_max {
            return BlockStatus::open();
        }
        self.block_permanently(subject, user_id).await
    }

    /// Admin unblock: clears counters, blocks, and the escalation memory.
    pub async fn unblock(&self, subject: &str) {
        self.store.clear(&login_key(subject)).await;
        self.store.clear(&refresh_key(subject)).await;
        self.store.clear_flag(&temp_key(subject)).await;
        self.store.clear_flag(&perm_key(subject)).await;
        self.store.clear_flag(&was_key(subject)).await;
        let status = BlockStatus::open();
        self.notify(subject, &status).await;
    }

    async fn block_permanently(&self, subject: &str, user_id: Option<&str>) -> BlockStatus {
        self.store
            .set_flag(&perm_key(subject), self.config.perm_block)
            .await;
        self.store.clear_flag(&temp_key(subject)).await;
        self.store.clear(&login_key(subject)).await;
        self.store.clear(&refresh_key(subject)).await;

        if let (Some(store), Some(user_id)) = (&self.refresh_tokens, user_id) {
            match store.delete_all_for_user(user_id).await {
                Ok(count) => warn!(subject, count, "Erased refresh tokens on permanent block"),
                Err(err) => warn!(subject, error = %err, "Failed to erase refresh tokens"),
            }
        }

        let status = BlockStatus {
            blocked: true,
            blocked_until: None,
            permanent: true,
            reason: "too many failed attempts after a temporary block".into(),
        };
        warn!(subject, "Subject permanently blocked");
        self.notify(subject, &status).await;
        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.send_alert(subject, &status.reason).await {
                warn!(subject, error = %err, "Alert callback failed");
            }
        }
        status
    }

    async fn notify(&self, subject: &str, status: &BlockStatus) {
        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.block_status_changed(subject, status).await {
                warn!(subject, error = %err, "Block-status callback failed");
            }
        }
    }
}

fn login_key(subject: &str) -> String {
    format!("login_attempt_{subject}")
}
fn refresh_key(subject: &str) -> String {
    format!("refresh_attempt_{subject}")
}
fn temp_key(subject: &str) -> String {
    format!("temp_block_{subject}")
}
fn perm_key(subject: &str) -> String {
    format!("perm_block_{subject}")
}
fn was_key(subject: &str) -> String {
    format!("was_temp_blocked_{subject}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::{InMemoryRefreshTokenStore, RefreshTokenRecord, RefreshTokenStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            login_window: Duration::from_secs(60),
            login_max: 3,
            temp_block: Duration::from_millis(80),
            refresh_window: Duration::from_secs(60),
            refresh_max: 3,
            perm_block: Duration::from_secs(3600),
            was_blocked_memory: Duration::from_secs(3600),
        }
    }

    fn tracker() -> LoginAttemptTracker {
        LoginAttemptTracker::new(Arc::new(InMemoryAttemptStore::new()))
            .with_config(fast_config())
    }

    #[tokio::test]
    async fn three_failures_temp_block_then_escalate_to_permanent() {
        let tracker = tracker();

        // OPEN -> TEMP_BLOCKED after three failures.
        assert!(!tracker.record_login_failure("alice", None).await.blocked);
        assert!(!tracker.record_login_failure("alice", None).await.blocked);
        let third = tracker.record_login_failure("alice", None).await;
        assert!(third.blocked);
        assert!(!third.permanent);
        assert!(third.blocked_until.is_some());

        let status = tracker.status("alice").await;
        assert!(status.blocked && !status.permanent);

        // TEMP_BLOCKED -> WAS_TEMP_BLOCKED after the block expires.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!tracker.status("alice").await.blocked);

        // WAS_TEMP_BLOCKED -> PERM_BLOCKED after three more failures.
        tracker.record_login_failure("alice", None).await;
        tracker.record_login_failure("alice", None).await;
        let escalated = tracker.record_login_failure("alice", None).await;
        assert!(escalated.blocked && escalated.permanent);
        assert!(tracker.status("alice").await.permanent);
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let tracker = tracker();
        tracker.record_login_failure("bob", None).await;
        tracker.record_login_failure("bob", None).await;
        tracker.record_login_success("bob").await;

        // Two fresh failures must not block.
        tracker.record_login_failure("bob", None).await;
        let status = tracker.record_login_failure("bob", None).await;
        assert!(!status.blocked);
    }

    #[tokio::test]
    async fn refresh_failures_block_permanently_and_erase_tokens() {
        let refresh_store = Arc::new(InMemoryRefreshTokenStore::new());
        RefreshTokenStoreErased::create(
            &*refresh_store,
            RefreshTokenRecord {
                token: "r1".into(),
                user_id: "u1".into(),
                device_id: "d".into(),
                ip_address: "ip".into(),
                country: None,
                user_agent: "ua".into(),
                created_at: Utc::now(),
                expires_at: Utc::now() + chrono::Duration::days(1),
            },
        )
        .await
        .unwrap();

        let tracker = LoginAttemptTracker::new(Arc::new(InMemoryAttemptStore::new()))
            .with_config(fast_config())
            .with_refresh_tokens(refresh_store.clone());

        tracker.record_refresh_failure("u1", Some("u1")).await;
        tracker.record_refresh_failure("u1", Some("u1")).await;
        let status = tracker.record_refresh_failure("u1", Some("u1")).await;
        assert!(status.permanent);

        assert!(
            RefreshTokenStoreErased::find_all_for_user(&*refresh_store, "u1")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn unblock_clears_the_escalation_memory() {
        let tracker = tracker();
        for _ in 0..3 {
            tracker.record_login_failure("carol", None).await;
        }
        assert!(tracker.status("carol").await.blocked);

        tracker.unblock("carol").await;
        assert!(!tracker.status("carol").await.blocked);

        // After unblock the next three failures yield a TEMPORARY block,
        // not an escalated permanent one.
        for _ in 0..3 {
            tracker.record_login_failure("carol", None).await;
        }
        let status = tracker.status("carol").await;
        assert!(status.blocked && !status.permanent);
    }

    #[tokio::test]
    async fn notifier_errors_are_swallowed() {
        struct Failing(AtomicUsize);
        impl BlockNotifier for Failing {
            fn block_status_changed<'a>(
                &'a self,
                _subject: &'a str,
                _status: &'a BlockStatus,
            ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Box::pin(std::future::ready(Err("mailer down".into())))
            }
            fn send_alert<'a>(
                &'a self,
                _subject: &'a str,
                _reason: &'a str,
            ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
                Box::pin(std::future::ready(Err("mailer down".into())))
            }
        }

        let notifier = Arc::new(Failing(AtomicUsize::new(0)));
        let tracker = LoginAttemptTracker::new(Arc::new(InMemoryAttemptStore::new()))
            .with_config(fast_config())
            .with_notifier(notifier.clone());

        for _ in 0..3 {
            tracker.record_login_failure("dave", None).await;
        }
        // Transition happened despite the failing callback.
        assert!(tracker.status("dave").await.blocked);
        assert!(notifier.0.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn counter_window_expires() {
        let store = Arc::new(InMemoryAttemptStore::new());
        let tracker = LoginAttemptTracker::new(store.clone()).with_config(TrackerConfig {
            login_window: Duration::from_millis(50),
            ..fast_config()
        });

        tracker.record_login_failure("eve", None).await;
        tracker.record_login_failure("eve", None).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Window expired: the next failure counts as the first.
        let status = tracker.record_login_failure("eve", None).await;
        assert!(!status.blocked);
    }

    #[tokio::test]
    async fn cleanup_task_purges_expired_entries() {
        let store = Arc::new(InMemoryAttemptStore::new());
        store.set_flag("gone", Duration::from_millis(10)).await;
        store.incr("count", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.purge_expired(), 2);
    }
}
