use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use adc_core::lifecycle::{CapabilityKey, LifecycleGate, Module};
use adc_core::registry::ModuleKind;
use adc_core::{LifecycleError, Profile};
use adc_identity::IdentityService;

use crate::attempts::{
    AttemptStoreErased, BlockNotifier, BlockStatus, InMemoryAttemptStore, LoginAttemptTracker,
    TrackerConfig,
};
use crate::cookies::CookiePolicy;
use crate::keys::KeyStore;
use crate::oauth::OAuthRegistry;
use crate::refresh::{InMemoryRefreshTokenStore, RefreshTokenStoreErased};
use crate::token::TokenService;

/// Shared handler state for the auth endpoints.
#[derive(Clone)]
pub struct AuthState {
    pub tokens: Arc<TokenService>,
    pub keys: Arc<KeyStore>,
    pub identity: Arc<IdentityService>,
    pub tracker: Arc<LoginAttemptTracker>,
    pub oauth: Arc<OAuthRegistry>,
    pub cookies: CookiePolicy,
    /// External base URL, used to build OAuth redirect URIs.
    pub base_url: String,
}

/// Builder for [`AuthSessionsService`].
pub struct AuthSessionsBuilder {
    identity: Arc<IdentityService>,
    keys: Option<Arc<KeyStore>>,
    refresh_store: Option<Arc<dyn RefreshTokenStoreErased>>,
    attempt_store: Option<Arc<dyn AttemptStoreErased>>,
    tracker_config: TrackerConfig,
    notifier: Option<Arc<dyn BlockNotifier>>,
    oauth: OAuthRegistry,
    access_ttl: Option<Duration>,
    refresh_ttl: Option<Duration>,
    profile: Profile,
    base_url: String,
    refresh_domain: Option<String>,
}

impl AuthSessionsBuilder {
    pub fn new(identity: Arc<IdentityService>) -> Self {
        Self {
            identity,
            keys: None,
            refresh_store: None,
            attempt_store: None,
            tracker_config: TrackerConfig::default(),
            notifier: None,
            oauth: OAuthRegistry::new(),
            access_ttl: None,
            refresh_ttl: None,
            profile: Profile::from_env(),
            base_url: "http://localhost:3000".into(),
            refresh_domain: None,
        }
    }

    pub fn key_store(mut self, keys: Arc<KeyStore>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn refresh_store(mut self, store: Arc<dyn RefreshTokenStoreErased>) -> Self {
        self.refresh_store = Some(store);
        self
    }

    /// Inject a shared attempt store (counters survive restarts). Without
    /// one, the in-process fallback with its hourly cleanup task is used.
    pub fn attempt_store(mut self, store: Arc<dyn AttemptStoreErased>) -> Self {
        self.attempt_store = Some(store);
        self
    }

    pub fn tracker_config(mut self, config: TrackerConfig) -> Self {
        self.tracker_config = config;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn BlockNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn oauth(mut self, registry: OAuthRegistry) -> Self {
        self.oauth = registry;
        self
    }

    pub fn access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = Some(ttl);
        self
    }

    pub fn refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = Some(ttl);
        self
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn refresh_cookie_domain(mut self, domain: impl Into<String>) -> Self {
        self.refresh_domain = Some(domain.into());
        self
    }

    pub fn build(self) -> AuthSessionsService {
        let keys = self.keys.unwrap_or_else(|| Arc::new(KeyStore::generate()));
        let (refresh_store, fallback_refresh) = match self.refresh_store {
            Some(store) => (store, None),
            None => {
                let fallback = Arc::new(InMemoryRefreshTokenStore::new());
                (
                    fallback.clone() as Arc<dyn RefreshTokenStoreErased>,
                    Some(fallback),
                )
            }
        };

        let (attempt_store, fallback_store) = match self.attempt_store {
            Some(store) => (store, None),
            None => {
                let fallback = Arc::new(InMemoryAttemptStore::new());
                (
                    fallback.clone() as Arc<dyn AttemptStoreErased>,
                    Some(fallback),
                )
            }
        };

        let notifier = self.notifier.unwrap_or_else(|| {
            Arc::new(IdentityBlockNotifier {
                identity: self.identity.clone(),
            })
        });

        let tracker = Arc::new(
            LoginAttemptTracker::new(attempt_store)
                .with_config(self.tracker_config)
                .with_refresh_tokens(refresh_store.clone())
                .with_notifier(notifier),
        );

        let mut tokens = TokenService::new(keys.clone(), refresh_store);
        if let Some(ttl) = self.access_ttl {
            tokens = tokens.with_access_ttl(ttl);
        }
        if let Some(ttl) = self.refresh_ttl {
            tokens = tokens.with_refresh_ttl(ttl);
        }

        let state = AuthState {
            tokens: Arc::new(tokens),
            keys,
            identity: self.identity,
            tracker,
            oauth: Arc::new(self.oauth),
            cookies: CookiePolicy {
                secure: self.profile.is_prod(),
                refresh_domain: self.refresh_domain,
            },
            base_url: self.base_url.trim_end_matches('/').to_string(),
        };

        AuthSessionsService {
            state,
            lifecycle: LifecycleGate::new(),
            shutdown: CancellationToken::new(),
            fallback_store,
            fallback_refresh,
            cleanup: Mutex::new(None),
        }
    }
}

/// The session service module: owns the token service, the attempt
/// tracker, and the auth endpoint state; wires token verification into
/// the identity core on start.
pub struct AuthSessionsService {
    state: AuthState,
    lifecycle: LifecycleGate,
    shutdown: CancellationToken,
    fallback_store: Option<Arc<InMemoryAttemptStore>>,
    fallback_refresh: Option<Arc<InMemoryRefreshTokenStore>>,
    cleanup: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AuthSessionsService {
    pub fn builder(identity: Arc<IdentityService>) -> AuthSessionsBuilder {
        AuthSessionsBuilder::new(identity)
    }

    /// Handler state for [`crate::handlers::auth_routes`].
    pub fn state(&self) -> AuthState {
        self.state.clone()
    }
}

impl Module for AuthSessionsService {
    fn name(&self) -> &str {
        "auth-sessions"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Service
    }

    fn gate(&self) -> &LifecycleGate {
        &self.lifecycle
    }

    async fn start(&self, key: &CapabilityKey) -> Result<(), LifecycleError> {
        self.lifecycle.authorize(key)?;

        // Identity-core token gating verifies through this token service.
        self.state
            .identity
            .set_token_verifier(self.state.tokens.clone());

        if let Some(store) = &self.fallback_store {
            let handle = store.spawn_cleanup(Duration::from_secs(3600), self.shutdown.clone());
            *self.cleanup.lock().unwrap() = Some(handle);
        }
        if let Some(refresh) = &self.fallback_refresh {
            // Stand-in for the store engine's TTL index on expiresAt.
            let refresh = refresh.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(3600));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            refresh.purge_expired();
                        }
                    }
                }
            });
        }
        info!("Auth sessions service started");
        Ok(())
    }

    async fn stop(&self, key: &CapabilityKey) -> Result<(), LifecycleError> {
        self.lifecycle.authorize(key)?;
        self.shutdown.cancel();
        if let Some(handle) = self.cleanup.lock().unwrap().take() {
            handle.abort();
        }
        Ok(())
    }
}

/// Default block notifier: mirrors block transitions onto the user
/// record. The alert hook only logs — mailing is an external
/// collaborator.
struct IdentityBlockNotifier {
    identity: Arc<IdentityService>,
}

impl BlockNotifier for IdentityBlockNotifier {
    fn block_status_changed<'a>(
        &'a self,
        subject: &'a str,
        status: &'a BlockStatus,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            let users = self.identity.users();
            // Login subjects are usernames, refresh subjects are user ids.
            let user = match users.find_by_username(subject).await {
                Ok(Some(user)) => Some(user),
                _ => users.find_by_id(subject).await.ok().flatten(),
            };
            let Some(user) = user else {
                return Ok(());
            };
            users
                .update_block_status(&user.id, status.blocked_until, status.permanent)
                .await
                .map_err(|e| e.to_string())
        })
    }

    fn send_alert<'a>(
        &'a self,
        subject: &'a str,
        reason: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            info!(subject, reason, "Account block alert");
            Ok(())
        })
    }
}
