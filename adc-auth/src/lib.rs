//! Authenticated session core for the ADC platform.
//!
//! Access tokens are symmetric AEAD envelopes (AES-256-GCM) sealed under
//! the key store's current key; verification falls back to the previous
//! key across a rotation and surfaces a "refresh required" hint. Refresh
//! tokens are opaque, stored, and strictly single-use through atomic
//! rotation. Login and refresh failures feed a per-subject tracker that
//! escalates from temporary to permanent blocks, and a country change on
//! refresh invalidates every session of the user.
//!
//! # Example
//!
//! ```ignore
//! use adc_auth::{auth_routes, AuthSessionsService};
//!
//! let auth = AuthSessionsService::builder(identity.clone())
//!     .base_url("https://platform.example.com")
//!     .build();
//! let router = auth_routes(auth.state());
//! kernel.register_service(Arc::new(auth), &serde_json::Map::new());
//! ```

pub mod attempts;
pub mod cookies;
pub mod error;
pub mod geo;
pub mod handlers;
pub mod keys;
pub mod oauth;
pub mod refresh;
pub mod state;
pub mod token;

pub use attempts::{
    AttemptStore, AttemptStoreErased, BlockNotifier, BlockStatus, InMemoryAttemptStore,
    LoginAttemptTracker, TrackerConfig,
};
pub use cookies::{CookiePolicy, ACCESS_COOKIE, REFRESH_COOKIE};
pub use error::{AuthError, AuthErrorBody};
pub use handlers::{auth_routes, REFRESH_REQUIRED_HEADER};
pub use keys::{random_key, KeyStore, SealingKey};
pub use oauth::{
    HttpOAuthProvider, OAuthProvider, OAuthProviderConfig, OAuthRegistry, OAuthUserProfile,
};
pub use refresh::{
    random_refresh_token, InMemoryRefreshTokenStore, RefreshTokenRecord, RefreshTokenStore,
    RefreshTokenStoreErased,
};
pub use state::{AuthSessionsBuilder, AuthSessionsService, AuthState};
pub use token::{
    AccessClaims, IssueContext, SessionMetadata, SessionSeed, TokenPair, TokenService,
    VerifiedAccess,
};
