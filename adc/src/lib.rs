//! ADC platform — a modular application platform.
//!
//! This facade crate re-exports the platform sub-crates through a single
//! dependency with feature flags:
//!
//! | Feature    | Default | Crate          |
//! |------------|---------|----------------|
//! | `identity` | **yes** | `adc-identity` |
//! | `auth`     | **yes** | `adc-auth`     |
//! | `executor` | no      | `adc-executor` |
//! | `ipc`      | no      | `adc-ipc`      |
//! | `full`     | no      | All of the above |
//!
//! Import everything you need with:
//!
//! ```ignore
//! use adc::prelude::*;
//! ```

pub extern crate adc_core;

// Re-export everything from adc-core at the top level for convenience.
pub use adc_core::*;

#[cfg(feature = "identity")]
pub use adc_identity;

#[cfg(feature = "auth")]
pub use adc_auth;

#[cfg(feature = "executor")]
pub use adc_executor;

#[cfg(feature = "ipc")]
pub use adc_ipc;

/// Unified prelude — import everything with `use adc::prelude::*`.
pub mod prelude {
    pub use adc_core::prelude::*;

    #[cfg(feature = "identity")]
    pub use adc_identity::{
        Action, IdentityError, IdentityService, InMemoryDocumentStore, NewUser, Permission,
        Scope, SYSTEM_USERNAME,
    };

    #[cfg(feature = "auth")]
    pub use adc_auth::{
        auth_routes, AuthError, AuthSessionsService, AuthState, KeyStore, TokenService,
    };

    #[cfg(feature = "executor")]
    pub use adc_executor::{MethodRegistry, PoolConfig, WorkerPool, WorkerProxy};

    #[cfg(feature = "ipc")]
    pub use adc_ipc::{pipe_path, IpcMessage};
}
