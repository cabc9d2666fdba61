//! Identity core for the ADC platform.
//!
//! Users, roles, and groups live as documents behind a narrow
//! [`DocumentStore`] interface; permissions are `(resource, action, scope)`
//! triples with bitfield action and scope. Every mutating manager method
//! accepts an optional caller token, verified through an injected
//! [`TokenVerifier`] and checked against the caller's resolved
//! permissions.
//!
//! Predefined system roles are created once at boot and are immutable;
//! the SYSTEM user is retrievable only with the kernel capability key.

pub mod error;
pub mod gate;
pub mod groups;
pub mod model;
pub mod permission;
pub mod resolver;
pub mod roles;
pub mod service;
pub mod store;
pub mod users;

pub use error::IdentityError;
pub use gate::{AccessGate, TokenVerifier, VerifiedSession, IDENTITY_RESOURCE};
pub use groups::GroupManager;
pub use model::{Group, Role, User};
pub use permission::{Action, Permission, Scope};
pub use resolver::{PermissionResolver, ResolvedPermission};
pub use roles::{RoleManager, RoleUpdate, PREDEFINED_ROLES, SYSTEM_ROLE, USER_ROLE};
pub use service::IdentityService;
pub use store::{DocumentStore, DocumentStoreErased, InMemoryDocumentStore};
pub use users::{hash_password, verify_password, NewUser, UserManager, SYSTEM_USERNAME};
