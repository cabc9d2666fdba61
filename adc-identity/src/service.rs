use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

use adc_core::lifecycle::{CapabilityKey, LifecycleGate, Module};
use adc_core::registry::ModuleKind;
use adc_core::LifecycleError;

use crate::error::IdentityError;
use crate::gate::{AccessGate, TokenVerifier};
use crate::groups::GroupManager;
use crate::model::User;
use crate::resolver::PermissionResolver;
use crate::roles::{RoleManager, SYSTEM_ROLE};
use crate::store::{DocumentStore, DocumentStoreErased};
use crate::users::{NewUser, UserManager, SYSTEM_USERNAME};

/// The identity service: users, roles, groups, and permission resolution
/// behind per-operation token gating.
///
/// Runs as a kernel service module; its `start` performs the idempotent
/// identity bootstrap (predefined roles + SYSTEM user). The SYSTEM user
/// can only be retrieved by callers presenting the kernel capability key.
pub struct IdentityService {
    users: UserManager,
    roles: RoleManager,
    groups: GroupManager,
    resolver: PermissionResolver,
    gate: Arc<AccessGate>,
    lifecycle: LifecycleGate,
}

impl IdentityService {
    pub fn new(store: impl DocumentStore) -> Self {
        Self::with_store(Arc::new(store))
    }

    pub fn with_store(store: Arc<dyn DocumentStoreErased>) -> Self {
        let resolver = PermissionResolver::new(store.clone());
        let gate = Arc::new(AccessGate::new(resolver.clone()));
        Self {
            users: UserManager::new(store.clone(), gate.clone()),
            roles: RoleManager::new(store.clone(), gate.clone()),
            groups: GroupManager::new(store, gate.clone()),
            resolver,
            gate,
            lifecycle: LifecycleGate::new(),
        }
    }

    /// Install the token verifier used for per-operation gating.
    pub fn set_token_verifier(&self, verifier: Arc<dyn TokenVerifier>) {
        self.gate.set_verifier(verifier);
    }

    pub fn users(&self) -> &UserManager {
        &self.users
    }

    pub fn roles(&self) -> &RoleManager {
        &self.roles
    }

    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    /// Create predefined roles and the SYSTEM user when absent.
    /// Idempotent; normally driven by `start`.
    pub async fn bootstrap(&self) -> Result<(), IdentityError> {
        self.roles.ensure_predefined().await?;

        if self.users.find_by_username(SYSTEM_USERNAME).await?.is_none() {
            let system_role = self
                .roles
                .find_by_name(SYSTEM_ROLE)
                .await?
                .ok_or_else(|| IdentityError::Store("SYSTEM role missing after bootstrap".into()))?;

            // Random password: the SYSTEM user never logs in with
            // credentials, it is retrieved via the capability key.
            let password: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(48)
                .map(char::from)
                .collect();

            self.users
                .create_user(
                    NewUser {
                        username: SYSTEM_USERNAME.into(),
                        password,
                        role_ids: vec![system_role.id],
                        ..Default::default()
                    },
                    None,
                )
                .await?;
            info!("Created SYSTEM user");
        }
        Ok(())
    }

    /// Retrieve the SYSTEM user. Refused unless the caller presents the
    /// kernel capability key.
    pub async fn system_user(
        &self,
        presented: &CapabilityKey,
    ) -> Result<User, IdentityError> {
        self.lifecycle
            .authorize(presented)
            .map_err(|_| IdentityError::Authorization {
                code: "identity.system.get.denied".into(),
                message: "SYSTEM user requires the kernel capability key".into(),
            })?;
        self.users
            .find_by_username(SYSTEM_USERNAME)
            .await?
            .ok_or(IdentityError::NotFound {
                entity: "user",
                id: SYSTEM_USERNAME.into(),
            })
    }
}

impl Module for IdentityService {
    fn name(&self) -> &str {
        "identity"
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Service
    }

    fn gate(&self) -> &LifecycleGate {
        &self.lifecycle
    }

    async fn start(&self, key: &CapabilityKey) -> Result<(), LifecycleError> {
        self.lifecycle.authorize(key)?;
        self.bootstrap()
            .await
            .map_err(|e| LifecycleError::StartFailed {
                module: "identity".into(),
                reason: e.to_string(),
            })
    }
}
