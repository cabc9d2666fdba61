use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::IdentityError;
use crate::gate::AccessGate;
use crate::model::Role;
use crate::permission::{Action, Permission, Scope};
use crate::resolver::ROLES;
use crate::store::DocumentStoreErased;

pub const SYSTEM_ROLE: &str = "SYSTEM";
pub const ADMIN_ROLE: &str = "ADMIN";
pub const USER_ROLE: &str = "USER";

/// Names of the predefined system roles, created once at first boot.
pub const PREDEFINED_ROLES: [&str; 8] = [
    SYSTEM_ROLE,
    ADMIN_ROLE,
    "NETWORK_MANAGER",
    "SECURITY_MANAGER",
    "DATA_MANAGER",
    "APP_MANAGER",
    "CONFIG_MANAGER",
    USER_ROLE,
];

fn predefined_permissions(name: &str) -> Vec<Permission> {
    match name {
        SYSTEM_ROLE => vec![Permission::everything()],
        ADMIN_ROLE => vec![
            Permission::new("identity", Action::CRUD, Scope::ALL),
            Permission::new("network", Action::CRUD, Scope::ALL),
            Permission::new("security", Action::CRUD, Scope::ALL),
            Permission::new("data", Action::CRUD, Scope::ALL),
            Permission::new("apps", Action::CRUD, Scope::ALL),
            Permission::new("config", Action::CRUD, Scope::ALL),
        ],
        "NETWORK_MANAGER" => vec![Permission::new("network", Action::CRUD, Scope::ORG)],
        "SECURITY_MANAGER" => vec![
            Permission::new("security", Action::CRUD, Scope::ORG),
            Permission::new("identity", Action::READ, Scope::USERS | Scope::ROLES | Scope::GROUPS),
        ],
        "DATA_MANAGER" => vec![Permission::new("data", Action::CRUD, Scope::ORG)],
        "APP_MANAGER" => vec![Permission::new("apps", Action::CRUD, Scope::ORG)],
        "CONFIG_MANAGER" => vec![Permission::new("config", Action::CRUD, Scope::ORG)],
        USER_ROLE => vec![
            Permission::new("identity", Action::READ, Scope::SELF_),
            Permission::new("apps", Action::READ, Scope::SELF_),
        ],
        _ => Vec::new(),
    }
}

/// Fields of a role that may change after creation.
#[derive(Clone, Debug, Default)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub permissions: Option<Vec<Permission>>,
}

/// CRUD over roles, with predefined-role protection and org scoping.
pub struct RoleManager {
    store: Arc<dyn DocumentStoreErased>,
    gate: Arc<AccessGate>,
}

impl RoleManager {
    pub(crate) fn new(store: Arc<dyn DocumentStoreErased>, gate: Arc<AccessGate>) -> Self {
        Self { store, gate }
    }

    /// Create the predefined roles that do not exist yet. Idempotent;
    /// called at platform boot.
    pub async fn ensure_predefined(&self) -> Result<(), IdentityError> {
        for name in PREDEFINED_ROLES {
            if self.find_by_name(name).await?.is_none() {
                let role = Role {
                    id: Uuid::new_v4().to_string(),
                    name: name.to_string(),
                    description: format!("Predefined {name} role"),
                    permissions: predefined_permissions(name),
                    is_custom: false,
                    org_id: None,
                    created_at: Utc::now(),
                };
                self.persist(&role).await?;
                info!(role = name, "Created predefined role");
            }
        }
        Ok(())
    }

    /// Create a custom role.
    pub async fn create_role(
        &self,
        name: &str,
        description: &str,
        permissions: Vec<Permission>,
        org_id: Option<String>,
        token: Option<&str>,
    ) -> Result<Role, IdentityError> {
        self.gate
            .require(token, "roles", "create", Action::WRITE, Scope::ROLES)
            .await?;

        if name.trim().is_empty() {
            return Err(IdentityError::Validation("role name must not be empty".into()));
        }
        if self.find_by_name(name).await?.is_some() {
            return Err(IdentityError::Conflict(format!("role '{name}' already exists")));
        }

        let role = Role {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            permissions,
            is_custom: true,
            org_id,
            created_at: Utc::now(),
        };
        self.persist(&role).await?;
        Ok(role)
    }

    /// Update a custom role. Predefined roles are immutable; in org mode
    /// the role must belong to the caller's org.
    pub async fn update_role(
        &self,
        role_id: &str,
        update: RoleUpdate,
        token: Option<&str>,
    ) -> Result<Role, IdentityError> {
        let session = self
            .gate
            .require(token, "roles", "update", Action::UPDATE, Scope::ROLES)
            .await?;

        let mut role = self.get_role(role_id).await?;
        if !role.is_custom {
            return Err(IdentityError::CannotModifyPredefined { role: role.name });
        }
        check_org(&role, session.as_ref().and_then(|s| s.org_id.as_deref()), "update")?;

        if let Some(name) = update.name {
            role.name = name;
        }
        if let Some(description) = update.description {
            role.description = description;
        }
        if let Some(permissions) = update.permissions {
            role.permissions = permissions;
        }
        self.persist(&role).await?;
        Ok(role)
    }

    /// Delete a custom role. Predefined roles cannot be deleted.
    pub async fn delete_role(
        &self,
        role_id: &str,
        token: Option<&str>,
    ) -> Result<(), IdentityError> {
        let session = self
            .gate
            .require(token, "roles", "delete", Action::DELETE, Scope::ROLES)
            .await?;

        let role = self.get_role(role_id).await?;
        if !role.is_custom {
            return Err(IdentityError::CannotDeletePredefined { role: role.name });
        }
        check_org(&role, session.as_ref().and_then(|s| s.org_id.as_deref()), "delete")?;

        self.store.delete(ROLES, role_id).await?;
        Ok(())
    }

    pub async fn get_role(&self, role_id: &str) -> Result<Role, IdentityError> {
        let doc = self
            .store
            .find(ROLES, role_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound {
                entity: "role",
                id: role_id.to_string(),
            })?;
        serde_json::from_value(doc).map_err(|e| IdentityError::Store(e.to_string()))
    }

    pub async fn get_all_roles(&self, token: Option<&str>) -> Result<Vec<Role>, IdentityError> {
        self.gate
            .require(token, "roles", "list", Action::READ, Scope::ROLES)
            .await?;
        let docs = self.store.find_all(ROLES).await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(|e| IdentityError::Store(e.to_string())))
            .collect()
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Role>, IdentityError> {
        let docs = self
            .store
            .find_by(ROLES, "name", &serde_json::Value::String(name.to_string()))
            .await?;
        match docs.into_iter().next() {
            Some(doc) => serde_json::from_value(doc)
                .map(Some)
                .map_err(|e| IdentityError::Store(e.to_string())),
            None => Ok(None),
        }
    }

    async fn persist(&self, role: &Role) -> Result<(), IdentityError> {
        let doc = serde_json::to_value(role).map_err(|e| IdentityError::Store(e.to_string()))?;
        self.store.insert(ROLES, &role.id, doc).await
    }
}

fn check_org(role: &Role, caller_org: Option<&str>, operation: &str) -> Result<(), IdentityError> {
    if let Some(org) = caller_org {
        if role.org_id.as_deref() != Some(org) {
            return Err(IdentityError::Authorization {
                code: format!("identity.roles.{operation}.denied"),
                message: format!(
                    "role '{}' does not belong to org '{org}'",
                    role.name
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::AccessGate;
    use crate::resolver::PermissionResolver;
    use crate::store::InMemoryDocumentStore;

    fn manager() -> RoleManager {
        let store: Arc<dyn DocumentStoreErased> = Arc::new(InMemoryDocumentStore::new());
        let gate = Arc::new(AccessGate::new(PermissionResolver::new(store.clone())));
        RoleManager::new(store, gate)
    }

    #[tokio::test]
    async fn ensure_predefined_is_idempotent() {
        let roles = manager();
        roles.ensure_predefined().await.unwrap();
        roles.ensure_predefined().await.unwrap();
        let all = roles.get_all_roles(None).await.unwrap();
        assert_eq!(all.len(), PREDEFINED_ROLES.len());
        assert!(all.iter().all(|r| !r.is_custom));
    }

    #[tokio::test]
    async fn predefined_roles_are_immutable() {
        let roles = manager();
        roles.ensure_predefined().await.unwrap();
        let admin = roles.find_by_name(ADMIN_ROLE).await.unwrap().unwrap();

        let err = roles
            .update_role(&admin.id, RoleUpdate::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::CannotModifyPredefined { .. }));

        let err = roles.delete_role(&admin.id, None).await.unwrap_err();
        assert!(matches!(err, IdentityError::CannotDeletePredefined { .. }));
    }

    #[tokio::test]
    async fn custom_roles_update_and_delete() {
        let roles = manager();
        let limited = roles
            .create_role(
                "limited",
                "read-only users",
                vec![Permission::new("identity", Action::READ, Scope::USERS)],
                None,
                None,
            )
            .await
            .unwrap();
        assert!(limited.is_custom);

        let updated = roles
            .update_role(
                &limited.id,
                RoleUpdate {
                    description: Some("still read-only".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.description, "still read-only");

        roles.delete_role(&limited.id, None).await.unwrap();
        assert!(roles.find_by_name("limited").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_role_name_conflicts() {
        let roles = manager();
        roles
            .create_role("ops", "", vec![], None, None)
            .await
            .unwrap();
        let err = roles
            .create_role("ops", "", vec![], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Conflict(_)));
    }

    #[test]
    fn system_role_has_a_wildcard_grant() {
        let perms = predefined_permissions(SYSTEM_ROLE);
        assert_eq!(perms, vec![Permission::everything()]);
    }
}
