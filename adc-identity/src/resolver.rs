use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::IdentityError;
use crate::model::{Group, Role, User};
use crate::permission::{Action, Permission, Scope};
use crate::roles::USER_ROLE;
use crate::store::DocumentStoreErased;

pub(crate) const USERS: &str = "users";
pub(crate) const ROLES: &str = "roles";
pub(crate) const GROUPS: &str = "groups";

/// One resolved grant, annotated with where it came from.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPermission {
    pub resource: String,
    pub action: Action,
    pub scope: Scope,
    pub granted: bool,
    pub source: String,
}

impl ResolvedPermission {
    /// Compact string form carried inside access tokens.
    pub fn encode(&self) -> String {
        Permission::new(self.resource.clone(), self.action, self.scope).encode()
    }
}

/// Flattens a user's direct roles, group memberships, and group roles into
/// a permission set.
///
/// Resolution is pure with respect to the (users, roles, groups) snapshot
/// it reads — no caching, no clock.
#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn DocumentStoreErased>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn DocumentStoreErased>) -> Self {
        Self { store }
    }

    /// Resolve the full permission set for a user.
    ///
    /// Order: the user's direct roles, then groups containing the user,
    /// then the roles attached to each group. Rules sharing
    /// `(resource, scope)` merge by OR-ing their actions. With `org_id`
    /// given, custom roles belonging to a different org are excluded;
    /// predefined roles always apply. A user with no roles at all falls
    /// back to the predefined USER role.
    pub async fn resolve_permissions(
        &self,
        user_id: &str,
        org_id: Option<&str>,
    ) -> Result<Vec<ResolvedPermission>, IdentityError> {
        let user = self.load_user(user_id).await?;

        let mut grants: Vec<(Permission, String)> = Vec::new();

        let mut role_ids = user.role_ids.clone();
        if role_ids.is_empty() {
            if let Some(default_role) = self.find_role_by_name(USER_ROLE).await? {
                role_ids.push(default_role.id);
            }
        }

        for role_id in &role_ids {
            if let Some(role) = self.load_role(role_id).await? {
                if Self::role_applies(&role, org_id) {
                    for permission in &role.permissions {
                        grants.push((permission.clone(), format!("role:{}", role.name)));
                    }
                }
            }
        }

        for group in self.groups_containing(user_id).await? {
            if let Some(permissions) = &group.permissions {
                for permission in permissions {
                    grants.push((permission.clone(), format!("group:{}", group.name)));
                }
            }
            for role_id in &group.role_ids {
                if let Some(role) = self.load_role(role_id).await? {
                    if Self::role_applies(&role, org_id) {
                        for permission in &role.permissions {
                            grants.push((
                                permission.clone(),
                                format!("group:{}/role:{}", group.name, role.name),
                            ));
                        }
                    }
                }
            }
        }

        Ok(merge_grants(grants))
    }

    /// True iff a resolved rule covers `(action, scope, resource)`:
    /// every wanted action bit and scope bit present, resource equal
    /// (or a `*` grant).
    pub async fn has_permission(
        &self,
        user_id: &str,
        action: Action,
        scope: Scope,
        resource: &str,
    ) -> Result<bool, IdentityError> {
        let resolved = self.resolve_permissions(user_id, None).await?;
        Ok(resolved.iter().any(|p| {
            p.granted
                && (p.resource == "*" || p.resource == resource)
                && p.action.grants(action)
                && p.scope.grants(scope)
        }))
    }

    fn role_applies(role: &Role, org_id: Option<&str>) -> bool {
        if !role.is_custom {
            return true;
        }
        match org_id {
            Some(org) => role.org_id.as_deref() == Some(org),
            None => true,
        }
    }

    pub(crate) async fn load_user(&self, user_id: &str) -> Result<User, IdentityError> {
        let doc = self
            .store
            .find(USERS, user_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            })?;
        serde_json::from_value(doc).map_err(|e| IdentityError::Store(e.to_string()))
    }

    pub(crate) async fn load_role(&self, role_id: &str) -> Result<Option<Role>, IdentityError> {
        match self.store.find(ROLES, role_id).await? {
            Some(doc) => serde_json::from_value(doc)
                .map(Some)
                .map_err(|e| IdentityError::Store(e.to_string())),
            None => Ok(None),
        }
    }

    pub(crate) async fn find_role_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Role>, IdentityError> {
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

    async fn groups_containing(&self, user_id: &str) -> Result<Vec<Group>, IdentityError> {
        let docs = self.store.find_all(GROUPS).await?;
        let mut groups = Vec::new();
        for doc in docs {
            let group: Group =
                serde_json::from_value(doc).map_err(|e| IdentityError::Store(e.to_string()))?;
            if group.user_ids.iter().any(|id| id == user_id) {
                groups.push(group);
            }
        }
        Ok(groups)
    }
}

/// Merge grants sharing `(resource, scope)` by OR-ing their actions.
fn merge_grants(grants: Vec<(Permission, String)>) -> Vec<ResolvedPermission> {
    let mut merged: Vec<ResolvedPermission> = Vec::new();
    let mut index: HashMap<(String, Scope), usize> = HashMap::new();

    for (permission, source) in grants {
        let key = (permission.resource.clone(), permission.scope);
        match index.get(&key) {
            Some(&i) => {
                let entry = &mut merged[i];
                entry.action = entry.action | permission.action;
                if !entry.source.contains(source.as_str()) {
                    entry.source.push(',');
                    entry.source.push_str(&source);
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(ResolvedPermission {
                    resource: permission.resource,
                    action: permission.action,
                    scope: permission.scope,
                    granted: true,
                    source,
                });
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_ors_actions_for_same_resource_and_scope() {
        let merged = merge_grants(vec![
            (
                Permission::new("identity", Action::READ, Scope::USERS),
                "role:a".into(),
            ),
            (
                Permission::new("identity", Action::WRITE, Scope::USERS),
                "role:b".into(),
            ),
            (
                Permission::new("identity", Action::READ, Scope::SELF_),
                "role:a".into(),
            ),
        ]);
        assert_eq!(merged.len(), 2);
        let users_rule = merged
            .iter()
            .find(|p| p.scope == Scope::USERS)
            .unwrap();
        assert_eq!(users_rule.action, Action::READ | Action::WRITE);
        assert!(users_rule.source.contains("role:a"));
        assert!(users_rule.source.contains("role:b"));
    }
}
