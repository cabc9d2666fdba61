use std::sync::Arc;

use uuid::Uuid;

use crate::error::IdentityError;
use crate::gate::AccessGate;
use crate::model::Group;
use crate::permission::{Action, Permission, Scope};
use crate::resolver::GROUPS;
use crate::store::DocumentStoreErased;

/// CRUD over groups plus membership management.
pub struct GroupManager {
    store: Arc<dyn DocumentStoreErased>,
    gate: Arc<AccessGate>,
}

impl GroupManager {
    pub(crate) fn new(store: Arc<dyn DocumentStoreErased>, gate: Arc<AccessGate>) -> Self {
        Self { store, gate }
    }

    pub async fn create_group(
        &self,
        name: &str,
        description: &str,
        role_ids: Vec<String>,
        permissions: Option<Vec<Permission>>,
        org_id: Option<String>,
        token: Option<&str>,
    ) -> Result<Group, IdentityError> {
        self.gate
            .require(token, "groups", "create", Action::WRITE, Scope::GROUPS)
            .await?;

        if name.trim().is_empty() {
            return Err(IdentityError::Validation("group name must not be empty".into()));
        }

        let group = Group {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            role_ids,
            permissions,
            user_ids: Vec::new(),
            org_id,
        };
        self.persist(&group).await?;
        Ok(group)
    }

    pub async fn get_group(&self, group_id: &str) -> Result<Group, IdentityError> {
        let doc = self
            .store
            .find(GROUPS, group_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound {
                entity: "group",
                id: group_id.to_string(),
            })?;
        serde_json::from_value(doc).map_err(|e| IdentityError::Store(e.to_string()))
    }

    pub async fn get_all_groups(&self, token: Option<&str>) -> Result<Vec<Group>, IdentityError> {
        self.gate
            .require(token, "groups", "list", Action::READ, Scope::GROUPS)
            .await?;
        let docs = self.store.find_all(GROUPS).await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(|e| IdentityError::Store(e.to_string())))
            .collect()
    }

    pub async fn delete_group(
        &self,
        group_id: &str,
        token: Option<&str>,
    ) -> Result<(), IdentityError> {
        self.gate
            .require(token, "groups", "delete", Action::DELETE, Scope::GROUPS)
            .await?;
        if !self.store.delete(GROUPS, group_id).await? {
            return Err(IdentityError::NotFound {
                entity: "group",
                id: group_id.to_string(),
            });
        }
        Ok(())
    }

    /// Attach a role to a group. No-op when already attached.
    pub async fn add_role(
        &self,
        group_id: &str,
        role_id: &str,
        token: Option<&str>,
    ) -> Result<Group, IdentityError> {
        self.gate
            .require(token, "groups", "update", Action::UPDATE, Scope::GROUPS)
            .await?;
        let mut group = self.get_group(group_id).await?;
        if !group.role_ids.iter().any(|id| id == role_id) {
            group.role_ids.push(role_id.to_string());
            self.persist(&group).await?;
        }
        Ok(group)
    }

    /// Add a user to a group. No-op when already a member.
    pub async fn add_member(
        &self,
        group_id: &str,
        user_id: &str,
        token: Option<&str>,
    ) -> Result<Group, IdentityError> {
        self.gate
            .require(token, "groups", "update", Action::UPDATE, Scope::GROUPS)
            .await?;
        let mut group = self.get_group(group_id).await?;
        if !group.user_ids.iter().any(|id| id == user_id) {
            group.user_ids.push(user_id.to_string());
            self.persist(&group).await?;
        }
        Ok(group)
    }

    pub async fn remove_member(
        &self,
        group_id: &str,
        user_id: &str,
        token: Option<&str>,
    ) -> Result<Group, IdentityError> {
        self.gate
            .require(token, "groups", "update", Action::UPDATE, Scope::GROUPS)
            .await?;
        let mut group = self.get_group(group_id).await?;
        group.user_ids.retain(|id| id != user_id);
        self.persist(&group).await?;
        Ok(group)
    }

    async fn persist(&self, group: &Group) -> Result<(), IdentityError> {
        let doc = serde_json::to_value(group).map_err(|e| IdentityError::Store(e.to_string()))?;
        self.store.insert(GROUPS, &group.id, doc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::PermissionResolver;
    use crate::store::InMemoryDocumentStore;

    fn manager() -> GroupManager {
        let store: Arc<dyn DocumentStoreErased> = Arc::new(InMemoryDocumentStore::new());
        let gate = Arc::new(AccessGate::new(PermissionResolver::new(store.clone())));
        GroupManager::new(store, gate)
    }

    #[tokio::test]
    async fn membership_round_trip() {
        let groups = manager();
        let g = groups
            .create_group("ops", "operations", vec!["r1".into()], None, None, None)
            .await
            .unwrap();

        let g = groups.add_member(&g.id, "u1", None).await.unwrap();
        assert_eq!(g.user_ids, ["u1"]);

        // Adding twice stays a single membership.
        let g = groups.add_member(&g.id, "u1", None).await.unwrap();
        assert_eq!(g.user_ids, ["u1"]);

        let g = groups.remove_member(&g.id, "u1", None).await.unwrap();
        assert!(g.user_ids.is_empty());
    }

    #[tokio::test]
    async fn delete_missing_group_is_not_found() {
        let groups = manager();
        let err = groups.delete_group("ghost", None).await.unwrap_err();
        assert!(matches!(err, IdentityError::NotFound { .. }));
    }
}
