use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::permission::Permission;

/// A role: a named bundle of permissions.
///
/// Predefined system roles have `is_custom = false` and can be neither
/// modified nor deleted. Custom roles may belong to an organization.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A group: aggregates role membership for batches of users.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<Permission>>,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

/// A platform user.
///
/// `metadata` carries provider-specific identifiers (`<provider>Id`),
/// avatar URLs, and the provider through which the account was first
/// created. The password field holds an argon2id verifier, never a
/// plaintext.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub role_ids: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<i64>,
    #[serde(default)]
    pub permanently_blocked: bool,
}

impl User {
    /// Public profile view: everything except the password verifier.
    pub fn profile(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("passwordHash");
        }
        value
    }

    /// Provider id recorded in metadata, e.g. `googleId`.
    pub fn provider_id(&self, provider: &str) -> Option<&str> {
        self.metadata
            .get(&format!("{provider}Id"))
            .and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_hides_the_password_hash() {
        let user = User {
            id: "u1".into(),
            username: "alice".into(),
            password_hash: "$argon2id$...".into(),
            email: Some("alice@example.com".into()),
            role_ids: vec![],
            metadata: serde_json::Map::new(),
            org_id: None,
            blocked_until: None,
            permanently_blocked: false,
        };
        let profile = user.profile();
        assert!(profile.get("passwordHash").is_none());
        assert_eq!(profile["username"], "alice");
    }

    #[test]
    fn provider_id_reads_metadata_convention() {
        let mut metadata = serde_json::Map::new();
        metadata.insert("googleId".into(), serde_json::json!("g-123"));
        metadata.insert("provider".into(), serde_json::json!("google"));
        let user = User {
            id: "u1".into(),
            username: "alice".into(),
            password_hash: String::new(),
            email: None,
            role_ids: vec![],
            metadata,
            org_id: None,
            blocked_until: None,
            permanently_blocked: false,
        };
        assert_eq!(user.provider_id("google"), Some("g-123"));
        assert_eq!(user.provider_id("github"), None);
    }

    #[test]
    fn wire_format_is_camel_case() {
        let role = Role {
            id: "r1".into(),
            name: "ADMIN".into(),
            description: String::new(),
            permissions: vec![],
            is_custom: false,
            org_id: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&role).unwrap();
        assert!(json.get("isCustom").is_some());
        assert!(json.get("createdAt").is_some());
    }
}
