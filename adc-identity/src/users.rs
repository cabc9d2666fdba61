use std::sync::Arc;

use argon2::Argon2;
use password_hash::rand_core::OsRng;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use uuid::Uuid;

use crate::error::IdentityError;
use crate::gate::AccessGate;
use crate::model::User;
use crate::permission::{Action, Scope};
use crate::resolver::USERS;
use crate::store::DocumentStoreErased;

/// Reserved username of the platform user that performs privileged
/// initialization. Created once at boot; cannot be deleted.
pub const SYSTEM_USERNAME: &str = "SYSTEM";

/// Request to create a user.
#[derive(Clone, Debug, Default)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub role_ids: Vec<String>,
    pub org_id: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// CRUD over users, credential verification, and block-state mirroring.
pub struct UserManager {
    store: Arc<dyn DocumentStoreErased>,
    gate: Arc<AccessGate>,
}

impl UserManager {
    pub(crate) fn new(store: Arc<dyn DocumentStoreErased>, gate: Arc<AccessGate>) -> Self {
        Self { store, gate }
    }

    /// Create a user. Duplicate usernames and emails conflict.
    pub async fn create_user(
        &self,
        new_user: NewUser,
        token: Option<&str>,
    ) -> Result<User, IdentityError> {
        self.gate
            .require(token, "users", "create", Action::WRITE, Scope::USERS)
            .await?;

        let username = new_user.username.trim().to_string();
        if username.is_empty() {
            return Err(IdentityError::Validation("username must not be empty".into()));
        }
        if new_user.password.is_empty() {
            return Err(IdentityError::Validation("password must not be empty".into()));
        }
        if self.find_by_username(&username).await?.is_some() {
            return Err(IdentityError::Conflict(format!(
                "username '{username}' is already taken"
            )));
        }
        if let Some(email) = &new_user.email {
            if self.find_by_email(email).await?.is_some() {
                return Err(IdentityError::Conflict(format!(
                    "email '{email}' is already registered"
                )));
            }
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            username,
            password_hash: hash_password(&new_user.password)?,
            email: new_user.email,
            role_ids: new_user.role_ids,
            metadata: new_user.metadata,
            org_id: new_user.org_id,
            blocked_until: None,
            permanently_blocked: false,
        };
        self.persist(&user).await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &str, token: Option<&str>) -> Result<User, IdentityError> {
        self.gate
            .require(token, "users", "get", Action::READ, Scope::USERS)
            .await?;
        self.load(user_id).await
    }

    pub async fn get_all_users(&self, token: Option<&str>) -> Result<Vec<User>, IdentityError> {
        self.gate
            .require(token, "users", "list", Action::READ, Scope::USERS)
            .await?;
        let docs = self.store.find_all(USERS).await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(|e| IdentityError::Store(e.to_string())))
            .collect()
    }

    /// Delete a user. The SYSTEM user is never deletable.
    pub async fn delete_user(
        &self,
        user_id: &str,
        token: Option<&str>,
    ) -> Result<(), IdentityError> {
        self.gate
            .require(token, "users", "delete", Action::DELETE, Scope::USERS)
            .await?;
        let user = self.load(user_id).await?;
        if user.username == SYSTEM_USERNAME {
            return Err(IdentityError::Validation(
                "the SYSTEM user cannot be deleted".into(),
            ));
        }
        self.store.delete(USERS, user_id).await?;
        Ok(())
    }

    /// Replace a user's roles.
    pub async fn set_roles(
        &self,
        user_id: &str,
        role_ids: Vec<String>,
        token: Option<&str>,
    ) -> Result<User, IdentityError> {
        self.gate
            .require(token, "users", "update", Action::UPDATE, Scope::USERS)
            .await?;
        let mut user = self.load(user_id).await?;
        user.role_ids = role_ids;
        self.persist(&user).await?;
        Ok(user)
    }

    /// Merge keys into a user's metadata map.
    pub async fn merge_metadata(
        &self,
        user_id: &str,
        entries: serde_json::Map<String, serde_json::Value>,
        token: Option<&str>,
    ) -> Result<User, IdentityError> {
        self.gate
            .require(token, "users", "update", Action::UPDATE, Scope::USERS)
            .await?;
        let mut user = self.load(user_id).await?;
        for (key, value) in entries {
            user.metadata.insert(key, value);
        }
        self.persist(&user).await?;
        Ok(user)
    }

    /// Mirror a block transition onto the user record. Ungated — driven by
    /// the attempt tracker.
    pub async fn update_block_status(
        &self,
        user_id: &str,
        blocked_until: Option<i64>,
        permanent: bool,
    ) -> Result<(), IdentityError> {
        let mut user = self.load(user_id).await?;
        user.blocked_until = blocked_until;
        user.permanently_blocked = permanent;
        self.persist(&user).await
    }

    /// Clear block state (admin unblock).
    pub async fn unblock(&self, user_id: &str, token: Option<&str>) -> Result<(), IdentityError> {
        self.gate
            .require(token, "users", "update", Action::UPDATE, Scope::USERS)
            .await?;
        let mut user = self.load(user_id).await?;
        user.blocked_until = None;
        user.permanently_blocked = false;
        self.persist(&user).await
    }

    pub async fn find_by_id(&self, user_id: &str) -> Result<Option<User>, IdentityError> {
        match self.store.find(USERS, user_id).await? {
            Some(doc) => serde_json::from_value(doc)
                .map(Some)
                .map_err(|e| IdentityError::Store(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, IdentityError> {
        let docs = self
            .store
            .find_by(USERS, "username", &serde_json::Value::String(username.to_string()))
            .await?;
        match docs.into_iter().next() {
            Some(doc) => serde_json::from_value(doc)
                .map(Some)
                .map_err(|e| IdentityError::Store(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, IdentityError> {
        let docs = self
            .store
            .find_by(USERS, "email", &serde_json::Value::String(email.to_string()))
            .await?;
        match docs.into_iter().next() {
            Some(doc) => serde_json::from_value(doc)
                .map(Some)
                .map_err(|e| IdentityError::Store(e.to_string())),
            None => Ok(None),
        }
    }

    /// Find the user whose metadata records the given provider id
    /// (`<provider>Id` convention).
    pub async fn find_by_provider_id(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<Option<User>, IdentityError> {
        let docs = self.store.find_all(USERS).await?;
        for doc in docs {
            let user: User =
                serde_json::from_value(doc).map_err(|e| IdentityError::Store(e.to_string()))?;
            if user.provider_id(provider) == Some(provider_id) {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    /// Verify a username/password pair. Returns the user on success,
    /// `None` on unknown username or wrong password — callers must not be
    /// able to tell the two apart.
    pub async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, IdentityError> {
        let Some(user) = self.find_by_username(username).await? else {
            return Ok(None);
        };
        if verify_password(&user.password_hash, password).await {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    async fn load(&self, user_id: &str) -> Result<User, IdentityError> {
        self.find_by_id(user_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            })
    }

    async fn persist(&self, user: &User) -> Result<(), IdentityError> {
        let doc = serde_json::to_value(user).map_err(|e| IdentityError::Store(e.to_string()))?;
        self.store.insert(USERS, &user.id, doc).await
    }
}

/// Hash a password with argon2id and a fresh salt.
pub fn hash_password(password: &str) -> Result<String, IdentityError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| IdentityError::Store(format!("password hashing failed: {e}")))
}

/// Verify a password against a stored argon2 verifier.
///
/// Runs on a blocking task — argon2 verification is deliberately slow.
pub async fn verify_password(stored_hash: &str, password: &str) -> bool {
    let hash = stored_hash.to_string();
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        let Ok(parsed) = PasswordHash::new(&hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
    .await
    .unwrap_or(false)
}
