use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// A stored refresh token with the device/network context it was issued
/// in. The token string itself is opaque, ≥256 bits of entropy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRecord {
    pub token: String,
    pub user_id: String,
    pub device_id: String,
    pub ip_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Generate an opaque refresh token: 32 random bytes, base64url.
pub fn random_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Persistence interface for refresh tokens.
///
/// `rotate` MUST be atomic: of any number of concurrent rotations of the
/// same token, exactly one observes the old record and writes the new
/// one; the rest see `None`.
pub trait RefreshTokenStore: Send + Sync + 'static {
    fn create(
        &self,
        record: RefreshTokenRecord,
    ) -> impl Future<Output = Result<(), AuthError>> + Send;

    fn find_by_token(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Option<RefreshTokenRecord>, AuthError>> + Send;

    fn revoke(&self, token: &str) -> impl Future<Output = Result<bool, AuthError>> + Send;

    /// Atomically delete `old_token` and insert `new_record`. Returns the
    /// new record, or `None` when another rotation already consumed the
    /// old token.
    fn rotate(
        &self,
        old_token: &str,
        new_record: RefreshTokenRecord,
    ) -> impl Future<Output = Result<Option<RefreshTokenRecord>, AuthError>> + Send;

    fn revoke_all_for_user(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<usize, AuthError>> + Send;

    fn delete_all_for_user(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<usize, AuthError>> + Send;

    fn find_all_for_user(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<RefreshTokenRecord>, AuthError>> + Send;
}

/// Object-safe wrapper for `RefreshTokenStore`.
pub trait RefreshTokenStoreErased: Send + Sync {
    fn create<'a>(
        &'a self,
        record: RefreshTokenRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), AuthError>> + Send + 'a>>;
    fn find_by_token<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RefreshTokenRecord>, AuthError>> + Send + 'a>>;
    fn revoke<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, AuthError>> + Send + 'a>>;
    fn rotate<'a>(
        &'a self,
        old_token: &'a str,
        new_record: RefreshTokenRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RefreshTokenRecord>, AuthError>> + Send + 'a>>;
    fn revoke_all_for_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, AuthError>> + Send + 'a>>;
    fn delete_all_for_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, AuthError>> + Send + 'a>>;
    fn find_all_for_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RefreshTokenRecord>, AuthError>> + Send + 'a>>;
}

impl<T: RefreshTokenStore> RefreshTokenStoreErased for T {
    fn create<'a>(
        &'a self,
        record: RefreshTokenRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), AuthError>> + Send + 'a>> {
        Box::pin(RefreshTokenStore::create(self, record))
    }
    fn find_by_token<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RefreshTokenRecord>, AuthError>> + Send + 'a>>
    {
        Box::pin(RefreshTokenStore::find_by_token(self, token))
    }
    fn revoke<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, AuthError>> + Send + 'a>> {
        Box::pin(RefreshTokenStore::revoke(self, token))
    }
    fn rotate<'a>(
        &'a self,
        old_token: &'a str,
        new_record: RefreshTokenRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RefreshTokenRecord>, AuthError>> + Send + 'a>>
    {
        Box::pin(RefreshTokenStore::rotate(self, old_token, new_record))
    }
    fn revoke_all_for_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, AuthError>> + Send + 'a>> {
        Box::pin(RefreshTokenStore::revoke_all_for_user(self, user_id))
    }
    fn delete_all_for_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, AuthError>> + Send + 'a>> {
        Box::pin(RefreshTokenStore::delete_all_for_user(self, user_id))
    }
    fn find_all_for_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RefreshTokenRecord>, AuthError>> + Send + 'a>>
    {
        Box::pin(RefreshTokenStore::find_all_for_user(self, user_id))
    }
}

/// In-memory refresh-token store.
///
/// The single-use guarantee rides on `DashMap::remove`: exactly one of
/// any number of concurrent removers of the same key gets the value.
/// Expired records are dropped lazily on read.
pub struct InMemoryRefreshTokenStore {
    by_token: DashMap<String, RefreshTokenRecord>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self {
            by_token: DashMap::new(),
        }
    }

    /// Drop expired records. Called opportunistically and from the
    /// tracker's cleanup task.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.by_token.len();
        self.by_token.retain(|_, record| !record.is_expired(now));
        before - self.by_token.len()
    }
}

impl Default for InMemoryRefreshTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshTokenStore for InMemoryRefreshTokenStore {
    fn create(
        &self,
        record: RefreshTokenRecord,
    ) -> impl Future<Output = Result<(), AuthError>> + Send {
        self.by_token.insert(record.token.clone(), record);
        std::future::ready(Ok(()))
    }

    fn find_by_token(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Option<RefreshTokenRecord>, AuthError>> + Send {
        let result = match self.by_token.get(token) {
            Some(entry) if entry.is_expired(Utc::now()) => {
                drop(entry);
                self.by_token.remove(token);
                None
            }
            Some(entry) => Some(entry.value().clone()),
            None => None,
        };
        std::future::ready(Ok(result))
    }

    fn revoke(&self, token: &str) -> impl Future<Output = Result<bool, AuthError>> + Send {
        let removed = self.by_token.remove(token).is_some();
        std::future::ready(Ok(removed))
    }

    fn rotate(
        &self,
        old_token: &str,
        new_record: RefreshTokenRecord,
    ) -> impl Future<Output = Result<Option<RefreshTokenRecord>, AuthError>> + Send {
        // remove() is the linearization point: the caller that gets the
        // old record wins the rotation.
        let result = match self.by_token.remove(old_token) {
            Some(_) => {
                self.by_token
                    .insert(new_record.token.clone(), new_record.clone());
                Some(new_record)
            }
            None => None,
        };
        std::future::ready(Ok(result))
    }

    fn revoke_all_for_user(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<usize, AuthError>> + Send {
        let before = self.by_token.len();
        self.by_token.retain(|_, record| record.user_id != user_id);
        std::future::ready(Ok(before - self.by_token.len()))
    }

    fn delete_all_for_user(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<usize, AuthError>> + Send {
        RefreshTokenStore::revoke_all_for_user(self, user_id)
    }

    fn find_all_for_user(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<RefreshTokenRecord>, AuthError>> + Send {
        let now = Utc::now();
        let result: Vec<RefreshTokenRecord> = self
            .by_token
            .iter()
            .filter(|entry| entry.user_id == user_id && !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        std::future::ready(Ok(result))
    }
}
