use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use adc_identity::gate::{TokenVerifier, VerifiedSession};
use adc_identity::{IdentityError, User};

use crate::error::AuthError;
use crate::keys::{KeyStore, SealingKey};
use crate::refresh::{
    random_refresh_token, RefreshTokenRecord, RefreshTokenStoreErased,
};

const NONCE_LEN: usize = 12;

/// Session metadata sealed alongside the user id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub provider: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

/// The payload sealed inside an access token.
///
/// Permissions are carried as `"<resource>.<scope>.<action>"` strings with
/// decimal bitfields.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessClaims {
    pub user_id: String,
    pub permissions: Vec<String>,
    pub device_id: String,
    pub metadata: SessionMetadata,
    pub iat: i64,
    pub exp: i64,
}

/// Result of a successful access-token verification.
#[derive(Clone, Debug)]
pub struct VerifiedAccess {
    pub claims: AccessClaims,
    /// True when the token only opened under the previous key — the
    /// client should refresh soon.
    pub used_previous_key: bool,
}

/// An issued access/refresh pair.
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_in: Duration,
    pub refresh_expires_in: Duration,
}

/// Network/device context for token issuance.
#[derive(Clone, Debug)]
pub struct IssueContext {
    pub device_id: String,
    pub ip_address: String,
    pub country: Option<String>,
    pub user_agent: String,
}

/// What the refresh path needs back from its user lookup: the (still
/// existing) user and their freshly resolved permission strings.
pub struct SessionSeed {
    pub user: User,
    pub permissions: Vec<String>,
}

/// Creates and verifies sealed access tokens, and rotates refresh tokens.
///
/// Access tokens are an AES-256-GCM envelope over the JSON claims:
/// `base64url(nonce ‖ ciphertext)`. Verification tries the current key
/// and falls back to the previous one, surfacing the fallback so callers
/// can hint the client to refresh.
pub struct TokenService {
    keys: Arc<KeyStore>,
    refresh_store: Arc<dyn RefreshTokenStoreErased>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(keys: Arc<KeyStore>, refresh_store: Arc<dyn RefreshTokenStoreErased>) -> Self {
        Self {
            keys,
            refresh_store,
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }

    /// Override the access-token TTL (default 15 minutes).
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    /// Override the refresh-token TTL (default 30 days).
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn refresh_store(&self) -> &Arc<dyn RefreshTokenStoreErased> {
        &self.refresh_store
    }

    /// Issue an access/refresh pair for a user and persist the refresh
    /// record.
    pub async fn create_token_pair(
        &self,
        user: &User,
        permissions: Vec<String>,
        provider: &str,
        ctx: &IssueContext,
    ) -> Result<TokenPair, AuthError> {
        let access_token = self.mint_access_token(user, permissions, provider, ctx)?;
        let refresh_token = random_refresh_token();

        let now = Utc::now();
        self.refresh_store
            .create(RefreshTokenRecord {
                token: refresh_token.clone(),
                user_id: user.id.clone(),
                device_id: ctx.device_id.clone(),
                ip_address: ctx.ip_address.clone(),
                country: ctx.country.clone(),
                user_agent: ctx.user_agent.clone(),
                created_at: now,
                expires_at: now
                    + chrono::Duration::from_std(self.refresh_ttl)
                        .map_err(|e| AuthError::Internal(e.to_string()))?,
            })
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_in: self.access_ttl,
            refresh_expires_in: self.refresh_ttl,
        })
    }

    /// Seal an access token under the current key.
    pub fn mint_access_token(
        &self,
        user: &User,
        permissions: Vec<String>,
        provider: &str,
        ctx: &IssueContext,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            user_id: user.id.clone(),
            permissions,
            device_id: ctx.device_id.clone(),
            metadata: SessionMetadata {
                provider: provider.to_string(),
                username: user.username.clone(),
                email: user.email.clone(),
                avatar: user
                    .metadata
                    .get("avatar")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                org_id: user.org_id.clone(),
            },
            iat: now,
            exp: now + self.access_ttl.as_secs() as i64,
        };
        seal(&self.keys.current_key(), &claims)
    }

    /// Verify an access token.
    ///
    /// Opens under the current key first. A decryption failure (never an
    /// expiry) falls back to the previous key; success there sets
    /// `used_previous_key` so the caller can signal "refresh required".
    pub fn verify_access_token(&self, token: &str) -> Result<VerifiedAccess, AuthError> {
        let now = Utc::now().timestamp();

        match open(&self.keys.current_key(), token) {
            Ok(claims) => {
                if claims.exp <= now {
                    return Err(AuthError::TokenExpired);
                }
                return Ok(VerifiedAccess {
                    claims,
                    used_previous_key: false,
                });
            }
            Err(_) => {
                let Some(previous) = self.keys.previous_key() else {
                    return Err(AuthError::InvalidToken(
                        "token does not open under the current key".into(),
                    ));
                };
                let claims = open(&previous, token).map_err(|_| {
                    AuthError::InvalidToken("token does not open under any live key".into())
                })?;
                if claims.exp <= now {
                    return Err(AuthError::TokenExpired);
                }
                debug!(user_id = %claims.user_id, "Access token verified with previous key");
                Ok(VerifiedAccess {
                    claims,
                    used_previous_key: true,
                })
            }
        }
    }

    /// Rotate a refresh token and mint a fresh access token.
    ///
    /// The old record must exist and be unexpired; the user must still
    /// exist (otherwise the token is revoked on the spot). The rotation
    /// itself is atomic — of concurrent calls with the same token,
    /// exactly one succeeds and the rest get [`AuthError::RefreshConflict`].
    pub async fn refresh_tokens<F, Fut>(
        &self,
        refresh_token: &str,
        ctx: &IssueContext,
        user_lookup: F,
    ) -> Result<(TokenPair, User), AuthError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<SessionSeed>, AuthError>>,
    {
        let record = self
            .refresh_store
            .find_by_token(refresh_token)
            .await?
            .ok_or(AuthError::RefreshTokenNotFound)?;
        if record.is_expired(Utc::now()) {
            self.refresh_store.revoke(refresh_token).await?;
            return Err(AuthError::RefreshTokenExpired);
        }

        let seed = match user_lookup(record.user_id.clone()).await? {
            Some(seed) => seed,
            None => {
                self.refresh_store.revoke(refresh_token).await?;
                return Err(AuthError::RefreshTokenNotFound);
            }
        };

        let now = Utc::now();
        let new_record = RefreshTokenRecord {
            token: random_refresh_token(),
            user_id: record.user_id.clone(),
            device_id: ctx.device_id.clone(),
            ip_address: ctx.ip_address.clone(),
            country: ctx.country.clone().or(record.country.clone()),
            user_agent: ctx.user_agent.clone(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.refresh_ttl)
                    .map_err(|e| AuthError::Internal(e.to_string()))?,
        };

        let rotated = self
            .refresh_store
            .rotate(refresh_token, new_record)
            .await?
            .ok_or(AuthError::RefreshConflict)?;

        let provider = seed
            .user
            .metadata
            .get("provider")
            .and_then(|v| v.as_str())
            .unwrap_or("native")
            .to_string();
        let access_token =
            self.mint_access_token(&seed.user, seed.permissions, &provider, ctx)?;

        Ok((
            TokenPair {
                access_token,
                refresh_token: rotated.token,
                access_expires_in: self.access_ttl,
                refresh_expires_in: self.refresh_ttl,
            },
            seed.user,
        ))
    }
}

impl TokenVerifier for TokenService {
    fn verify<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<VerifiedSession, IdentityError>> + Send + 'a>> {
        let result = self
            .verify_access_token(token)
            .map(|verified| VerifiedSession {
                user_id: verified.claims.user_id,
                permissions: verified.claims.permissions,
                org_id: verified.claims.metadata.org_id,
            })
            .map_err(|e| IdentityError::InvalidToken(e.to_string()));
        Box::pin(std::future::ready(result))
    }
}

/// Seal claims under a key: `base64url(nonce ‖ AES-256-GCM ciphertext)`.
fn seal(key: &SealingKey, claims: &AccessClaims) -> Result<String, AuthError> {
    let payload =
        serde_json::to_vec(claims).map_err(|e| AuthError::Internal(e.to_string()))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), payload.as_slice())
        .map_err(|_| AuthError::Internal("token sealing failed".into()))?;

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(URL_SAFE_NO_PAD.encode(envelope))
}

/// Open a sealed token under a key.
fn open(key: &SealingKey, token: &str) -> Result<AccessClaims, AuthError> {
    let envelope = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| AuthError::InvalidToken("token is not valid base64url".into()))?;
    if envelope.len() <= NONCE_LEN {
        return Err(AuthError::InvalidToken("token envelope too short".into()));
    }
    let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let payload = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AuthError::InvalidToken("token failed authentication".into()))?;

    serde_json::from_slice(&payload)
        .map_err(|e| AuthError::InvalidToken(format!("sealed payload malformed: {e}")))
}
