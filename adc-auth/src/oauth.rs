use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use tracing::debug;

use crate::error::AuthError;

/// Normalized profile returned by every OAuth provider.
#[derive(Clone, Debug)]
pub struct OAuthUserProfile {
    /// Stable user id at the provider.
    pub provider_user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub avatar: Option<String>,
}

/// One OAuth provider: builds the authorization redirect, exchanges the
/// callback code, and fetches the user profile.
pub trait OAuthProvider: Send + Sync {
    /// Provider id used in routes and in user metadata (`<id>Id`).
    fn id(&self) -> &str;

    /// URL to redirect the browser to, carrying our CSRF state.
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> String;

    /// Exchange an authorization code for a provider access token.
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, AuthError>> + Send + 'a>>;

    /// Fetch the user profile with a provider access token.
    fn user_profile<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<OAuthUserProfile, AuthError>> + Send + 'a>>;
}

/// Providers resolved by id.
#[derive(Clone, Default)]
pub struct OAuthRegistry {
    providers: HashMap<String, Arc<dyn OAuthProvider>>,
}

impl OAuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn OAuthProvider>) -> Self {
        self.providers.insert(provider.id().to_string(), provider);
        self
    }

    pub fn get(&self, id: &str) -> Result<&Arc<dyn OAuthProvider>, AuthError> {
        self.providers
            .get(id)
            .ok_or_else(|| AuthError::UnknownProvider(id.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Random CSRF state: 24 bytes, base64url.
pub fn random_state() -> String {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Endpoint set and claim mapping of a standard authorization-code
/// provider, configured from the module descriptor.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthProviderConfig {
    pub id: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Claim carrying the provider user id (default `sub`, GitHub uses `id`).
    #[serde(default = "default_id_claim")]
    pub id_claim: String,
    /// Claim carrying the display name (default `name`, GitHub uses `login`).
    #[serde(default = "default_username_claim")]
    pub username_claim: String,
    /// Claim carrying the avatar URL, if any.
    #[serde(default)]
    pub avatar_claim: Option<String>,
}

fn default_id_claim() -> String {
    "sub".into()
}
fn default_username_claim() -> String {
    "name".into()
}

#[derive(Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
}

/// Generic authorization-code-flow provider over HTTP.
pub struct HttpOAuthProvider {
    config: OAuthProviderConfig,
    http: reqwest::Client,
}

impl HttpOAuthProvider {
    pub fn new(config: OAuthProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

impl OAuthProvider for HttpOAuthProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn authorization_url(&self, state: &str, redirect_uri: &str) -> String {
        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&state={}",
            self.config.auth_url,
            urlencode(&self.config.client_id),
            urlencode(redirect_uri),
            urlencode(state),
        );
        if !self.config.scopes.is_empty() {
            url.push_str("&scope=");
            url.push_str(&urlencode(&self.config.scopes.join(" ")));
        }
        url
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, AuthError>> + Send + 'a>> {
        Box::pin(async move {
            debug!(provider = %self.config.id, "Exchanging OAuth code");
            let response = self
                .http
                .post(&self.config.token_url)
                .header("accept", "application/json")
                .form(&[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                    ("client_id", &self.config.client_id),
                    ("client_secret", &self.config.client_secret),
                ])
                .send()
                .await
                .map_err(|e| AuthError::OAuthExchange(e.to_string()))?;

            if !response.status().is_success() {
                return Err(AuthError::OAuthExchange(format!(
                    "token endpoint returned {}",
                    response.status()
                )));
            }
            let body: TokenExchangeResponse = response
                .json()
                .await
                .map_err(|e| AuthError::OAuthExchange(e.to_string()))?;
            Ok(body.access_token)
        })
    }

    fn user_profile<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<OAuthUserProfile, AuthError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .http
                .get(&self.config.userinfo_url)
                .bearer_auth(access_token)
                .header("accept", "application/json")
                .header("user-agent", "adc-platform")
                .send()
                .await
                .map_err(|e| AuthError::OAuthExchange(e.to_string()))?;

            if !response.status().is_success() {
                return Err(AuthError::OAuthExchange(format!(
                    "userinfo endpoint returned {}",
                    response.status()
                )));
            }
            let claims: serde_json::Value = response
                .json()
                .await
                .map_err(|e| AuthError::OAuthExchange(e.to_string()))?;

            let provider_user_id = claim_string(&claims, &self.config.id_claim)
                .ok_or_else(|| {
                    AuthError::OAuthExchange(format!(
                        "profile missing '{}' claim",
                        self.config.id_claim
                    ))
                })?;
            let username = claim_string(&claims, &self.config.username_claim)
                .unwrap_or_else(|| format!("{}-{provider_user_id}", self.config.id));

            Ok(OAuthUserProfile {
                provider_user_id,
                username,
                email: claim_string(&claims, "email"),
                avatar: self
                    .config
                    .avatar_claim
                    .as_deref()
                    .and_then(|claim| claim_string(&claims, claim)),
            })
        })
    }
}

/// Read a claim as a string; numeric ids (GitHub) are stringified.
fn claim_string(claims: &serde_json::Value, name: &str) -> Option<String> {
    match claims.get(name)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Minimal percent-encoding for query-string components.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OAuthProviderConfig {
        OAuthProviderConfig {
            id: "acme".into(),
            auth_url: "https://id.acme.test/authorize".into(),
            token_url: "https://id.acme.test/token".into(),
            userinfo_url: "https://id.acme.test/userinfo".into(),
            client_id: "client-1".into(),
            client_secret: "secret".into(),
            scopes: vec!["openid".into(), "email".into()],
            id_claim: default_id_claim(),
            username_claim: default_username_claim(),
            avatar_claim: Some("picture".into()),
        }
    }

    #[test]
    fn authorization_url_carries_state_and_scopes() {
        let provider = HttpOAuthProvider::new(config());
        let url = provider.authorization_url("st4te", "https://app.test/auth/oauth/acme/callback");
        assert!(url.starts_with("https://id.acme.test/authorize?response_type=code"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("scope=openid%20email"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fapp.test%2Fauth%2Foauth%2Facme%2Fcallback"));
    }

    #[test]
    fn registry_resolves_by_id() {
        let registry = OAuthRegistry::new().register(Arc::new(HttpOAuthProvider::new(config())));
        assert!(registry.get("acme").is_ok());
        assert!(matches!(
            registry.get("ghost"),
            Err(AuthError::UnknownProvider(_))
        ));
    }

    #[test]
    fn numeric_provider_ids_are_stringified() {
        let claims = serde_json::json!({"id": 12345, "login": "octocat"});
        assert_eq!(claim_string(&claims, "id"), Some("12345".into()));
        assert_eq!(claim_string(&claims, "login"), Some("octocat".into()));
        assert_eq!(claim_string(&claims, "email"), None);
    }

    #[test]
    fn state_values_are_unique() {
        assert_ne!(random_state(), random_state());
        assert_eq!(random_state().len(), 32);
    }
}
