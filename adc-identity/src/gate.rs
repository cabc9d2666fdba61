use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use crate::error::IdentityError;
use crate::permission::{Action, Scope};
use crate::resolver::PermissionResolver;

/// The identity resource every identity-core operation is checked
/// against.
pub const IDENTITY_RESOURCE: &str = "identity";

/// A verified access-token session, as seen by the identity core.
///
/// Produced by the token service (injected behind [`TokenVerifier`] so the
/// identity core never depends on the sealing implementation).
#[derive(Clone, Debug)]
pub struct VerifiedSession {
    pub user_id: String,
    pub permissions: Vec<String>,
    pub org_id: Option<String>,
}

/// Seam to the token service: verifies an access token and returns the
/// session sealed inside it.
pub trait TokenVerifier: Send + Sync {
    fn verify<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<VerifiedSession, IdentityError>> + Send + 'a>>;
}

/// Per-operation authorization gate.
///
/// Every mutating manager method passes its optional caller token here.
/// A `None` token means a trusted in-process caller (platform bootstrap);
/// a present token is verified and checked against the resolved
/// permissions of its user.
pub struct AccessGate {
    verifier: OnceLock<Arc<dyn TokenVerifier>>,
    resolver: PermissionResolver,
}

impl AccessGate {
    pub fn new(resolver: PermissionResolver) -> Self {
        Self {
            verifier: OnceLock::new(),
            resolver,
        }
    }

    /// Install the token verifier. The first installation wins.
    pub fn set_verifier(&self, verifier: Arc<dyn TokenVerifier>) {
        let _ = self.verifier.set(verifier);
    }

    /// Check a caller token against the `(action, scope)` an operation
    /// requires. Returns the verified session for org-mode checks, or
    /// `None` for trusted (token-less) callers.
    pub async fn require(
        &self,
        token: Option<&str>,
        submanager: &str,
        operation: &str,
        action: Action,
        scope: Scope,
    ) -> Result<Option<VerifiedSession>, IdentityError> {
        let Some(token) = token else {
            return Ok(None);
        };

        let verifier = self.verifier.get().ok_or_else(|| {
            IdentityError::InvalidToken("no token verifier configured".into())
        })?;
        let session = verifier.verify(token).await?;

        let allowed = self
            .resolver
            .has_permission(&session.user_id, action, scope, IDENTITY_RESOURCE)
            .await?;
        if !allowed {
            return Err(IdentityError::Authorization {
                code: format!("identity.{submanager}.{operation}.{action}.denied"),
                message: format!(
                    "user '{}' lacks {action} on {IDENTITY_RESOURCE} ({scope})",
                    session.user_id
                ),
            });
        }
        Ok(Some(session))
    }
}
