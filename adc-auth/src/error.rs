use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use adc_identity::IdentityError;

/// Wire shape of every auth error response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthErrorBody {
    pub status: u16,
    pub error_key: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Errors raised by the session core and auth endpoints.
#[derive(Debug)]
pub enum AuthError {
    /// Wrong username or password. Never reveals whether the username
    /// exists.
    InvalidCredentials,
    /// The account is temporarily or permanently blocked.
    Blocked {
        blocked_until: Option<i64>,
        permanent: bool,
    },
    /// The access token is past its expiry.
    TokenExpired,
    /// The access token failed to open under any live key.
    InvalidToken(String),
    /// No access cookie was presented where one is required.
    MissingToken,
    /// The refresh token is unknown (revoked, rotated away, or never
    /// issued).
    RefreshTokenNotFound,
    /// The stored refresh token is past its expiry.
    RefreshTokenExpired,
    /// A concurrent rotation won the race for this refresh token.
    RefreshConflict,
    /// The request country differs from the one the refresh token was
    /// issued in. The client must log in again.
    GeoChanged,
    /// OAuth state cookie mismatch (CSRF).
    OAuthStateMismatch,
    /// The OAuth provider rejected the code exchange or profile fetch.
    OAuthExchange(String),
    /// Unknown OAuth provider id.
    UnknownProvider(String),
    /// Request body malformed.
    Validation(String),
    /// Duplicate username or email on registration.
    Conflict(String),
    /// User/record absent.
    NotFound(String),
    /// Unexpected internal failure; logged with a reference id.
    Internal(String),
}

impl AuthError {
    /// Stable machine-readable key.
    pub fn error_key(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::Blocked { permanent: true, .. } => "ACCOUNT_BLOCKED_PERMANENT",
            AuthError::Blocked { .. } => "ACCOUNT_BLOCKED",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::InvalidToken(_) => "INVALID_TOKEN",
            AuthError::MissingToken => "MISSING_TOKEN",
            AuthError::RefreshTokenNotFound => "REFRESH_TOKEN_NOT_FOUND",
            AuthError::RefreshTokenExpired => "REFRESH_TOKEN_EXPIRED",
            AuthError::RefreshConflict => "REFRESH_CONFLICT",
            AuthError::GeoChanged => "GEO_CHANGED",
            AuthError::OAuthStateMismatch => "OAUTH_STATE_MISMATCH",
            AuthError::OAuthExchange(_) => "OAUTH_EXCHANGE_FAILED",
            AuthError::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            AuthError::Validation(_) => "VALIDATION_ERROR",
            AuthError::Conflict(_) => "CONFLICT",
            AuthError::NotFound(_) => "NOT_FOUND",
            AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AuthError::InvalidCredentials
            | AuthError::TokenExpired
            | AuthError::InvalidToken(_)
            | AuthError::MissingToken
            | AuthError::RefreshTokenNotFound
            | AuthError::RefreshTokenExpired
            | AuthError::GeoChanged
            | AuthError::OAuthStateMismatch => StatusCode::UNAUTHORIZED,
            AuthError::Blocked { .. } => StatusCode::FORBIDDEN,
            AuthError::RefreshConflict | AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            AuthError::OAuthExchange(_) => StatusCode::BAD_GATEWAY,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn data(&self) -> Option<serde_json::Value> {
        match self {
            AuthError::Blocked {
                blocked_until,
                permanent,
            } => Some(serde_json::json!({
                "blockedUntil": blocked_until,
                "permanent": permanent,
            })),
            AuthError::GeoChanged => Some(serde_json::json!({ "requireRelogin": true })),
            _ => None,
        }
    }

    fn public_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials => "Invalid username or password".into(),
            AuthError::Blocked { permanent: true, .. } => "Account is permanently blocked".into(),
            AuthError::Blocked { .. } => "Account is temporarily blocked".into(),
            AuthError::TokenExpired => "Access token expired".into(),
            AuthError::InvalidToken(_) => "Access token is invalid".into(),
            AuthError::MissingToken => "No access token presented".into(),
            AuthError::RefreshTokenNotFound => "Refresh token not found".into(),
            AuthError::RefreshTokenExpired => "Refresh token expired".into(),
            AuthError::RefreshConflict => "Refresh token was already rotated".into(),
            AuthError::GeoChanged => "Session country changed; log in again".into(),
            AuthError::OAuthStateMismatch => "OAuth state mismatch".into(),
            AuthError::OAuthExchange(msg) => msg.clone(),
            AuthError::UnknownProvider(id) => format!("Unknown OAuth provider '{id}'"),
            AuthError::Validation(msg) => msg.clone(),
            AuthError::Conflict(msg) => msg.clone(),
            AuthError::NotFound(msg) => msg.clone(),
            // Internal details never reach the wire.
            AuthError::Internal(_) => "Internal error".into(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = AuthErrorBody {
            status: status.as_u16(),
            error_key: self.error_key().to_string(),
            message: self.public_message(),
            data: self.data(),
        };

        if let AuthError::Internal(detail) = &self {
            let reference = uuid::Uuid::new_v4();
            error!(%reference, detail, "Internal auth error");
            body.data = Some(serde_json::json!({ "reference": reference.to_string() }));
        }

        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_key(), self.public_message())
    }
}

impl std::error::Error for AuthError {}

impl From<IdentityError> for AuthError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Conflict(msg) => AuthError::Conflict(msg),
            IdentityError::NotFound { entity, id } => {
                AuthError::NotFound(format!("{entity} '{id}' not found"))
            }
            IdentityError::Validation(msg) => AuthError::Validation(msg),
            IdentityError::InvalidToken(msg) => AuthError::InvalidToken(msg),
            other => AuthError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_keys_distinguish_permanent() {
        let temp = AuthError::Blocked {
            blocked_until: Some(123),
            permanent: false,
        };
        let perm = AuthError::Blocked {
            blocked_until: None,
            permanent: true,
        };
        assert_eq!(temp.error_key(), "ACCOUNT_BLOCKED");
        assert_eq!(perm.error_key(), "ACCOUNT_BLOCKED_PERMANENT");
    }

    #[test]
    fn geo_change_signals_relogin() {
        let data = AuthError::GeoChanged.data().unwrap();
        assert_eq!(data["requireRelogin"], true);
    }

    #[test]
    fn internal_detail_stays_off_the_wire() {
        let err = AuthError::Internal("pool exhausted at 0x7f".into());
        assert_eq!(err.public_message(), "Internal error");
    }
}
