use std::fmt;

/// Errors raised by the identity core.
#[derive(Debug)]
pub enum IdentityError {
    /// The backing document store failed.
    Store(String),
    /// The requested user/role/group does not exist.
    NotFound { entity: &'static str, id: String },
    /// Duplicate username or email.
    Conflict(String),
    /// The caller's token lacks the permission the operation requires.
    /// `code` is stable and machine-readable,
    /// e.g. `identity.users.delete.DELETE.denied`.
    Authorization { code: String, message: String },
    /// Predefined roles cannot be updated.
    CannotModifyPredefined { role: String },
    /// Predefined roles cannot be deleted.
    CannotDeletePredefined { role: String },
    /// The request payload is malformed.
    Validation(String),
    /// The presented token failed verification.
    InvalidToken(String),
}

impl IdentityError {
    /// Stable machine-readable key for wire responses.
    pub fn error_key(&self) -> &str {
        match self {
            IdentityError::Store(_) => "STORE_ERROR",
            IdentityError::NotFound { .. } => "NOT_FOUND",
            IdentityError::Conflict(_) => "CONFLICT",
            IdentityError::Authorization { code, .. } => code,
            IdentityError::CannotModifyPredefined { .. } => "CANNOT_MODIFY_PREDEFINED",
            IdentityError::CannotDeletePredefined { .. } => "CANNOT_DELETE_PREDEFINED",
            IdentityError::Validation(_) => "VALIDATION_ERROR",
            IdentityError::InvalidToken(_) => "INVALID_TOKEN",
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Store(msg) => write!(f, "Document store error: {msg}"),
            IdentityError::NotFound { entity, id } => write!(f, "{entity} '{id}' not found"),
            IdentityError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            IdentityError::Authorization { code, message } => {
                write!(f, "Authorization denied ({code}): {message}")
            }
            IdentityError::CannotModifyPredefined { role } => {
                write!(f, "Predefined role '{role}' cannot be modified")
            }
            IdentityError::CannotDeletePredefined { role } => {
                write!(f, "Predefined role '{role}' cannot be deleted")
            }
            IdentityError::Validation(msg) => write!(f, "Validation error: {msg}"),
            IdentityError::InvalidToken(msg) => write!(f, "Invalid token: {msg}"),
        }
    }
}

impl std::error::Error for IdentityError {}
