/// Wire-level result codes carried in the `code` field of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    LoginFailed,
    ParamError,
    Forbidden,
    Conflict,
    NotFound,
    MethodNotAllowed,
    ServerError,
    Unauthorized,
    TokenExpired,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "0000",
            ErrorCode::LoginFailed => "1001",
            ErrorCode::ParamError => "1002",
            ErrorCode::Forbidden => "1003",
            ErrorCode::Conflict => "1009",
            ErrorCode::NotFound => "4040",
            ErrorCode::MethodNotAllowed => "4050",
            ErrorCode::ServerError => "5000",
            ErrorCode::Unauthorized => "8888",
            ErrorCode::TokenExpired => "9999",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("token expired")]
    TokenExpired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Optimistic-lock mismatch. Carries the resource's current version so the
    /// client can refresh and retry.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        current_version: Option<i64>,
        current_updated_at: Option<String>,
    },

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("too many login attempts, retry after {retry_after}s")]
    LoginThrottled { retry_after: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn unauthenticated() -> Self {
        AuthError::Unauthorized("Unauthenticated".into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AuthError::Conflict {
            message: message.into(),
            current_version: None,
            current_updated_at: None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::NotFound(_) => ErrorCode::NotFound,
            AuthError::Unauthorized(_) => ErrorCode::Unauthorized,
            AuthError::TokenExpired => ErrorCode::TokenExpired,
            AuthError::Forbidden(_) => ErrorCode::Forbidden,
            AuthError::Duplicate(_) | AuthError::InvalidInput(_) => ErrorCode::ParamError,
            AuthError::Conflict { .. } => ErrorCode::Conflict,
            AuthError::LoginFailed(_) | AuthError::LoginThrottled { .. } => ErrorCode::LoginFailed,
            AuthError::Database(_) | AuthError::Internal(_) => ErrorCode::ServerError,
        }
    }

    /// HTTP status the error is rendered with.
    pub fn status(&self) -> u16 {
        match self {
            AuthError::NotFound(_) => 404,
            AuthError::Unauthorized(_) | AuthError::TokenExpired | AuthError::LoginFailed(_) => 401,
            AuthError::Forbidden(_) => 403,
            AuthError::Duplicate(_) | AuthError::InvalidInput(_) => 422,
            AuthError::Conflict { .. } => 409,
            AuthError::LoginThrottled { .. } => 429,
            AuthError::Database(_) | AuthError::Internal(_) => 500,
        }
    }

    /// Client-facing message. Server-side failures never expose their detail
    /// unless `expose_internal` is set.
    pub fn public_message(&self, expose_internal: bool) -> String {
        match self {
            AuthError::NotFound(msg)
            | AuthError::Unauthorized(msg)
            | AuthError::Forbidden(msg)
            | AuthError::Duplicate(msg)
            | AuthError::InvalidInput(msg)
            | AuthError::LoginFailed(msg) => msg.clone(),
            AuthError::TokenExpired => "Token has expired".into(),
            AuthError::Conflict { message, .. } => message.clone(),
            AuthError::LoginThrottled { retry_after } => {
                format!("Too many login attempts. Please try again in {retry_after} seconds.")
            }
            AuthError::Database(msg) | AuthError::Internal(msg) => {
                if expose_internal {
                    msg.clone()
                } else {
                    "Server error".into()
                }
            }
        }
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, AuthError::Database(_) | AuthError::Internal(_))
    }
}

impl From<rusqlite::Error> for AuthError {
    fn from(e: rusqlite::Error) -> Self {
        AuthError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::Internal(format!("serialization error: {e}"))
    }
}
