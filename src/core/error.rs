use thiserror::Error;

use crate::gateway::GatewayError;

/// Centralized error type for the registration portal.
///
/// The first group of variants is the user-facing rejection taxonomy: the
/// orchestrator terminates a registration attempt with one of these and the
/// front-ends translate them into localized messages via [`AppError::reason_key`].
/// The second group covers infrastructure failures; those are logged with
/// context and shown to users as the generic "service unavailable" message so
/// internals never leak into chat or HTML.
#[derive(Error, Debug)]
pub enum AppError {
    /// Syntactically invalid input (empty username, weak password, unknown language).
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The originating identity already owns an account.
    #[error("Identity has already registered an account")]
    AlreadyRegistered,

    /// The originating identity has a request awaiting administrator approval.
    #[error("A registration for this identity is already awaiting approval")]
    AlreadyPending,

    /// An administrator banned the originating identity from registering.
    #[error("Identity is banned from registering")]
    Banned,

    /// The requested username exists on the voice server.
    #[error("Username is already taken on the server")]
    UsernameTaken,

    /// An administrator denied the request.
    #[error("Registration denied by administrator")]
    DeniedByAdmin,

    /// Transient remote failure; the user may retry later.
    #[error("Voice server unavailable")]
    ServiceUnavailable,

    /// The client template directory has no TeamTalk5.ini inside.
    /// Disables the archive feature only, never the registration itself.
    #[error("Client template is missing its config file: {0}")]
    TemplateMissing(String),

    /// Download token does not exist (or was already cleaned up).
    #[error("Download token not found")]
    TokenNotFound,

    /// Download token exists but its TTL has elapsed.
    #[error("Download token expired")]
    TokenExpired,

    /// Approval request id does not match any pending registration.
    #[error("Pending registration not found or already decided")]
    PendingNotFound,

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database connection pool errors
    #[error("Database pool error: {0}")]
    DatabasePool(#[from] r2d2::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anyhow errors (for general error handling)
    #[error("Application error: {0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Fluent message key for the user-facing rejection variants.
    ///
    /// Infrastructure variants all collapse to `error-service-unavailable`;
    /// the caller is expected to have logged the real error already.
    /// Validation errors carry their own fluent key in the payload.
    pub fn reason_key(&self) -> &str {
        match self {
            AppError::Validation(key) => key,
            AppError::AlreadyRegistered => "error-already-registered",
            AppError::AlreadyPending => "error-already-pending",
            AppError::Banned => "error-banned",
            AppError::UsernameTaken => "error-username-taken",
            AppError::DeniedByAdmin => "error-denied-by-admin",
            AppError::TemplateMissing(_) => "error-service-unavailable",
            AppError::TokenNotFound => "error-token-not-found",
            AppError::TokenExpired => "error-token-expired",
            AppError::PendingNotFound => "error-pending-not-found",
            _ => "error-service-unavailable",
        }
    }

    /// True when the user can fix the problem and retry immediately
    /// (as opposed to being terminally blocked for this identity).
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            AppError::Validation(_) | AppError::UsernameTaken | AppError::ServiceUnavailable
        )
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::UsernameTaken => AppError::UsernameTaken,
            // Everything else from the wire is transient from the user's
            // point of view; details were logged at the gateway boundary.
            _ => AppError::ServiceUnavailable,
        }
    }
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;
