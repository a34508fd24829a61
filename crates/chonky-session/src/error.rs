use thiserror::Error;

use crate::api::ApiError;
use crate::auth::RefreshError;

/// Errors surfaced by `SessionManager`.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Token renewal failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    #[error("Session expired - please sign in again")]
    SessionExpired,

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("A login is already in progress")]
    LoginInProgress,

    #[error("Login cancelled by logout")]
    LoginCancelled,

    #[error(transparent)]
    Api(ApiError),

    #[error("Credential storage failed: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SessionError {
    /// Classify a failure of the token endpoint. The backend answers bad
    /// credentials with 401, and with 400 for malformed ones.
    pub fn from_login(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized | ApiError::BadRequest(_) | ApiError::AccessDenied(_) => {
                SessionError::InvalidCredentials
            }
            err => Self::from_call(err),
        }
    }

    /// Classify a non-auth failure of an authenticated call.
    pub fn from_call(err: ApiError) -> Self {
        if err.is_transport() {
            SessionError::NetworkFailure(err.to_string())
        } else {
            SessionError::Api(err)
        }
    }

    /// True when the caller has to sign in again before retrying.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::SessionExpired
                | SessionError::NotAuthenticated
                | SessionError::RefreshFailed(_)
                | SessionError::InvalidCredentials
        )
    }
}
