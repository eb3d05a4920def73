use reqwest::{Response, StatusCode};
use thiserror::Error;

/// エラー型
#[derive(Error, Debug)]
pub enum AuthError {
    /// No credential is stored. Callers treat this as the anonymous state.
    #[error("No credential found")]
    TokenMissing,

    #[error("Malformed token: {0}")]
    TokenMalformed(String),

    /// Renewal failed and the session was ended.
    #[error("Session ended: {0}")]
    SessionEnded(#[from] RefreshError),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error (status {status}): {message}")]
    Validation { status: u16, message: String },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AuthError {
    /// Network failures and timeouts; eligible for the single retry hop.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::NetworkError(_) | AuthError::Timeout)
    }

    /// Failures after which the user has to sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(self, AuthError::SessionEnded(_) | AuthError::Unauthorized)
    }

    /// Classifies a non-successful response.
    pub(crate) async fn from_response(response: Response) -> Self {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => AuthError::Unauthorized,
            StatusCode::FORBIDDEN => AuthError::Forbidden(message),
            StatusCode::CONFLICT => AuthError::Conflict(message),
            s if s.is_client_error() => AuthError::Validation {
                status: s.as_u16(),
                message,
            },
            s => AuthError::ApiError {
                status: s.as_u16(),
                message,
            },
        }
    }
}

/// Outcome of a failed renewal. Cloned to every caller that waited on the
/// same in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Refresh token rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Refresh request timed out")]
    Timeout,

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Refresh cancelled by logout")]
    Cancelled,
}
