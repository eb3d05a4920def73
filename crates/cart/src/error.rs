use storefront_auth::AuthError;
use thiserror::Error;

/// エラー型
#[derive(Error, Debug)]
pub enum CartError {
    /// The server kept answering 409 until the attempt budget ran out.
    #[error("Cart is busy, gave up after {attempts} attempts")]
    ConflictExhausted { attempts: u32 },

    #[error("Invalid cart change (status {status}): {message}")]
    Validation { status: u16, message: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The session ended while the request was in flight; its answer was
    /// discarded.
    #[error("Session ended before the cart was updated")]
    SessionEnded,

    #[error(transparent)]
    Auth(AuthError),
}

impl From<AuthError> for CartError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Forbidden(message) => CartError::Forbidden(message),
            AuthError::Validation { status, message } => CartError::Validation { status, message },
            other => CartError::Auth(other),
        }
    }
}
