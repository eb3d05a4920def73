//! Error handling for the storefront client

use std::fmt;
use storefront_auth::{AuthError, RefreshError};
use storefront_cart::CartError;
use thiserror::Error;

/// Unified error type for the storefront client
#[derive(Error, Debug)]
pub enum Error {
    /// Network or HTTP related errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Token refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Cart error: {0}")]
    Cart(#[from] CartError),

    /// Missing or invalid settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

/// 結果型
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new general error
    pub fn general<T: fmt::Display>(msg: T) -> Self {
        Error::General(msg.to_string())
    }

    /// Whether the user has to sign in again.
    pub fn requires_login(&self) -> bool {
        match self {
            Error::Auth(err) => err.requires_login(),
            Error::Refresh(RefreshError::Cancelled) => false,
            Error::Refresh(_) => true,
            Error::Cart(CartError::SessionEnded) => true,
            Error::Cart(CartError::Auth(err)) => err.requires_login(),
            _ => false,
        }
    }

    /// A message that can be shown to the shopper as is.
    pub fn user_message(&self) -> String {
        if self.requires_login() {
            return "Your session has expired. Please sign in again.".to_string();
        }
        match self {
            Error::Cart(CartError::ConflictExhausted { .. }) => {
                "Your cart is being updated elsewhere. Please try again in a moment.".to_string()
            }
            Error::Cart(CartError::Validation { message, .. }) if !message.is_empty() => {
                message.clone()
            }
            Error::Cart(CartError::Validation { .. }) => {
                "That change to your cart is not possible.".to_string()
            }
            Error::Cart(CartError::Forbidden(_)) | Error::Auth(AuthError::Forbidden(_)) => {
                "You are not allowed to do that.".to_string()
            }
            Error::Http(_) => "Network problem. Check your connection and try again.".to_string(),
            Error::Auth(err) | Error::Cart(CartError::Auth(err)) if err.is_transient() => {
                "Network problem. Check your connection and try again.".to_string()
            }
            Error::Config(_) => "The store is temporarily unavailable.".to_string(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_errors_ask_for_login() {
        let refresh = Error::from(RefreshError::Rejected {
            status: 401,
            message: "revoked".to_string(),
        });
        assert!(refresh.requires_login());
        assert_eq!(
            refresh.user_message(),
            "Your session has expired. Please sign in again."
        );

        assert!(Error::from(CartError::SessionEnded).requires_login());
        assert!(!Error::from(RefreshError::Cancelled).requires_login());
    }

    #[test]
    fn test_cart_messages() {
        let busy = Error::from(CartError::ConflictExhausted { attempts: 3 });
        assert!(busy.user_message().contains("try again"));

        let stock = Error::from(CartError::Validation {
            status: 422,
            message: "Only 2 left in stock".to_string(),
        });
        assert_eq!(stock.user_message(), "Only 2 left in stock");

        let timeout = Error::from(CartError::Auth(AuthError::Timeout));
        assert!(timeout.user_message().starts_with("Network problem"));
    }
}
