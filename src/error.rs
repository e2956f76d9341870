//! Error types surfaced by the session core.
//!
//! `restore` and `logout` never return these; they degrade to the logged-out
//! state and log the cause instead.

use thiserror::Error;

/// Failures of `login` and `register` that the caller is expected to render.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The service rejected the email/password pair (HTTP 401).
    #[error("Incorrect email or password.")]
    InvalidCredentials,

    /// Network failure, unexpected status or an unreadable response.
    #[error("Server unavailable. Please try again. ({0})")]
    ServiceUnavailable(String),

    /// Account creation collided with an existing account.
    #[error("{field} error: {message}")]
    RegistrationConflict { field: String, message: String },

    /// Another session operation is still in flight.
    #[error("Another session operation is already in progress")]
    SessionBusy,
}

impl AuthError {
    pub fn unavailable(detail: impl std::fmt::Display) -> Self {
        AuthError::ServiceUnavailable(detail.to_string())
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;
