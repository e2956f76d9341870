use crate::api::{ApiClient, ApiError};
use crate::error::{AuthError, AuthResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Token pair returned by the authenticate and refresh endpoints.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access: String,
    /// Long-lived credential, when the server hands it to the client instead
    /// of setting a cookie.
    #[serde(default)]
    pub refresh: Option<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Remote credential service the session manager talks to.
/// A trait so the manager can run against a test double.
pub trait CredentialService: Send + Sync {
    /// Exchange the long-lived credential (explicit, or ambient cookie when
    /// `None`) for a fresh access credential.
    fn refresh(&self, long_lived: Option<&str>) -> AuthResult<TokenGrant>;
    fn authenticate(&self, email: &str, password: &str) -> AuthResult<TokenGrant>;
    fn create_account(&self, username: &str, email: &str, password: &str) -> AuthResult<()>;
    fn invalidate(&self, long_lived: Option<&str>) -> AuthResult<()>;
}

pub struct HttpCredentialService {
    api: Arc<ApiClient>,
}

impl HttpCredentialService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }
}

fn long_lived_body(long_lived: Option<&str>) -> Value {
    match long_lived {
        Some(token) => json!({ "refresh": token }),
        None => json!({}),
    }
}

/// Pick the conflicting field the way the registration form reports it:
/// username first, then email, then whatever else the server named.
fn registration_conflict(fields: &Map<String, Value>) -> Option<AuthError> {
    let field = ["username", "email"]
        .iter()
        .find(|name| fields.contains_key(**name))
        .map(|name| name.to_string())
        .or_else(|| fields.keys().next().cloned())?;
    let message = match &fields[&field] {
        Value::Array(items) => items.first().and_then(|m| m.as_str()).unwrap_or_default(),
        Value::String(s) => s.as_str(),
        _ => "",
    };
    let message = if message.is_empty() {
        "rejected".to_string()
    } else {
        message.to_string()
    };
    Some(AuthError::RegistrationConflict { field, message })
}

impl CredentialService for HttpCredentialService {
    fn refresh(&self, long_lived: Option<&str>) -> AuthResult<TokenGrant> {
        self.api
            .post_json("users/token/refresh/", &long_lived_body(long_lived))
            .map_err(AuthError::unavailable)
    }

    fn authenticate(&self, email: &str, password: &str) -> AuthResult<TokenGrant> {
        let body = json!({ "email": email, "password": password });
        self.api
            .post_json("users/token/", &body)
            .map_err(|e| match e.status() {
                Some(401) => AuthError::InvalidCredentials,
                _ => AuthError::unavailable(e),
            })
    }

    fn create_account(&self, username: &str, email: &str, password: &str) -> AuthResult<()> {
        let body = json!({ "username": username, "email": email, "password": password });
        match self.api.post("users/register/", &body) {
            Ok(()) => Ok(()),
            Err(e) => Err(e
                .field_errors()
                .as_ref()
                .and_then(registration_conflict)
                .unwrap_or_else(|| AuthError::unavailable(&e))),
        }
    }

    fn invalidate(&self, long_lived: Option<&str>) -> AuthResult<()> {
        self.api
            .post("users/logout/", &long_lived_body(long_lived))
            .map_err(|e: ApiError| AuthError::unavailable(e))
    }
}
