//! Profile operations for the signed-in user.
//!
//! These ride on the same request layer as everything else, so they carry
//! whatever credential the session manager attached.

use crate::api::{ApiClient, ApiError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Not signed in")]
    NotSignedIn,
    #[error("Wrong password.")]
    WrongPassword,
    #[error("{field}: {message}")]
    Rejected { field: String, message: String },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Server view of the current user (`users/me/`)
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Profile {
    pub id: u64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub is_staff: bool,
}

/// Editable profile fields; unset fields are left out of the request
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ProfileUpdate {
    /// Set one field by its name as typed at the prompt.
    pub fn set(&mut self, field: &str, value: &str) -> bool {
        let slot = match field {
            "username" => &mut self.username,
            "first_name" | "first-name" | "firstname" => &mut self.first_name,
            "last_name" | "last-name" | "lastname" => &mut self.last_name,
            "email" => &mut self.email,
            _ => return false,
        };
        *slot = Some(value.to_string());
        true
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

pub struct AccountService {
    api: Arc<ApiClient>,
}

fn first_field_error(err: &ApiError) -> Option<(String, String)> {
    let fields = err.field_errors()?;
    let (field, messages) = fields.iter().next()?;
    let message = match messages {
        Value::Array(items) => items.first().and_then(|m| m.as_str()).unwrap_or_default(),
        Value::String(s) => s.as_str(),
        _ => "",
    };
    Some((field.clone(), message.to_string()))
}

impl AccountService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    fn require_session(&self) -> Result<(), AccountError> {
        if self.api.auth().is_set() {
            Ok(())
        } else {
            Err(AccountError::NotSignedIn)
        }
    }

    fn map_rejection(err: ApiError) -> AccountError {
        if err.status() == Some(401) {
            return AccountError::NotSignedIn;
        }
        match first_field_error(&err) {
            Some((field, _)) if field == "old_password" => AccountError::WrongPassword,
            Some((field, message)) => AccountError::Rejected { field, message },
            None => AccountError::Api(err),
        }
    }

    pub fn profile(&self) -> Result<Profile, AccountError> {
        self.require_session()?;
        self.api.get_json("users/me/").map_err(Self::map_rejection)
    }

    pub fn update_profile(&self, update: &ProfileUpdate) -> Result<(), AccountError> {
        self.require_session()?;
        if update.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_value(update).map_err(|e| ApiError::Decode(e.to_string()))?;
        self.api
            .put_json::<Value>("users/update-profile/", &body)
            .map(|_| ())
            .map_err(Self::map_rejection)
    }

    pub fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), AccountError> {
        self.require_session()?;
        let body = json!({ "old_password": old_password, "new_password": new_password });
        self.api
            .post("users/change-password/", &body)
            .map_err(Self::map_rejection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::stub::serve;
    use crate::api::AuthHeader;

    fn service(base_url: &str, signed_in: bool) -> AccountService {
        let header = AuthHeader::new();
        if signed_in {
            header.set("Bearer tok".to_string());
        }
        AccountService::new(Arc::new(ApiClient::new(base_url, 5000, header)))
    }

    #[test]
    fn test_requires_session() {
        let svc = service("http://127.0.0.1:9", false);
        assert!(matches!(svc.profile(), Err(AccountError::NotSignedIn)));
        assert!(matches!(
            svc.change_password("a", "b"),
            Err(AccountError::NotSignedIn)
        ));
    }

    #[test]
    fn test_profile_fetch_is_authorized() {
        let server = serve(vec![(
            200,
            r#"{"id":7,"username":"alex","email":"a@b.com","is_staff":false}"#.to_string(),
        )]);
        let profile = service(&server.base_url, true).profile().unwrap();
        assert_eq!(profile.username, "alex");
        let req = server.requests.recv().unwrap();
        assert_eq!(req.path, "/api/users/me/");
        assert_eq!(req.header("Authorization"), Some("Bearer tok"));
    }

    #[test]
    fn test_update_sends_only_set_fields() {
        let server = serve(vec![(200, r#"{"username":"alexa"}"#.to_string())]);
        let mut update = ProfileUpdate::default();
        assert!(update.is_empty());
        assert!(update.set("username", "alexa"));
        assert!(!update.set("password", "nope"));
        service(&server.base_url, true).update_profile(&update).unwrap();

        let req = server.requests.recv().unwrap();
        assert_eq!(req.method, "PUT");
        assert_eq!(req.body, r#"{"username":"alexa"}"#);
    }

    #[test]
    fn test_empty_update_sends_nothing() {
        // Nothing listens here; a request would fail
        let svc = service("http://127.0.0.1:9", true);
        assert!(svc.update_profile(&ProfileUpdate::default()).is_ok());
    }

    #[test]
    fn test_update_conflict_names_field() {
        let server = serve(vec![(
            400,
            r#"{"username":["A user with that username already exists."]}"#.to_string(),
        )]);
        let mut update = ProfileUpdate::default();
        update.set("username", "taken");
        let err = service(&server.base_url, true)
            .update_profile(&update)
            .unwrap_err();
        assert!(matches!(err, AccountError::Rejected { ref field, .. } if field == "username"));
    }

    #[test]
    fn test_change_password_wrong_old() {
        let server = serve(vec![(400, r#"{"old_password":["Wrong password."]}"#.to_string())]);
        let err = service(&server.base_url, true)
            .change_password("bad", "newpassword1")
            .unwrap_err();
        assert!(matches!(err, AccountError::WrongPassword));
    }

    #[test]
    fn test_expired_credential_is_not_signed_in() {
        let server = serve(vec![(401, r#"{"detail":"Token is invalid or expired"}"#.to_string())]);
        let err = service(&server.base_url, true).profile().unwrap_err();
        assert!(matches!(err, AccountError::NotSignedIn));
    }
}
