//! Client-side session state: who is signed in and with which access credential.

pub mod claims;
pub mod manager;
pub mod store;

pub use manager::SessionManager;

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// The signed-in principal, as decoded from the access credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: u64,
    pub display_name: String,
    pub email: String,
    pub is_privileged: bool,
    pub role_names: BTreeSet<String>,
}

/// Short-lived bearer token. Debug output never shows the token itself.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessCredential {
    pub fn new(token: String, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { token, expires_at }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token())
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// The startup restore has not finished yet.
    Pending,
    Resolved,
}

/// Snapshot of the session. Identity and credential live in one `Option`, so
/// one can never be present without the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    auth: Option<(Identity, AccessCredential)>,
    pub resolution: ResolutionState,
}

impl Session {
    pub fn pending() -> Self {
        Self {
            auth: None,
            resolution: ResolutionState::Pending,
        }
    }

    pub fn signed_out() -> Self {
        Self {
            auth: None,
            resolution: ResolutionState::Resolved,
        }
    }

    pub fn signed_in(identity: Identity, credential: AccessCredential) -> Self {
        Self {
            auth: Some((identity, credential)),
            resolution: ResolutionState::Resolved,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.auth.as_ref().map(|(identity, _)| identity)
    }

    pub fn access_credential(&self) -> Option<&AccessCredential> {
        self.auth.as_ref().map(|(_, credential)| credential)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution == ResolutionState::Resolved
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }
}

/// Published by the session manager after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(Identity),
    SignedOut,
}

/// Observer of session transitions (the idle watch is one).
pub trait SessionListener: Send + Sync {
    fn on_session_change(&self, event: &SessionEvent);
}

#[cfg(test)]
pub(crate) fn test_identity(subject_id: u64, name: &str, privileged: bool) -> Identity {
    Identity {
        subject_id,
        display_name: name.to_string(),
        email: format!("{}@city.gov", name),
        is_privileged: privileged,
        role_names: BTreeSet::new(),
    }
}
