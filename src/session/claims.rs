//! Local, unverified decoding of access-credential claims.
//!
//! The decoded identity only gates what the terminal offers. The API checks
//! privilege again on every request; nothing here is a security boundary.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use super::Identity;

#[derive(Debug, Error)]
pub enum ClaimsError {
    #[error("access credential is not a three-part token")]
    Shape,
    #[error("access credential payload is not base64url: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("access credential payload is not valid claims JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Claims the API embeds in every access credential.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(deserialize_with = "subject_id")]
    pub user_id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    /// Build an identity; `fallback_email` fills in tokens that omit the claim.
    pub fn into_identity(self, fallback_email: Option<&str>) -> Identity {
        let email = self
            .email
            .filter(|e| !e.is_empty())
            .or_else(|| fallback_email.map(String::from))
            .unwrap_or_default();
        Identity {
            subject_id: self.user_id,
            display_name: self.username,
            email,
            is_privileged: self.is_staff,
            role_names: self.groups.into_iter().collect(),
        }
    }
}

// Subject ids arrive as numbers, but some token issuers stringify them.
fn subject_id<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Decode the payload segment of `token` without verifying its signature.
pub fn decode(token: &str) -> Result<Claims, ClaimsError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
        _ => return Err(ClaimsError::Shape),
    };
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
pub(crate) fn encode_for_test(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
