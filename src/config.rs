use crate::guard::AccessLevel;
use crate::idle::DEFAULT_IDLE_TIMEOUT_MS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Where the long-lived credential lives between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistencePolicy {
    /// Server-set cookie held by the HTTP agent. The jar is saved to
    /// `~/.citypass/cookies.json`; the credential is never read by this program.
    #[default]
    Cookie,
    /// Readable JSON file in the user's home directory.
    File,
    /// Nothing outlives the process.
    Memory,
}

impl PersistencePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cookie" => Some(Self::Cookie),
            "file" => Some(Self::File),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cookie => "cookie",
            Self::File => "file",
            Self::Memory => "memory",
        }
    }
}

/// Configuration for the REST API connection
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Configuration for session handling
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SessionConfig {
    /// Inactivity window before forced sign-out; 0 disables it
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub persistence: Option<PersistencePolicy>,
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Extra or overridden routes: path pattern → access level
    #[serde(default)]
    pub routes: BTreeMap<String, AccessLevel>,
}

impl Config {
    pub fn base_url(&self) -> &str {
        self.api.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.api.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn idle_timeout_ms(&self) -> u64 {
        self.session.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS)
    }

    pub fn persistence(&self) -> PersistencePolicy {
        self.session.persistence.unwrap_or_default()
    }

    /// Load configuration from default paths
    /// Priority: local (.citypass/config.local.toml) > project (.citypass/config.toml) > user (~/.citypass/config.toml)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".citypass").join("config.toml");
            if user_config.exists() {
                config.merge(Self::load_from(&user_config)?);
            }
        }

        let project_config = Path::new(".citypass").join("config.toml");
        if project_config.exists() {
            config.merge(Self::load_from(&project_config)?);
        }

        // Should be gitignored
        let local_config = Path::new(".citypass").join("config.local.toml");
        if local_config.exists() {
            config.merge(Self::load_from(&local_config)?);
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Merge another config into this one (other takes priority)
    pub fn merge(&mut self, other: Config) {
        if other.api.base_url.is_some() {
            self.api.base_url = other.api.base_url;
        }
        if other.api.timeout_ms.is_some() {
            self.api.timeout_ms = other.api.timeout_ms;
        }

        if other.session.idle_timeout_ms.is_some() {
            self.session.idle_timeout_ms = other.session.idle_timeout_ms;
        }
        if other.session.persistence.is_some() {
            self.session.persistence = other.session.persistence;
        }
        if other.session.credentials_file.is_some() {
            self.session.credentials_file = other.session.credentials_file;
        }

        // Routes: other wins per pattern
        self.routes.extend(other.routes);
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let base_url = self.base_url();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            errors.push(ValidationError {
                field: "api.base_url".to_string(),
                message: format!("Must be an http(s) URL, got '{}'", base_url),
            });
        }

        if self.timeout_ms() == 0 {
            errors.push(ValidationError {
                field: "api.timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        for pattern in self.routes.keys() {
            if !pattern.starts_with('/') {
                errors.push(ValidationError {
                    field: format!("routes.\"{}\"", pattern),
                    message: "Route patterns must start with '/'".to_string(),
                });
            }
        }

        if self.session.credentials_file.is_some() && self.persistence() != PersistencePolicy::File {
            errors.push(ValidationError {
                field: "session.credentials_file".to_string(),
                message: "Only used with persistence = \"file\"".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
