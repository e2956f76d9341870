//! Persistence of the long-lived credential between runs.
//!
//! Three policies sit behind one trait. `CookieJarStore` saves the HTTP agent's
//! cookie jar, so a server-set httpOnly credential survives a restart without
//! this program ever reading it. `FileStore` writes the credentials to disk
//! where the user (and anything running as the user) can read them.
//! `MemoryStore` keeps everything inside the process.

use crate::api::ApiClient;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("credential store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("cookie jar error: {0}")]
    Jar(String),
}

fn home_file(name: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".citypass")
        .join(name)
}

/// Write `content` to `path`, readable by the owner only on unix. The mode is
/// set on the open handle before any byte lands in the file.
pub(crate) fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // `mode` only applies on creation; an older file keeps its bits otherwise
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(content)?;
    file.flush()
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoredCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

impl std::fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .field("access", &self.access.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub trait CredentialStore: Send + Sync {
    fn save(&self, credentials: &StoredCredentials) -> Result<(), StoreError>;
    fn load(&self) -> Result<Option<StoredCredentials>, StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// Process-lifetime store; nothing touches the disk.
#[derive(Default)]
pub struct MemoryStore {
    slot: Mutex<Option<StoredCredentials>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn save(&self, credentials: &StoredCredentials) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(credentials.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<StoredCredentials>, StoreError> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// Cookie jar of the shared [`ApiClient`], saved to disk between runs.
///
/// The credential stays opaque: `load` only reports that a jar exists, and
/// `refresh` then rides on the cookie the agent sends by itself.
pub struct CookieJarStore {
    api: Arc<ApiClient>,
    path: PathBuf,
}

impl CookieJarStore {
    pub fn new(api: Arc<ApiClient>, path: &Path) -> Self {
        Self {
            api,
            path: path.to_path_buf(),
        }
    }

    /// `~/.citypass/cookies.json`
    pub fn default_path() -> PathBuf {
        home_file("cookies.json")
    }

    /// Jar saved by an earlier run; a missing file is an empty jar.
    pub fn read_jar(path: &Path) -> Result<cookie_store::CookieStore, StoreError> {
        match std::fs::File::open(path) {
            Ok(file) => cookie_store::serde::json::load(BufReader::new(file))
                .map_err(|e| StoreError::Jar(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(cookie_store::CookieStore::default())
            }
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CredentialStore for CookieJarStore {
    fn save(&self, _credentials: &StoredCredentials) -> Result<(), StoreError> {
        let mut content = Vec::new();
        self.api
            .write_cookies(&mut content)
            .map_err(|e| StoreError::Jar(e.to_string()))?;
        write_private(&self.path, &content).map_err(|e| self.io_err(e))
    }

    fn load(&self) -> Result<Option<StoredCredentials>, StoreError> {
        Ok(self.path.exists().then(StoredCredentials::default))
    }

    fn clear(&self) -> Result<(), StoreError> {
        remove_if_present(&self.path).map_err(|e| self.io_err(e))
    }
}

/// JSON file store, created with owner-only permissions on unix.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// `~/.citypass/credentials.json`, or a relative path when no home exists.
    pub fn default_path() -> PathBuf {
        home_file("credentials.json")
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CredentialStore for FileStore {
    fn save(&self, credentials: &StoredCredentials) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(credentials)?;
        write_private(&self.path, content.as_bytes()).map_err(|e| self.io_err(e))
    }

    fn load(&self) -> Result<Option<StoredCredentials>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        remove_if_present(&self.path).map_err(|e| self.io_err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> StoredCredentials {
        StoredCredentials {
            refresh: Some("long-lived".to_string()),
            access: Some("short-lived".to_string()),
        }
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_file_store_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("credentials.json");
        let store = FileStore::new(&path);

        assert!(store.load().unwrap().is_none());
        store.save(&sample()).unwrap();
        assert!(path.exists());

        // A second store over the same file sees the saved credentials
        let reopened = FileStore::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(sample()));

        store.clear().unwrap();
        assert!(!path.exists());
        // Clearing twice is fine
        store.clear().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        FileStore::new(&path).save(&sample()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        FileStore::new(&path).save(&sample()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(FileStore::new(&path).load().unwrap(), Some(sample()));
    }

    #[test]
    fn test_file_store_reports_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileStore::new(&path).load(),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_cookie_jar_store_lifecycle() {
        use crate::api::AuthHeader;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookies.json");

        assert_eq!(CookieJarStore::read_jar(&path).unwrap().iter_any().count(), 0);
        let api = Arc::new(ApiClient::new("http://127.0.0.1:9/api", 1000, AuthHeader::new()));
        let store = CookieJarStore::new(api, &path);
        assert!(store.load().unwrap().is_none());

        store.save(&sample()).unwrap();
        // Only the jar is written, never the tokens handed to `save`
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("long-lived"));
        assert_eq!(store.load().unwrap(), Some(StoredCredentials::default()));
        assert!(CookieJarStore::read_jar(&path).is_ok());

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_cookie_jar_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "not a jar").unwrap();
        assert!(matches!(
            CookieJarStore::read_jar(&path),
            Err(StoreError::Jar(_))
        ));
    }

    #[test]
    fn test_debug_hides_tokens() {
        let shown = format!("{:?}", sample());
        assert!(!shown.contains("long-lived"));
        assert!(!shown.contains("short-lived"));
    }
}
