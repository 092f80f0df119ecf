//! Small file-backed key/value store for provider bookkeeping
//!
//! Native providers remember which idempotency token produced which
//! physical resource so a repeated create (or crash reconciliation) finds
//! it again. Keys are hashed into file names; values are JSON.

use orchestrator::ProviderError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn path(&self, namespace: &str, key: &str) -> PathBuf {
        let hash = blake3::hash(key.as_bytes()).to_hex();
        self.dir.join(namespace).join(format!("{}.json", &hash[..32]))
    }

    pub fn put<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<(), ProviderError> {
        let path = self.path(namespace, key);
        let body = serde_json::to_vec(value).map_err(|e| ProviderError::Rejected(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, &e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|e| io_error(&tmp, &e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, &e))
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>, ProviderError> {
        let path = self.path(namespace, key);
        match fs::read(&path) {
            Ok(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| ProviderError::Rejected(format!("corrupt ledger entry {}: {e}", path.display()))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, &e)),
        }
    }

    /// Returns whether the key existed
    pub fn remove(&self, namespace: &str, key: &str) -> Result<bool, ProviderError> {
        let path = self.path(namespace, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, &e)),
        }
    }
}

/// Classify a filesystem error for the engine
pub fn io_error(path: &Path, e: &io::Error) -> ProviderError {
    match e.kind() {
        io::ErrorKind::NotFound => ProviderError::NotFound(path.display().to_string()),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ProviderError::Transient(format!("{}: {e}", path.display()))
        }
        _ => ProviderError::Rejected(format!("{}: {e}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_remove() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(tmp.path()).unwrap();

        assert_eq!(ledger.get::<String>("tokens", "abc").unwrap(), None);
        ledger.put("tokens", "abc", &"/tmp/file".to_string()).unwrap();
        assert_eq!(ledger.get::<String>("tokens", "abc").unwrap().as_deref(), Some("/tmp/file"));
        assert_eq!(ledger.get::<String>("other", "abc").unwrap(), None);

        assert!(ledger.remove("tokens", "abc").unwrap());
        assert!(!ledger.remove("tokens", "abc").unwrap());
    }

    #[test]
    fn test_io_error_classification() {
        let path = Path::new("/x");
        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert!(matches!(io_error(path, &missing), ProviderError::NotFound(_)));
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(io_error(path, &denied), ProviderError::Rejected(_)));
        let interrupted = io::Error::from(io::ErrorKind::Interrupted);
        assert!(io_error(path, &interrupted).is_retryable());
    }
}
