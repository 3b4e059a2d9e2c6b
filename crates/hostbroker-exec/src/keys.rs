//! SSH key resolution
//!
//! A key file is only accepted when group and other permission bits are clear.

use std::path::{Path, PathBuf};

/// Where the private key for a connection comes from
#[derive(Debug, Clone, Default)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// No key; password authentication only
    #[default]
    None,
}

impl KeySource {
    /// Resolve to a file on disk
    ///
    /// # Errors
    /// Returns `KeyError` if the file is missing or readable by others
    pub fn resolve(&self) -> Result<ResolvedKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                validate_key_permissions(path)?;
                Ok(ResolvedKey::Path(path.clone()))
            }
            KeySource::None => Ok(ResolvedKey::None),
        }
    }
}

/// Resolved key location
#[derive(Debug)]
pub enum ResolvedKey {
    /// Path to key file
    Path(PathBuf),
    /// No key available
    None,
}

impl ResolvedKey {
    /// Key file path, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ResolvedKey::Path(p) => Some(p),
            ResolvedKey::None => None,
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(KeyError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(KeyError::Io(e)),
    };

    // group/other bits must be clear
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn test_missing_key_file() {
        let result = KeySource::Path(PathBuf::from("/nonexistent/id_rsa")).resolve();
        assert!(matches!(result, Err(KeyError::NotFound(_))));
    }

    #[test]
    fn test_open_permissions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");
        std::fs::write(&path, "key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let result = KeySource::Path(path).resolve();
        assert!(matches!(result, Err(KeyError::BadPermissions(_))));
    }

    #[test]
    fn test_private_key_file_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        std::fs::write(&path, "key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let resolved = KeySource::Path(path.clone()).resolve().unwrap();
        assert_eq!(resolved.path(), Some(path.as_path()));
    }

    #[test]
    fn test_no_key() {
        let resolved = KeySource::None.resolve().unwrap();
        assert!(resolved.path().is_none());
    }
}
