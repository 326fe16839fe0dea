//! File-based key provider for `FieldSeal`.
//!
//! This provider stores keys in the filesystem and is suitable for
//! development, testing and single-host deployments.

#![warn(clippy::pedantic, clippy::nursery)]

use fieldseal::error::KeyProviderError;
use fieldseal::kdf::generate_key;
use fieldseal::key_provider::KeyProvider;
use secrecy::{ExposeSecret, SecretVec};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File holding the 32-byte encryption key.
pub const ENCRYPTION_KEY_FILE: &str = "encryption.key";
/// File holding the optional blind-index salt.
pub const INDEX_SALT_FILE: &str = "index_salt.key";

/// File-based key provider.
///
/// Keys are stored in the filesystem with the following structure:
/// ```text
/// keys/
/// ├── encryption.key   (32 bytes, 0600 permissions)
/// └── index_salt.key   (32 bytes, 0600 permissions, optional)
/// ```
///
/// Without `index_salt.key` the blind-index key is derived from the
/// encryption key.
#[derive(Debug)]
pub struct FileKeyProvider {
    key_dir: PathBuf,
}

impl FileKeyProvider {
    /// Creates a new `FileKeyProvider`.
    ///
    /// # Arguments
    ///
    /// * `key_dir` - Directory containing key files
    ///
    /// # Errors
    ///
    /// Returns error if the directory doesn't exist.
    pub fn new(key_dir: impl Into<PathBuf>) -> Result<Self, KeyProviderError> {
        let key_dir = key_dir.into();
        if !key_dir.is_dir() {
            return Err(KeyProviderError::CreationFailed(format!(
                "Key directory does not exist: {}",
                key_dir.display()
            )));
        }
        Ok(Self { key_dir })
    }

    /// Initializes a key directory with a fresh encryption key and index salt.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::CreationFailed` if either key file already
    /// exists, or an I/O error if the directory or files cannot be written.
    /// Nothing is left behind when the salt cannot be written.
    pub fn init(key_dir: impl Into<PathBuf>) -> Result<Self, KeyProviderError> {
        let key_dir = key_dir.into();
        let key_path = key_dir.join(ENCRYPTION_KEY_FILE);
        let salt_path = key_dir.join(INDEX_SALT_FILE);
        for path in [&key_path, &salt_path] {
            if path.exists() {
                return Err(KeyProviderError::CreationFailed(format!(
                    "Refusing to overwrite existing key: {}",
                    path.display()
                )));
            }
        }

        fs::create_dir_all(&key_dir)?;
        write_key_file(&key_path, &generate_key())?;
        if let Err(err) = write_key_file(&salt_path, &generate_key()) {
            let _ = fs::remove_file(&key_path);
            return Err(err);
        }

        tracing::info!(key_dir = %key_dir.display(), "initialized key directory");
        Ok(Self { key_dir })
    }

    /// Returns the key directory.
    #[must_use]
    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    fn read_key_file(path: &Path) -> Result<SecretVec<u8>, KeyProviderError> {
        let bytes = fs::read(path)?;
        Ok(SecretVec::new(bytes))
    }
}

fn write_key_file(path: &Path, key: &SecretVec<u8>) -> Result<(), KeyProviderError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(key.expose_secret())?;
    file.sync_all()?;
    Ok(())
}

impl KeyProvider for FileKeyProvider {
    fn encryption_key(&self) -> Result<SecretVec<u8>, KeyProviderError> {
        let path = self.key_dir.join(ENCRYPTION_KEY_FILE);
        if !path.exists() {
            return Err(KeyProviderError::KeyNotFound(path.display().to_string()));
        }
        Self::read_key_file(&path)
    }

    fn index_salt(&self) -> Result<Option<SecretVec<u8>>, KeyProviderError> {
        let path = self.key_dir.join(INDEX_SALT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_key_file(&path)
            .map(Some)
            .map_err(|e| KeyProviderError::SaltUnavailable(e.to_string()))
    }
}
