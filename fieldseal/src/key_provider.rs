//! Key provider abstraction and the [`Keyring`] threaded into every component.

use crate::error::{CryptoError, Error, KeyProviderError};
use crate::kdf::{derive_index_key, KEY_SIZE};
use secrecy::{ExposeSecret, SecretVec};

/// Supplies the long-lived encryption key and optional blind-index salt.
///
/// Implementations must be thread-safe (`Send + Sync`); keys are read once at
/// startup and never rotated by this crate.
///
/// # Example
///
/// ```rust,ignore
/// use fieldseal::key_provider::KeyProvider;
///
/// struct MyProvider;
///
/// impl KeyProvider for MyProvider {
///     fn encryption_key(&self) -> Result<SecretVec<u8>, KeyProviderError> {
///         // Implementation
///     }
/// }
/// ```
pub trait KeyProvider: Send + Sync {
    /// Returns the 32-byte symmetric encryption key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::KeyNotFound` if no key is configured.
    fn encryption_key(&self) -> Result<SecretVec<u8>, KeyProviderError>;

    /// Returns the dedicated blind-index salt.
    ///
    /// # Returns
    ///
    /// Returns `None` when no dedicated salt is configured; the [`Keyring`]
    /// then derives one from the encryption key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::SaltUnavailable` if a configured salt cannot be read.
    fn index_salt(&self) -> Result<Option<SecretVec<u8>>, KeyProviderError> {
        Ok(None)
    }
}

/// Provider over key bytes already in memory (environment, tests).
pub struct StaticKeyProvider {
    key: SecretVec<u8>,
    salt: Option<SecretVec<u8>>,
}

impl StaticKeyProvider {
    /// Creates a provider from raw key bytes and an optional salt.
    #[must_use]
    pub const fn new(key: SecretVec<u8>, salt: Option<SecretVec<u8>>) -> Self {
        Self { key, salt }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn encryption_key(&self) -> Result<SecretVec<u8>, KeyProviderError> {
        Ok(SecretVec::new(self.key.expose_secret().clone()))
    }

    fn index_salt(&self) -> Result<Option<SecretVec<u8>>, KeyProviderError> {
        Ok(self.salt.as_ref().map(|s| SecretVec::new(s.expose_secret().clone())))
    }
}

/// Where the blind-index key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKeySource {
    /// A dedicated salt was configured
    DedicatedSalt,
    /// Derived from the encryption key via HKDF
    DerivedFromEncryptionKey,
}

/// Read-only key material for one process.
///
/// Constructed once at startup and passed into the cipher and indexer.
pub struct Keyring {
    encryption_key: SecretVec<u8>,
    index_key: SecretVec<u8>,
    index_key_source: IndexKeySource,
}

impl Keyring {
    /// Builds a keyring from an encryption key and an optional dedicated salt.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MissingKey` for an empty key,
    /// `CryptoError::InvalidKeyLength` if the key is not 32 bytes, and
    /// `KeyProviderError::InvalidKey` for an empty salt.
    pub fn new(
        encryption_key: SecretVec<u8>,
        index_salt: Option<SecretVec<u8>>,
    ) -> Result<Self, Error> {
        let len = encryption_key.expose_secret().len();
        if len == 0 {
            return Err(CryptoError::MissingKey.into());
        }
        if len != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: len }.into());
        }

        let (index_key, index_key_source) = match index_salt {
            Some(salt) if salt.expose_secret().is_empty() => {
                return Err(KeyProviderError::InvalidKey("index salt is empty".to_string()).into());
            }
            Some(salt) => (salt, IndexKeySource::DedicatedSalt),
            None => {
                tracing::debug!("no dedicated index salt; deriving from encryption key");
                (derive_index_key(&encryption_key)?, IndexKeySource::DerivedFromEncryptionKey)
            }
        };

        Ok(Self { encryption_key, index_key, index_key_source })
    }

    /// Loads key material from a provider.
    ///
    /// # Errors
    ///
    /// Propagates provider failures and the validation errors of [`Keyring::new`].
    pub fn from_provider<P: KeyProvider + ?Sized>(provider: &P) -> Result<Self, Error> {
        let key = provider.encryption_key()?;
        let salt = provider.index_salt()?;
        Self::new(key, salt)
    }

    pub(crate) const fn encryption_key(&self) -> &SecretVec<u8> {
        &self.encryption_key
    }

    pub(crate) const fn index_key(&self) -> &SecretVec<u8> {
        &self.index_key
    }

    /// Returns where the blind-index key came from.
    #[must_use]
    pub const fn index_key_source(&self) -> IndexKeySource {
        self.index_key_source
    }
}

impl Clone for Keyring {
    fn clone(&self) -> Self {
        Self {
            encryption_key: SecretVec::new(self.encryption_key.expose_secret().clone()),
            index_key: SecretVec::new(self.index_key.expose_secret().clone()),
            index_key_source: self.index_key_source,
        }
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("index_key_source", &self.index_key_source)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyring_with_dedicated_salt() {
        let keyring =
            Keyring::new(SecretVec::new(vec![1u8; 32]), Some(SecretVec::new(vec![9u8; 16])))
                .unwrap();

        assert_eq!(keyring.index_key_source(), IndexKeySource::DedicatedSalt);
        assert_eq!(keyring.index_key().expose_secret(), &vec![9u8; 16]);
    }

    #[test]
    fn test_keyring_derives_salt_when_absent() {
        let keyring = Keyring::new(SecretVec::new(vec![1u8; 32]), None).unwrap();

        assert_eq!(keyring.index_key_source(), IndexKeySource::DerivedFromEncryptionKey);
        assert_ne!(keyring.index_key().expose_secret(), keyring.encryption_key().expose_secret());
    }

    #[test]
    fn test_keyring_rejects_missing_key() {
        let result = Keyring::new(SecretVec::new(Vec::new()), None);
        assert!(matches!(result, Err(Error::Crypto(CryptoError::MissingKey))));
    }

    #[test]
    fn test_keyring_rejects_short_key() {
        let result = Keyring::new(SecretVec::new(vec![1u8; 16]), None);
        assert!(matches!(
            result,
            Err(Error::Crypto(CryptoError::InvalidKeyLength { expected: 32, actual: 16 }))
        ));
    }

    #[test]
    fn test_keyring_rejects_empty_salt() {
        let result = Keyring::new(SecretVec::new(vec![1u8; 32]), Some(SecretVec::new(Vec::new())));
        assert!(matches!(result, Err(Error::KeyProvider(KeyProviderError::InvalidKey(_)))));
    }

    #[test]
    fn test_keyring_from_static_provider() {
        let provider = StaticKeyProvider::new(SecretVec::new(vec![3u8; 32]), None);
        let keyring = Keyring::from_provider(&provider).unwrap();

        assert_eq!(keyring.encryption_key().expose_secret(), &vec![3u8; 32]);
    }

    #[test]
    fn test_keyring_debug_hides_keys() {
        let keyring = Keyring::new(SecretVec::new(vec![0xAB; 32]), None).unwrap();
        let debug = format!("{keyring:?}");

        assert!(!debug.contains("171"));
        assert!(debug.contains("DerivedFromEncryptionKey"));
    }
}
