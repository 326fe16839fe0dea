//! Error types for `FieldSeal` operations.

use crate::store::RowId;
use std::fmt;

/// Main error type for `FieldSeal` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key material is missing/malformed, or a stored value failed to decrypt.
    ///
    /// Never shown to end users with detail; operators see it in logs.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The derived blind index is already owned by another row.
    ///
    /// This is the expected "already registered" signal, not a failure.
    #[error("duplicate identity in {scope}")]
    DuplicateIdentity {
        /// Scope (`table.column`) the conflict was found in
        scope: String,
        /// Row currently owning the index, when the backend reports it
        existing: Option<RowId>,
    },

    /// A legacy value could not be classified as ciphertext or plaintext.
    #[error("ambiguous legacy value: {reason}")]
    LegacyFormatAmbiguity {
        /// Which shape check failed
        reason: &'static str,
    },

    /// The value is empty after normalization and cannot be indexed.
    #[error("value is empty after normalization")]
    EmptyValue,

    /// Key provider operation failed
    #[error("key provider error: {0}")]
    KeyProvider(#[from] KeyProviderError),

    /// Storage round-trip failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Returns `true` for [`Error::DuplicateIdentity`].
    ///
    /// Handlers map this to an "already exists" outcome instead of a generic failure.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateIdentity { .. })
    }
}

/// Cipher and key errors.
///
/// Wrong-key and tampered-ciphertext cases are deliberately collapsed into
/// [`CryptoError::AuthenticationFailed`].
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// No encryption key configured
    #[error("encryption key is not configured")]
    MissingKey,

    /// Key has the wrong length
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication tag verification failed (wrong key, corrupted or tampered data)
    #[error("authentication failed: ciphertext may be corrupted or tampered")]
    AuthenticationFailed,

    /// The stored value does not carry the envelope framing
    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    /// Envelope header parsing failed
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Unsupported envelope version
    #[error("unsupported version: {version} (supported: {supported})")]
    UnsupportedVersion {
        /// The version found in the ciphertext
        version: u8,
        /// Supported versions
        supported: String,
    },

    /// Decrypted bytes are not valid UTF-8
    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Errors returned by [`FieldStore`](crate::store::FieldStore) backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The blind index is already present on another row
    #[error("unique constraint violated on blind index")]
    UniqueViolation {
        /// Row that owns the index, if the backend can tell
        existing: Option<RowId>,
    },

    /// No row with this id
    #[error("row {0} not found")]
    RowNotFound(RowId),

    /// Table or column name is not a plain identifier
    #[error("invalid scope identifier: {0:?}")]
    InvalidScope(String),

    /// Backend failure (I/O, SQL, lock poisoning)
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors specific to key provider operations.
#[derive(Debug)]
pub enum KeyProviderError {
    /// Encryption key not found
    KeyNotFound(String),

    /// Key material has an unusable encoding or length
    InvalidKey(String),

    /// Key creation failed
    CreationFailed(String),

    /// Salt configured but unreadable
    SaltUnavailable(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KeyProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound(id) => write!(f, "encryption key not found: {id}"),
            Self::InvalidKey(msg) => write!(f, "invalid key material: {msg}"),
            Self::CreationFailed(msg) => write!(f, "key creation failed: {msg}"),
            Self::SaltUnavailable(msg) => write!(f, "index salt not available: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
