//! Blind index derivation for exact-match lookup over encrypted fields.
//!
//! A blind index is `HMAC-SHA256(index_key, normalize(value))`. It is derived
//! from plaintext only, so re-encrypting a value never changes its index.

use crate::error::CryptoError;
use crate::key_provider::Keyring;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

type HmacSha256 = Hmac<Sha256>;

/// Blind index output size (32 bytes, untruncated HMAC-SHA256).
pub const BLIND_INDEX_SIZE: usize = 32;

/// Canonical form used for every blind index, at write time and query time.
///
/// Trims surrounding whitespace and lower-cases. This is the only
/// normalization in the crate; nothing else may re-implement it.
///
/// ```
/// use fieldseal::blind_index::normalize;
///
/// assert_eq!(normalize("  Foo@Bar.COM \n"), "foo@bar.com");
/// ```
#[must_use]
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Fixed-length deterministic token stored in `<column>_blind_index`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlindIndex([u8; BLIND_INDEX_SIZE]);

impl BlindIndex {
    /// Wraps raw index bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; BLIND_INDEX_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw index bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BLIND_INDEX_SIZE] {
        &self.0
    }

    /// Lowercase hex form (64 chars), the storage representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Malformed` if the input is not 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; BLIND_INDEX_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| CryptoError::Malformed(format!("blind index: {e}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for BlindIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlindIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Prefix is enough to correlate log lines
        write!(f, "BlindIndex({}..)", &self.to_hex()[..12])
    }
}

impl FromStr for BlindIndex {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Keyed, pure blind index derivation.
///
/// # Example
///
/// ```
/// use fieldseal::blind_index::BlindIndexer;
/// use fieldseal::key_provider::Keyring;
/// use secrecy::SecretVec;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let keyring = Keyring::new(SecretVec::new(vec![1u8; 32]), None)?;
/// let indexer = BlindIndexer::new(&keyring)?;
///
/// assert_eq!(indexer.derive("Foo@Bar.com "), indexer.derive("foo@bar.com"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BlindIndexer {
    mac: HmacSha256,
}

impl BlindIndexer {
    /// Creates an indexer keyed with the keyring's index key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyDerivation` if the HMAC cannot be keyed.
    pub fn new(keyring: &Keyring) -> Result<Self, CryptoError> {
        let mac = <HmacSha256 as Mac>::new_from_slice(keyring.index_key().expose_secret())
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(Self { mac })
    }

    /// Derives the blind index of `normalize(value)`.
    #[must_use]
    pub fn derive(&self, value: &str) -> BlindIndex {
        self.derive_normalized(&normalize(value))
    }

    /// Derives the blind index of a value that is already normalized.
    #[must_use]
    pub fn derive_normalized(&self, normalized: &str) -> BlindIndex {
        let mut mac = self.mac.clone();
        mac.update(normalized.as_bytes());

        let mut out = [0u8; BLIND_INDEX_SIZE];
        out.copy_from_slice(&mac.finalize().into_bytes());
        BlindIndex(out)
    }

    /// Constant-time check that `value` derives to `index`.
    #[must_use]
    pub fn matches(&self, value: &str, index: &BlindIndex) -> bool {
        let mut mac = self.mac.clone();
        mac.update(normalize(value).as_bytes());
        mac.verify_slice(index.as_bytes()).is_ok()
    }
}

impl fmt::Debug for BlindIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlindIndexer(HMAC-SHA256)")
    }
}
