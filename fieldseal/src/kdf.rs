//! Key derivation using HKDF (HMAC-based Key Derivation Function).
//!
//! Used when a deployment supplies only the encryption key: the blind-index
//! key is derived from it so the same bytes never key two primitives.

use crate::error::CryptoError;
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

/// Standard key size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// HKDF `info` label for the blind-index key.
const INDEX_KEY_INFO: &[u8] = b"fieldseal|blind-index|v1";

/// Derives the blind-index HMAC key from the encryption key.
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if the expansion fails.
///
/// # Example
///
/// ```
/// use fieldseal::kdf::derive_index_key;
/// use secrecy::{ExposeSecret, SecretVec};
///
/// let key = SecretVec::new(vec![0u8; 32]);
/// let index_key = derive_index_key(&key).expect("derivation failed");
/// assert_eq!(index_key.expose_secret().len(), 32);
/// ```
pub fn derive_index_key(encryption_key: &SecretVec<u8>) -> Result<SecretVec<u8>, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, encryption_key.expose_secret());

    let mut okm = vec![0u8; KEY_SIZE];
    hkdf.expand(INDEX_KEY_INFO, &mut okm).map_err(|_| CryptoError::KeyDerivation)?;

    Ok(SecretVec::new(okm))
}

/// Generates a random 256-bit key (encryption key or index salt).
///
/// # Example
///
/// ```
/// use fieldseal::kdf::generate_key;
/// use secrecy::ExposeSecret;
///
/// let key = generate_key();
/// assert_eq!(key.expose_secret().len(), 32);
/// ```
#[must_use]
pub fn generate_key() -> SecretVec<u8> {
    use chacha20poly1305::aead::{rand_core::RngCore, OsRng};

    let mut key = vec![0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SecretVec::new(key)
}
