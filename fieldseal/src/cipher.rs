//! Probabilistic authenticated encryption of single field values.
//!
//! Every call draws a fresh random nonce, so encrypting the same value twice
//! yields unlinkable ciphertexts. The envelope header is authenticated as
//! associated data.

use crate::error::CryptoError;
use crate::header::{EnvelopeHeader, HeaderFlags};
use crate::kdf::KEY_SIZE;
use crate::key_provider::Keyring;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::ExposeSecret;
use zeroize::Zeroize;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Field cipher over ChaCha20-Poly1305.
///
/// # Example
///
/// ```
/// use fieldseal::cipher::Cipher;
/// use fieldseal::key_provider::Keyring;
/// use secrecy::SecretVec;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let keyring = Keyring::new(SecretVec::new(vec![7u8; 32]), None)?;
/// let cipher = Cipher::new(&keyring)?;
///
/// let ciphertext = cipher.encrypt("alice@example.com")?;
/// assert_eq!(cipher.decrypt(&ciphertext)?, "alice@example.com");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Cipher {
    aead: ChaCha20Poly1305,
}

impl Cipher {
    /// Creates a cipher from the keyring's encryption key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the key is not 32 bytes.
    pub fn new(keyring: &Keyring) -> Result<Self, CryptoError> {
        let key = keyring.encryption_key().expose_secret();
        let aead = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: key.len() })?;
        Ok(Self { aead })
    }

    /// Encrypts a plaintext value.
    ///
    /// # Returns
    ///
    /// Ciphertext with embedded header: `[header][encrypted_data+tag]`
    ///
    /// # Errors
    ///
    /// Returns error if header serialization or encryption fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        self.encrypt_with_flags(plaintext, HeaderFlags::empty())
    }

    /// Encrypts a plaintext value, recording `flags` in the header.
    ///
    /// # Errors
    ///
    /// Returns error if header serialization or encryption fails.
    pub fn encrypt_with_flags(
        &self,
        plaintext: &str,
        flags: HeaderFlags,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let header = EnvelopeHeader::new(flags, nonce_bytes.to_vec());
        let header_bytes = header.to_bytes()?;

        let nonce = Nonce::from(nonce_bytes);
        let ciphertext = self
            .aead
            .encrypt(&nonce, Payload { msg: plaintext.as_bytes(), aad: &header_bytes })
            .map_err(|e| CryptoError::EncryptionFailed(format!("ChaCha20-Poly1305: {e}")))?;

        let mut result = Vec::with_capacity(header_bytes.len() + ciphertext.len());
        result.extend_from_slice(&header_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Decrypts a value produced by [`Cipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Header parsing fails
    /// - Authentication fails (wrong key, corruption and tampering are indistinguishable)
    /// - The plaintext is not UTF-8
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<String, CryptoError> {
        self.open(ciphertext).map(|(plaintext, _)| plaintext)
    }

    /// Decrypts and also returns the header flags.
    ///
    /// # Errors
    ///
    /// Same as [`Cipher::decrypt`].
    pub fn open(&self, ciphertext: &[u8]) -> Result<(String, HeaderFlags), CryptoError> {
        let (header, header_len) = EnvelopeHeader::from_bytes(ciphertext)?;

        let nonce_bytes: [u8; NONCE_SIZE] = header
            .nonce()
            .try_into()
            .map_err(|_| CryptoError::InvalidHeader("invalid nonce size".to_string()))?;
        let nonce = Nonce::from(nonce_bytes);

        let plaintext = self
            .aead
            .decrypt(
                &nonce,
                Payload { msg: &ciphertext[header_len..], aad: &ciphertext[..header_len] },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        let plaintext = String::from_utf8(plaintext).map_err(|e| {
            e.into_bytes().zeroize();
            CryptoError::InvalidUtf8
        })?;
        Ok((plaintext, header.flags()))
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(ChaCha20-Poly1305)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretVec;

    fn test_cipher(byte: u8) -> Cipher {
        let keyring = Keyring::new(SecretVec::new(vec![byte; 32]), None).unwrap();
        Cipher::new(&keyring).unwrap()
    }

    #[test]
    fn test_cipher_round_trip() {
        let cipher = test_cipher(42);

        let ciphertext = cipher.encrypt("alice@example.com").expect("Encryption failed");
        let decrypted = cipher.decrypt(&ciphertext).expect("Decryption failed");

        assert_eq!(decrypted, "alice@example.com");
    }

    #[test]
    fn test_cipher_is_probabilistic() {
        let cipher = test_cipher(42);

        let c1 = cipher.encrypt("alice@example.com").unwrap();
        let c2 = cipher.encrypt("alice@example.com").unwrap();

        assert_ne!(c1, c2);
        assert_eq!(cipher.decrypt(&c1).unwrap(), cipher.decrypt(&c2).unwrap());
    }

    #[test]
    fn test_ciphertext_never_contains_plaintext() {
        let cipher = test_cipher(42);
        let plaintext = "alice@example.com";

        let ciphertext = cipher.encrypt(plaintext).unwrap();

        assert!(!ciphertext.windows(plaintext.len()).any(|w| w == plaintext.as_bytes()));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let ciphertext = test_cipher(1).encrypt("alice@example.com").unwrap();

        let result = test_cipher(2).decrypt(&ciphertext);
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_corrupted_ciphertext_fails_authentication() {
        let cipher = test_cipher(42);
        let mut ciphertext = cipher.encrypt("alice@example.com").unwrap();

        let len = ciphertext.len();
        ciphertext[len - 1] ^= 0xFF;

        assert!(matches!(cipher.decrypt(&ciphertext), Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_tampered_flags_fail_authentication() {
        let cipher = test_cipher(42);
        let mut ciphertext = cipher.encrypt("alice@example.com").unwrap();

        // Header is AAD: flipping the migrated flag must break the tag
        ciphertext[1] ^= 0x01;

        assert!(matches!(cipher.decrypt(&ciphertext), Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_flags_round_trip() {
        let cipher = test_cipher(42);
        let ciphertext =
            cipher.encrypt_with_flags("12345", HeaderFlags::empty().with_migrated()).unwrap();

        let (plaintext, flags) = cipher.open(&ciphertext).unwrap();
        assert_eq!(plaintext, "12345");
        assert!(flags.is_migrated());
    }

    #[test]
    fn test_truncated_ciphertext_is_malformed() {
        let cipher = test_cipher(42);
        assert!(matches!(cipher.decrypt(&[1, 0]), Err(CryptoError::InvalidHeader(_))));
        assert!(matches!(cipher.decrypt(&[]), Err(CryptoError::InvalidHeader(_))));
    }

    #[test]
    fn test_empty_and_large_plaintext() {
        let cipher = test_cipher(42);

        let empty = cipher.encrypt("").unwrap();
        assert_eq!(cipher.decrypt(&empty).unwrap(), "");

        let large = "x".repeat(10_000);
        let ciphertext = cipher.encrypt(&large).unwrap();
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), large);
    }

    #[test]
    fn test_cipher_clone() {
        let c1 = test_cipher(42);
        let c2 = c1.clone();

        let ciphertext = c1.encrypt("test").unwrap();
        assert_eq!(c2.decrypt(&ciphertext).unwrap(), "test");
    }
}
