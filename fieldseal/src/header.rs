//! Envelope header for sealed field values.
//!
//! The header carries what decryption needs:
//! - Envelope version
//! - Flags
//! - Nonce

use crate::error::CryptoError;

/// Envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    /// Creates empty flags.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Checks whether the value was sealed by the legacy migration.
    #[must_use]
    pub const fn is_migrated(self) -> bool {
        (self.0 & 0x01) != 0
    }

    /// Marks the value as sealed from a legacy plaintext row.
    #[must_use]
    pub const fn with_migrated(mut self) -> Self {
        self.0 |= 0x01;
        self
    }

    /// Returns the raw flags value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Creates flags from a raw value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Envelope header preceding the AEAD output.
///
/// Format:
/// ```text
/// [version:1][flags:1][nonce_len:1][nonce:N]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    version: u8,
    flags: HeaderFlags,
    nonce: Vec<u8>,
}

impl EnvelopeHeader {
    /// Creates a new header for the current envelope version.
    #[must_use]
    pub const fn new(flags: HeaderFlags, nonce: Vec<u8>) -> Self {
        Self { version: ENVELOPE_VERSION, flags, nonce }
    }

    /// Returns the envelope version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Returns the header flags.
    #[must_use]
    pub const fn flags(&self) -> HeaderFlags {
        self.flags
    }

    /// Returns the nonce.
    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Serializes the header to bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the nonce is longer than 255 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        if self.nonce.len() > 255 {
            return Err(CryptoError::InvalidHeader(format!(
                "nonce too long: {} bytes (max: 255)",
                self.nonce.len()
            )));
        }

        let mut bytes = Vec::with_capacity(3 + self.nonce.len());
        bytes.push(self.version);
        bytes.push(self.flags.as_u8());

        // Safe cast: length validated above
        #[allow(clippy::cast_possible_truncation)]
        let nonce_len = self.nonce.len() as u8;
        bytes.push(nonce_len);
        bytes.extend_from_slice(&self.nonce);

        Ok(bytes)
    }

    /// Deserializes a header, returning it with the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The data is too short
    /// - The version is not supported
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), CryptoError> {
        let Some(&version) = data.first() else {
            return Err(CryptoError::InvalidHeader("empty header data".to_string()));
        };

        if version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion {
                version,
                supported: ENVELOPE_VERSION.to_string(),
            });
        }

        let (Some(&flags), Some(&nonce_len)) = (data.get(1), data.get(2)) else {
            return Err(CryptoError::InvalidHeader("missing flags or nonce length".to_string()));
        };

        let pos = 3;
        let end = pos + nonce_len as usize;
        let nonce = data
            .get(pos..end)
            .ok_or_else(|| CryptoError::InvalidHeader("nonce truncated".to_string()))?
            .to_vec();

        Ok((Self { version, flags: HeaderFlags::from_u8(flags), nonce }, end))
    }
}
