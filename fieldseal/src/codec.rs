//! Field codec: the only way to turn a raw value into storable form.
//!
//! [`FieldCodec::encode`] always yields ciphertext and blind index together.
//! Decoding has two paths:
//! - [`FieldCodec::decode`] is strict and used for every row that carries a
//!   blind index (written by this layer).
//! - [`FieldCodec::decode_legacy`] tolerates rows accumulated before
//!   encryption existed. It sniffs the value's shape and is reachable only for
//!   rows whose index column is still null.

use crate::blind_index::{normalize, BlindIndex, BlindIndexer};
use crate::cipher::Cipher;
use crate::error::{CryptoError, Error};
use crate::header::HeaderFlags;
use crate::key_provider::Keyring;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use std::fmt;
use std::str::FromStr;

/// Magic prefix of every sealed value in a text column.
///
/// Format: `fs1:<base64url(envelope)>`
pub const SEALED_PREFIX: &str = "fs1:";

/// Longest plausible legacy phone number, in digits.
const MAX_PHONE_DIGITS: usize = 15;
/// Longest plausible legacy email address.
const MAX_EMAIL_LEN: usize = 255;
/// Longest plausible legacy identifier (national / student id).
const MAX_IDENTIFIER_LEN: usize = 32;

/// Kind of personal data held by a field; drives the legacy shape check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Email address
    Email,
    /// Telephone number
    Phone,
    /// National identity number
    NationalId,
    /// Student identifier
    StudentId,
    /// Anything else; every unprefixed value counts as plaintext
    Other,
}

impl FieldKind {
    /// Checks whether an unprefixed stored value has this kind's plaintext shape.
    ///
    /// Returns the failed check on mismatch.
    fn plaintext_shape(self, value: &str) -> Result<(), &'static str> {
        let v = value.trim();
        match self {
            Self::Email => {
                if !v.contains('@') {
                    return Err("email without '@'");
                }
                if v.len() > MAX_EMAIL_LEN {
                    return Err("email longer than 255 chars");
                }
            }
            Self::Phone => {
                let digits = v.strip_prefix('+').unwrap_or(v);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err("phone with non-digit characters");
                }
                if digits.len() > MAX_PHONE_DIGITS {
                    return Err("phone longer than 15 digits");
                }
            }
            Self::NationalId | Self::StudentId => {
                if v.is_empty() || !v.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                    return Err("identifier with unexpected characters");
                }
                if v.len() > MAX_IDENTIFIER_LEN {
                    return Err("identifier longer than 32 chars");
                }
            }
            Self::Other => {}
        }
        Ok(())
    }
}

impl FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "phone" | "telephone" => Ok(Self::Phone),
            "national_id" | "national-id" => Ok(Self::NationalId),
            "student_id" | "student-id" => Ok(Self::StudentId),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown field kind: {other}")),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::NationalId => "national_id",
            Self::StudentId => "student_id",
            Self::Other => "other",
        })
    }
}

/// What to do with a legacy value that matches neither framing nor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmbiguityPolicy {
    /// Treat as plaintext (never double-encrypt) and log for review
    #[default]
    AssumePlaintext,
    /// Fail with [`Error::LegacyFormatAmbiguity`]
    Reject,
}

/// How a stored value must be read, decided by the row and not the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// Row carries a blind index: written by this layer, decoded strictly
    Sealed,
    /// Row predates the blind index: heuristic decode allowed
    Legacy,
}

impl RowFormat {
    /// Format of a row given its blind-index column.
    #[must_use]
    pub const fn of(blind_index: Option<&BlindIndex>) -> Self {
        if blind_index.is_some() {
            Self::Sealed
        } else {
            Self::Legacy
        }
    }
}

/// Storable form of a sensitive field.
///
/// Ciphertext and blind index are only ever produced together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedField {
    ciphertext: String,
    blind_index: BlindIndex,
}

impl SealedField {
    /// Text written to the value column.
    #[must_use]
    pub fn ciphertext(&self) -> &str {
        &self.ciphertext
    }

    /// Token written to the `<column>_blind_index` column.
    #[must_use]
    pub const fn blind_index(&self) -> &BlindIndex {
        &self.blind_index
    }

    /// Splits into `(ciphertext, blind_index)`.
    #[must_use]
    pub fn into_parts(self) -> (String, BlindIndex) {
        (self.ciphertext, self.blind_index)
    }
}

/// Where a decoded legacy value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Carried the envelope prefix and decrypted
    Sealed,
    /// Unprefixed and shaped like plaintext of the field's kind
    LegacyPlaintext,
    /// Unprefixed and not shaped like plaintext; assumed plaintext
    Ambiguous,
}

/// Result of the legacy decode path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Recovered value
    pub plaintext: String,
    /// Classification of the stored value
    pub origin: Origin,
}

impl Decoded {
    /// Whether the stored value is not yet encrypted at rest.
    #[must_use]
    pub const fn needs_sealing(&self) -> bool {
        !matches!(self.origin, Origin::Sealed)
    }
}

/// Facade combining [`Cipher`] and [`BlindIndexer`] for one field kind.
///
/// # Example
///
/// ```
/// use fieldseal::codec::{FieldCodec, FieldKind};
/// use fieldseal::key_provider::Keyring;
/// use secrecy::SecretVec;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let keyring = Keyring::new(SecretVec::new(vec![7u8; 32]), None)?;
/// let codec = FieldCodec::new(&keyring, FieldKind::Email)?;
///
/// let sealed = codec.encode("user@test.com")?;
/// assert_eq!(codec.decode(sealed.ciphertext())?, "user@test.com");
/// assert_eq!(codec.blind_index("USER@TEST.COM")?, *sealed.blind_index());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FieldCodec {
    cipher: Cipher,
    indexer: BlindIndexer,
    kind: FieldKind,
    policy: AmbiguityPolicy,
}

impl FieldCodec {
    /// Creates a codec for fields of `kind`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if the keyring cannot key the cipher or HMAC.
    pub fn new(keyring: &Keyring, kind: FieldKind) -> Result<Self, Error> {
        Ok(Self {
            cipher: Cipher::new(keyring)?,
            indexer: BlindIndexer::new(keyring)?,
            kind,
            policy: AmbiguityPolicy::default(),
        })
    }

    /// Sets the policy for ambiguous legacy values.
    #[must_use]
    pub const fn with_ambiguity_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the field kind.
    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Returns the ambiguity policy.
    #[must_use]
    pub const fn ambiguity_policy(&self) -> AmbiguityPolicy {
        self.policy
    }

    /// Returns the blind indexer.
    #[must_use]
    pub const fn indexer(&self) -> &BlindIndexer {
        &self.indexer
    }

    /// Encrypts `raw` and derives its blind index.
    ///
    /// The ciphertext holds `raw` exactly as given; the index covers
    /// `normalize(raw)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EmptyValue` if `raw` is blank, or `Error::Crypto` on
    /// encryption failure.
    pub fn encode(&self, raw: &str) -> Result<SealedField, Error> {
        self.seal(raw, HeaderFlags::empty())
    }

    /// Like [`FieldCodec::encode`], marking the envelope as migrated.
    ///
    /// # Errors
    ///
    /// Same as [`FieldCodec::encode`].
    pub fn encode_migrated(&self, plaintext: &str) -> Result<SealedField, Error> {
        self.seal(plaintext, HeaderFlags::empty().with_migrated())
    }

    fn seal(&self, raw: &str, flags: HeaderFlags) -> Result<SealedField, Error> {
        let blind_index = self.blind_index(raw)?;
        let envelope = self.cipher.encrypt_with_flags(raw, flags)?;
        let ciphertext = format!("{SEALED_PREFIX}{}", URL_SAFE_NO_PAD.encode(envelope));
        Ok(SealedField { ciphertext, blind_index })
    }

    /// Derives the blind index used for lookups of `value`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EmptyValue` if `value` is blank after normalization.
    pub fn blind_index(&self, value: &str) -> Result<BlindIndex, Error> {
        let normalized = normalize(value);
        if normalized.is_empty() {
            return Err(Error::EmptyValue);
        }
        Ok(self.indexer.derive_normalized(&normalized))
    }

    /// Whether a stored value carries the envelope prefix.
    #[must_use]
    pub fn is_sealed(stored: &str) -> bool {
        stored.starts_with(SEALED_PREFIX)
    }

    /// Strictly decodes a sealed value.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Malformed` if the prefix or base64 framing is
    /// missing, and `CryptoError::AuthenticationFailed` on a wrong key or
    /// tampered value.
    pub fn decode(&self, stored: &str) -> Result<String, Error> {
        self.open(stored).map(|(plaintext, _)| plaintext)
    }

    /// Like [`FieldCodec::decode`], also returning the envelope flags.
    ///
    /// # Errors
    ///
    /// See [`FieldCodec::decode`].
    pub fn open(&self, stored: &str) -> Result<(String, HeaderFlags), Error> {
        let encoded = stored
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| CryptoError::Malformed("missing envelope prefix".to_string()))?;
        let envelope = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| CryptoError::Malformed(format!("envelope encoding: {e}")))?;
        Ok(self.cipher.open(&envelope)?)
    }

    /// Decodes a value from a row without a blind index.
    ///
    /// Prefixed values must decrypt; a prefixed value that fails is a crypto
    /// error, never reinterpreted as plaintext. Unprefixed values are legacy
    /// plaintext; when they do not look like this kind's plaintext the
    /// [`AmbiguityPolicy`] decides.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` for undecryptable sealed values and
    /// `Error::LegacyFormatAmbiguity` under [`AmbiguityPolicy::Reject`].
    pub fn decode_legacy(&self, stored: &str) -> Result<Decoded, Error> {
        if Self::is_sealed(stored) {
            let plaintext = self.decode(stored)?;
            return Ok(Decoded { plaintext, origin: Origin::Sealed });
        }

        match self.kind.plaintext_shape(stored) {
            Ok(()) => Ok(Decoded { plaintext: stored.to_string(), origin: Origin::LegacyPlaintext }),
            Err(reason) => match self.policy {
                AmbiguityPolicy::AssumePlaintext => {
                    tracing::warn!(kind = %self.kind, reason, "ambiguous legacy value assumed plaintext");
                    Ok(Decoded { plaintext: stored.to_string(), origin: Origin::Ambiguous })
                }
                AmbiguityPolicy::Reject => Err(Error::LegacyFormatAmbiguity { reason }),
            },
        }
    }

    /// Decodes according to the row's format.
    ///
    /// # Errors
    ///
    /// See [`FieldCodec::decode`] and [`FieldCodec::decode_legacy`].
    pub fn decode_row(&self, stored: &str, format: RowFormat) -> Result<Decoded, Error> {
        match format {
            RowFormat::Sealed => {
                Ok(Decoded { plaintext: self.decode(stored)?, origin: Origin::Sealed })
            }
            RowFormat::Legacy => self.decode_legacy(stored),
        }
    }
}
