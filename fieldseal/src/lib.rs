//! # `FieldSeal`
//!
//! Encrypted personal-data fields with blind indexes for exact-match lookup
//! and uniqueness enforcement.
//!
//! ## Features
//!
//! - AEAD encryption (ChaCha20-Poly1305) with a random nonce per value
//! - Keyed blind indexes (HMAC-SHA256) over one shared normalization
//! - Idempotent backfill of legacy plaintext rows with duplicate reporting
//! - Indexed lookup with a transitional, self-disabling legacy scan
//!
//! ## Example
//!
//! ```rust
//! use fieldseal::prelude::*;
//! use secrecy::SecretVec;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let keyring = Keyring::new(SecretVec::new(vec![7u8; 32]), None)?;
//! let codec = FieldCodec::new(&keyring, FieldKind::Email)?;
//! let store = Arc::new(MemoryStore::new());
//! let scope = FieldScope::new("applications", "email");
//!
//! let legacy = store.insert_legacy(&scope, "alice@example.com");
//! let report = Migrator::new(codec.clone(), Arc::clone(&store), scope.clone()).run()?;
//! assert_eq!(report.migrated, 1);
//!
//! let lookup = LookupService::new(codec, store, scope);
//! assert_eq!(lookup.lookup_by_value("Alice@Example.com")?, Some(legacy));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blind_index;
pub mod cipher;
pub mod codec;
pub mod context;
pub mod error;
pub mod header;
pub mod kdf;
pub mod key_provider;
pub mod lookup;
pub mod migrate;
pub mod store;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::blind_index::{normalize, BlindIndex, BlindIndexer};
    pub use crate::cipher::Cipher;
    pub use crate::codec::{AmbiguityPolicy, Decoded, FieldCodec, FieldKind, Origin, SealedField};
    pub use crate::context::FieldScope;
    pub use crate::error::{CryptoError, Error, KeyProviderError, StoreError};
    pub use crate::key_provider::{KeyProvider, Keyring, StaticKeyProvider};
    pub use crate::lookup::LookupService;
    pub use crate::migrate::{MigrationReport, Migrator, VerifyReport};
    pub use crate::store::{FieldStore, MemoryStore, RowId, StoredRow};
}
