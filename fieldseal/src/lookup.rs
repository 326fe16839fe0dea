//! Read path: exact-match lookup by plaintext over encrypted storage.

use crate::blind_index::{normalize, BlindIndex};
use crate::codec::{Decoded, FieldCodec};
use crate::context::FieldScope;
use crate::error::{Error, StoreError};
use crate::store::{FieldStore, RowId, StoredRow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Rows fetched per round-trip by the legacy fallback scan.
const FALLBACK_PAGE_SIZE: usize = 200;

/// Exact-match lookups and identity writes for one field scope.
///
/// The indexed path is a single point lookup on the blind-index column. The
/// legacy fallback is a transitional scan over rows without a blind index;
/// it is disabled unless enabled with [`LookupService::with_legacy_fallback`]
/// and switches itself off for good the first time it finds no legacy rows.
///
/// # Example
///
/// ```
/// use fieldseal::codec::{FieldCodec, FieldKind};
/// use fieldseal::context::FieldScope;
/// use fieldseal::key_provider::Keyring;
/// use fieldseal::lookup::LookupService;
/// use fieldseal::store::MemoryStore;
/// use secrecy::SecretVec;
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let keyring = Keyring::new(SecretVec::new(vec![7u8; 32]), None)?;
/// let codec = FieldCodec::new(&keyring, FieldKind::Email)?;
/// let service = LookupService::new(codec, Arc::new(MemoryStore::new()), FieldScope::new("users", "email"));
///
/// let id = service.register("user@test.com")?;
/// assert_eq!(service.lookup_by_value("USER@TEST.COM")?, Some(id));
/// # Ok(())
/// # }
/// ```
pub struct LookupService<S: FieldStore> {
    codec: FieldCodec,
    store: Arc<S>,
    scope: FieldScope,
    fallback_limit: Option<usize>,
    legacy_exhausted: AtomicBool,
}

impl<S: FieldStore> LookupService<S> {
    /// Creates a lookup service with the legacy fallback disabled.
    pub fn new(codec: FieldCodec, store: Arc<S>, scope: FieldScope) -> Self {
        Self { codec, store, scope, fallback_limit: None, legacy_exhausted: AtomicBool::new(false) }
    }

    /// Enables the legacy fallback, examining at most `limit` legacy rows per call.
    #[must_use]
    pub fn with_legacy_fallback(mut self, limit: usize) -> Self {
        self.fallback_limit = Some(limit.max(1));
        self
    }

    /// Returns the scope this service reads and writes.
    #[must_use]
    pub const fn scope(&self) -> &FieldScope {
        &self.scope
    }

    /// Whether the legacy fallback can still run.
    #[must_use]
    pub fn legacy_fallback_active(&self) -> bool {
        self.fallback_limit.is_some() && !self.legacy_exhausted.load(Ordering::Acquire)
    }

    /// Indexed lookup of the row holding `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns `Error::EmptyValue` for a blank query, or `Error::Store`.
    pub fn find_by_exact_value(&self, plaintext: &str) -> Result<Option<RowId>, Error> {
        let index = self.codec.blind_index(plaintext)?;
        Ok(self.store.find_by_index(&self.scope, &index)?)
    }

    /// Alias of [`LookupService::find_by_exact_value`] for "does this identity exist" checks.
    ///
    /// # Errors
    ///
    /// See [`LookupService::find_by_exact_value`].
    pub fn lookup_by_value(&self, plaintext: &str) -> Result<Option<RowId>, Error> {
        self.find_by_exact_value(plaintext)
    }

    /// Indexed lookup, then a bounded scan of legacy rows on a miss.
    ///
    /// A legacy hit is backfilled on the spot (index set, value sealed), so
    /// each hit shrinks the legacy set by one row.
    ///
    /// # Errors
    ///
    /// Returns `Error::EmptyValue` for a blank query, or `Error::Store`.
    /// Undecodable legacy rows are logged and skipped.
    pub fn find_with_legacy_fallback(&self, plaintext: &str) -> Result<Option<RowId>, Error> {
        let index = self.codec.blind_index(plaintext)?;
        if let Some(id) = self.store.find_by_index(&self.scope, &index)? {
            return Ok(Some(id));
        }

        let Some(limit) = self.fallback_limit else {
            return Ok(None);
        };
        if self.legacy_exhausted.load(Ordering::Acquire) {
            return Ok(None);
        }

        let wanted = normalize(plaintext);
        let mut examined = 0usize;
        let mut cursor: Option<RowId> = None;

        while examined < limit {
            let page_size = FALLBACK_PAGE_SIZE.min(limit - examined);
            let batch = self.store.legacy_rows(&self.scope, cursor, page_size)?;
            if batch.is_empty() {
                if cursor.is_none() {
                    self.legacy_exhausted.store(true, Ordering::Release);
                    tracing::info!(scope = %self.scope, "no legacy rows left; fallback disabled");
                }
                break;
            }
            examined += batch.len();
            cursor = batch.last().map(|row| row.id);

            for row in &batch {
                let decoded = match self.codec.decode_legacy(&row.value) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        tracing::warn!(scope = %self.scope, row_id = %row.id, error = %err, "skipping undecodable legacy row");
                        continue;
                    }
                };
                if normalize(&decoded.plaintext) == wanted {
                    self.backfill_hit(row, &decoded, &index);
                    return Ok(Some(row.id));
                }
            }

            if batch.len() < page_size {
                break;
            }
        }

        tracing::debug!(scope = %self.scope, examined, "legacy fallback miss");
        Ok(None)
    }

    fn backfill_hit(&self, row: &StoredRow, decoded: &Decoded, index: &BlindIndex) {
        let sealed = if decoded.needs_sealing() {
            match self.codec.encode_migrated(&decoded.plaintext) {
                Ok(sealed) => Some(sealed),
                Err(err) => {
                    tracing::warn!(scope = %self.scope, row_id = %row.id, error = %err, "legacy hit not sealed");
                    return;
                }
            }
        } else {
            None
        };

        let ciphertext = sealed.as_ref().map(|s| s.ciphertext());
        match self.store.backfill(&self.scope, row.id, index, ciphertext) {
            Ok(()) => tracing::debug!(scope = %self.scope, row_id = %row.id, "legacy row backfilled on lookup"),
            Err(err) => {
                tracing::warn!(scope = %self.scope, row_id = %row.id, error = %err, "opportunistic backfill failed");
            }
        }
    }

    /// Fails with [`Error::DuplicateIdentity`] if `raw` is already registered.
    ///
    /// Consults the legacy fallback when enabled.
    ///
    /// # Errors
    ///
    /// `Error::DuplicateIdentity` on a hit, plus lookup errors.
    pub fn ensure_available(&self, raw: &str) -> Result<(), Error> {
        match self.find_with_legacy_fallback(raw)? {
            Some(existing) => Err(self.duplicate(Some(existing))),
            None => Ok(()),
        }
    }

    /// Encodes `raw` and inserts it as a new row.
    ///
    /// # Errors
    ///
    /// `Error::DuplicateIdentity` when the blind index is taken, `Error::EmptyValue`
    /// for blank input, or a crypto/store error.
    pub fn register(&self, raw: &str) -> Result<RowId, Error> {
        let sealed = self.codec.encode(raw)?;
        match self.store.insert(&self.scope, &sealed) {
            Ok(id) => {
                tracing::debug!(scope = %self.scope, row_id = %id, "identity registered");
                Ok(id)
            }
            Err(StoreError::UniqueViolation { existing }) => Err(self.duplicate(existing)),
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces the value of row `id`, ciphertext and blind index together.
    ///
    /// # Errors
    ///
    /// `Error::DuplicateIdentity` if another row owns the new value,
    /// `Error::Store(StoreError::RowNotFound)` for an unknown row.
    pub fn reset_identity(&self, id: RowId, raw: &str) -> Result<(), Error> {
        let sealed = self.codec.encode(raw)?;
        match self.store.replace(&self.scope, id, &sealed) {
            Ok(()) => Ok(()),
            Err(StoreError::UniqueViolation { existing }) => Err(self.duplicate(existing)),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetches and decodes the value of row `id`.
    ///
    /// Rows carrying a blind index are decoded strictly; legacy rows go
    /// through the heuristic path.
    ///
    /// # Errors
    ///
    /// `Error::Store(StoreError::RowNotFound)` for an unknown row, or a decode error.
    pub fn reveal(&self, id: RowId) -> Result<Decoded, Error> {
        let row = self.store.get(&self.scope, id)?.ok_or(StoreError::RowNotFound(id))?;
        self.codec.decode_row(&row.value, row.format())
    }

    fn duplicate(&self, existing: Option<RowId>) -> Error {
        Error::DuplicateIdentity { scope: self.scope.to_string(), existing }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldKind, Origin};
    use crate::key_provider::Keyring;
    use crate::store::MemoryStore;
    use secrecy::SecretVec;

    fn codec() -> FieldCodec {
        let keyring = Keyring::new(SecretVec::new(vec![42u8; 32]), None).unwrap();
        FieldCodec::new(&keyring, FieldKind::Email).unwrap()
    }

    fn scope() -> FieldScope {
        FieldScope::new("users", "email")
    }

    fn service(store: &Arc<MemoryStore>) -> LookupService<MemoryStore> {
        LookupService::new(codec(), Arc::clone(store), scope())
    }

    #[test]
    fn test_example_scenario() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let codec = codec();

        let id = service.register("user@test.com").unwrap();
        let stored = store.get(&scope(), id).unwrap().unwrap();

        assert_ne!(stored.value, codec.encode("user@test.com").unwrap().ciphertext());
        assert_eq!(service.lookup_by_value("USER@TEST.COM").unwrap(), Some(id));
    }

    #[test]
    fn test_lookup_miss() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        service.register("a@x.com").unwrap();

        assert_eq!(service.lookup_by_value("b@x.com").unwrap(), None);
    }

    #[test]
    fn test_register_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let first = service.register("a@x.com").unwrap();

        let err = service.register(" A@X.COM").unwrap_err();
        assert!(err.is_duplicate());
        assert!(matches!(err, Error::DuplicateIdentity { existing: Some(id), .. } if id == first));
    }

    #[test]
    fn test_register_blank_rejected() {
        let store = Arc::new(MemoryStore::new());
        assert!(matches!(service(&store).register("  "), Err(Error::EmptyValue)));
        assert!(matches!(service(&store).lookup_by_value(""), Err(Error::EmptyValue)));
    }

    #[test]
    fn test_ensure_available() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);

        assert!(service.ensure_available("a@x.com").is_ok());
        service.register("a@x.com").unwrap();
        assert!(service.ensure_available("A@x.com").unwrap_err().is_duplicate());
    }

    #[test]
    fn test_fallback_disabled_by_default() {
        let store = Arc::new(MemoryStore::new());
        store.insert_legacy(&scope(), "legacy@x.com");
        let service = service(&store);

        assert!(!service.legacy_fallback_active());
        assert_eq!(service.find_with_legacy_fallback("legacy@x.com").unwrap(), None);
        assert_eq!(store.count_legacy(&scope()).unwrap(), 1);
    }

    #[test]
    fn test_fallback_finds_and_backfills_legacy_row() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_legacy(&scope(), "Legacy@X.com");
        let service = service(&store).with_legacy_fallback(1_000);

        assert_eq!(service.find_with_legacy_fallback("legacy@x.com ").unwrap(), Some(id));

        let row = store.get(&scope(), id).unwrap().unwrap();
        assert!(row.blind_index.is_some());
        assert!(FieldCodec::is_sealed(&row.value));
        assert_eq!(service.lookup_by_value("legacy@x.com").unwrap(), Some(id));
        assert_eq!(service.reveal(id).unwrap().plaintext, "Legacy@X.com");
    }

    #[test]
    fn test_fallback_shrinks_legacy_set_by_exactly_n() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..10 {
            store.insert_legacy(&scope(), &format!("user{i}@example.com"));
        }
        let service = service(&store).with_legacy_fallback(1_000);
        let before = store.count_legacy(&scope()).unwrap();

        for i in [1, 4, 7, 9] {
            assert!(service.find_with_legacy_fallback(&format!("user{i}@example.com")).unwrap().is_some());
        }

        assert_eq!(store.count_legacy(&scope()).unwrap(), before - 4);
    }

    #[test]
    fn test_fallback_respects_limit() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store.insert_legacy(&scope(), &format!("user{i}@example.com"));
        }
        let service = service(&store).with_legacy_fallback(3);

        assert_eq!(service.find_with_legacy_fallback("user4@example.com").unwrap(), None);
        assert!(service.find_with_legacy_fallback("user2@example.com").unwrap().is_some());
    }

    #[test]
    fn test_fallback_skips_undecodable_rows() {
        let store = Arc::new(MemoryStore::new());
        store.insert_legacy(&scope(), "fs1:AAAA");
        let id = store.insert_legacy(&scope(), "b@x.com");
        let service = service(&store).with_legacy_fallback(100);

        assert_eq!(service.find_with_legacy_fallback("b@x.com").unwrap(), Some(id));
    }

    #[test]
    fn test_fallback_latches_off_when_no_legacy_rows() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store).with_legacy_fallback(100);
        assert!(service.legacy_fallback_active());

        assert_eq!(service.find_with_legacy_fallback("a@x.com").unwrap(), None);
        assert!(!service.legacy_fallback_active());

        // Rows appearing later are not scanned again
        store.insert_legacy(&scope(), "a@x.com");
        assert_eq!(service.find_with_legacy_fallback("a@x.com").unwrap(), None);
    }

    #[test]
    fn test_reset_identity_moves_index() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let id = service.register("old@x.com").unwrap();

        service.reset_identity(id, "new@x.com").unwrap();

        assert_eq!(service.lookup_by_value("old@x.com").unwrap(), None);
        assert_eq!(service.lookup_by_value("new@x.com").unwrap(), Some(id));
        assert_eq!(service.reveal(id).unwrap().plaintext, "new@x.com");
    }

    #[test]
    fn test_reset_identity_conflict() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        service.register("a@x.com").unwrap();
        let b = service.register("b@x.com").unwrap();

        assert!(service.reset_identity(b, "a@x.com").unwrap_err().is_duplicate());
        assert_eq!(service.reveal(b).unwrap().plaintext, "b@x.com");
    }

    #[test]
    fn test_reveal_legacy_and_missing() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_legacy(&scope(), "plain@x.com");
        let service = service(&store);

        let decoded = service.reveal(id).unwrap();
        assert_eq!(decoded.origin, Origin::LegacyPlaintext);
        assert!(matches!(
            service.reveal(RowId(404)),
            Err(Error::Store(StoreError::RowNotFound(RowId(404))))
        ));
    }

    #[test]
    fn test_reveal_sealed_row_is_strict() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_legacy(&scope(), "plain@x.com");
        let index = codec().blind_index("plain@x.com").unwrap();
        // Indexed row holding plaintext is corrupt, not legacy
        store.backfill(&scope(), id, &index, None).unwrap();

        assert!(matches!(service(&store).reveal(id), Err(Error::Crypto(_))));
    }
}
