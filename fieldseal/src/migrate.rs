//! Backfill of blind indexes for rows written before the index existed.
//!
//! The run is idempotent: it only ever selects rows whose index is still
//! null, and every row is brought into conformance with a single write.
//! Per-row failures are counted and logged with the row id, never retried
//! and never allowed to abort the batch.

use crate::codec::{FieldCodec, Origin};
use crate::context::FieldScope;
use crate::error::{Error, StoreError};
use crate::store::{FieldStore, RowId, StoredRow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Rows fetched per storage round-trip.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// A row left unmigrated because its value is already owned by another row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedDuplicate {
    /// Row that was skipped
    pub row: RowId,
    /// Row owning the blind index, when known
    pub existing: Option<RowId>,
}

/// A row that could not be decoded or written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRow {
    /// Row that failed
    pub row: RowId,
    /// Error description (never contains the value)
    pub reason: String,
}

/// Outcome counts of one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Legacy rows examined
    pub scanned: u64,
    /// Rows that received a blind index in this run
    pub migrated: u64,
    /// Rows that already had a blind index when the run started
    pub already_conformant: u64,
    /// Migrated rows that were plaintext and got sealed too
    pub encrypted_legacy: u64,
    /// Migrated rows whose legacy value was ambiguous, for manual review
    pub ambiguous: Vec<RowId>,
    /// Rows skipped as duplicate identities
    pub skipped_duplicates: Vec<SkippedDuplicate>,
    /// Rows that failed to decode or persist
    pub failed: Vec<FailedRow>,
    /// Whether the unique constraint was applied or confirmed
    pub unique_index_applied: bool,
    /// Whether the run stopped before exhausting legacy rows
    pub stopped_early: bool,
}

impl MigrationReport {
    /// Every row id involved in a duplicate conflict, both sides, sorted.
    #[must_use]
    pub fn duplicate_row_ids(&self) -> Vec<RowId> {
        let mut ids: Vec<RowId> = self
            .skipped_duplicates
            .iter()
            .flat_map(|d| std::iter::once(d.row).chain(d.existing))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Whether every legacy row is now conformant.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped_duplicates.is_empty() && !self.stopped_early
    }
}

/// Result of a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Rows in the table
    pub total: u64,
    /// Rows still missing a blind index
    pub legacy: u64,
    /// Indexed rows that fail strict decoding
    pub undecryptable: Vec<RowId>,
    /// Indexed rows whose index does not match their decrypted value
    pub index_mismatch: Vec<RowId>,
    /// Indexed rows whose envelope was sealed from a legacy value
    pub sealed_by_migration: u64,
}

impl VerifyReport {
    /// Whether every row is indexed, decryptable and consistent.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.legacy == 0 && self.undecryptable.is_empty() && self.index_mismatch.is_empty()
    }
}

enum RowOutcome {
    Migrated { origin: Origin },
    Duplicate { existing: Option<RowId> },
    Failed(Error),
}

/// Brings every row of one field scope into conformance.
///
/// # Example
///
/// ```
/// use fieldseal::codec::{FieldCodec, FieldKind};
/// use fieldseal::context::FieldScope;
/// use fieldseal::key_provider::Keyring;
/// use fieldseal::migrate::Migrator;
/// use fieldseal::store::MemoryStore;
/// use secrecy::SecretVec;
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let keyring = Keyring::new(SecretVec::new(vec![7u8; 32]), None)?;
/// let codec = FieldCodec::new(&keyring, FieldKind::Email)?;
/// let store = Arc::new(MemoryStore::new());
/// let scope = FieldScope::new("applications", "email");
/// store.insert_legacy(&scope, "alice@example.com");
///
/// let report = Migrator::new(codec, store, scope).run()?;
/// assert_eq!(report.migrated, 1);
/// # Ok(())
/// # }
/// ```
pub struct Migrator<S: FieldStore> {
    codec: FieldCodec,
    store: Arc<S>,
    scope: FieldScope,
    batch_size: usize,
    stop: Option<Arc<AtomicBool>>,
}

impl<S: FieldStore> Migrator<S> {
    /// Creates a migrator for `scope`.
    pub fn new(codec: FieldCodec, store: Arc<S>, scope: FieldScope) -> Self {
        Self { codec, store, scope, batch_size: DEFAULT_BATCH_SIZE, stop: None }
    }

    /// Sets how many legacy rows are fetched per round-trip (minimum 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Stops issuing new batches once `stop` is set.
    ///
    /// The batch in flight completes; rows are never left half-written.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.load(Ordering::Relaxed))
    }

    /// Runs the migration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` only when the run itself cannot proceed (invalid
    /// scope, failure to list or count rows, or to apply the constraint).
    /// Row-level problems land in the report.
    pub fn run(&self) -> Result<MigrationReport, Error> {
        self.scope.validate()?;

        let total = self.store.count_rows(&self.scope)?;
        let legacy = self.store.count_legacy(&self.scope)?;
        let mut report =
            MigrationReport { already_conformant: total.saturating_sub(legacy), ..Default::default() };

        tracing::info!(
            scope = %self.scope,
            total,
            legacy,
            batch_size = self.batch_size,
            "starting blind index migration"
        );

        let mut cursor: Option<RowId> = None;
        loop {
            if self.stop_requested() {
                report.stopped_early = true;
                tracing::warn!(scope = %self.scope, after = ?cursor, "migration stopped by request");
                break;
            }

            let batch = self.store.legacy_rows(&self.scope, cursor, self.batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.id);

            for row in &batch {
                report.scanned += 1;
                self.record(&mut report, row.id, self.migrate_row(row));
            }

            if batch.len() < self.batch_size {
                break;
            }
        }

        if !report.stopped_early {
            self.store.ensure_unique_index(&self.scope)?;
            report.unique_index_applied = true;
        }

        tracing::info!(
            scope = %self.scope,
            scanned = report.scanned,
            migrated = report.migrated,
            already_conformant = report.already_conformant,
            encrypted_legacy = report.encrypted_legacy,
            ambiguous = report.ambiguous.len(),
            skipped_duplicates = report.skipped_duplicates.len(),
            failed = report.failed.len(),
            "blind index migration finished"
        );

        Ok(report)
    }

    fn record(&self, report: &mut MigrationReport, row: RowId, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Migrated { origin } => {
                report.migrated += 1;
                match origin {
                    Origin::Sealed => {}
                    Origin::LegacyPlaintext => report.encrypted_legacy += 1,
                    Origin::Ambiguous => {
                        report.encrypted_legacy += 1;
                        report.ambiguous.push(row);
                    }
                }
                tracing::debug!(scope = %self.scope, row_id = %row, ?origin, "row migrated");
            }
            RowOutcome::Duplicate { existing } => {
                tracing::warn!(
                    scope = %self.scope,
                    row_id = %row,
                    existing = ?existing,
                    "duplicate identity; row skipped"
                );
                report.skipped_duplicates.push(SkippedDuplicate { row, existing });
            }
            RowOutcome::Failed(err) => {
                tracing::error!(scope = %self.scope, row_id = %row, error = %err, "row migration failed");
                report.failed.push(FailedRow { row, reason: err.to_string() });
            }
        }
    }

    fn migrate_row(&self, row: &StoredRow) -> RowOutcome {
        let decoded = match self.codec.decode_legacy(&row.value) {
            Ok(decoded) => decoded,
            Err(err) => return RowOutcome::Failed(err),
        };

        let index = match self.codec.blind_index(&decoded.plaintext) {
            Ok(index) => index,
            Err(err) => return RowOutcome::Failed(err),
        };

        match self.store.find_by_index(&self.scope, &index) {
            Ok(Some(owner)) if owner != row.id => {
                return RowOutcome::Duplicate { existing: Some(owner) };
            }
            Ok(_) => {}
            Err(err) => return RowOutcome::Failed(err.into()),
        }

        let sealed = if decoded.needs_sealing() {
            match self.codec.encode_migrated(&decoded.plaintext) {
                Ok(sealed) => Some(sealed),
                Err(err) => return RowOutcome::Failed(err),
            }
        } else {
            None
        };

        let ciphertext = sealed.as_ref().map(|s| s.ciphertext());
        match self.store.backfill(&self.scope, row.id, &index, ciphertext) {
            Ok(()) => RowOutcome::Migrated { origin: decoded.origin },
            Err(StoreError::UniqueViolation { existing }) => RowOutcome::Duplicate { existing },
            Err(err) => RowOutcome::Failed(err.into()),
        }
    }

    /// Checks every row of the scope without writing anything.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if rows cannot be listed or counted.
    pub fn verify(&self) -> Result<VerifyReport, Error> {
        self.scope.validate()?;

        let mut report = VerifyReport {
            total: self.store.count_rows(&self.scope)?,
            legacy: self.store.count_legacy(&self.scope)?,
            ..Default::default()
        };

        let mut cursor: Option<RowId> = None;
        loop {
            let batch = self.store.scan(&self.scope, cursor, self.batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.id);

            for row in &batch {
                let Some(index) = row.blind_index else {
                    continue;
                };
                match self.codec.open(&row.value) {
                    Ok((plaintext, flags)) if self.codec.indexer().matches(&plaintext, &index) => {
                        if flags.is_migrated() {
                            report.sealed_by_migration += 1;
                        }
                    }
                    Ok(_) => {
                        tracing::warn!(scope = %self.scope, row_id = %row.id, "blind index mismatch");
                        report.index_mismatch.push(row.id);
                    }
                    Err(err) => {
                        tracing::error!(scope = %self.scope, row_id = %row.id, error = %err, "row fails strict decode");
                        report.undecryptable.push(row.id);
                    }
                }
            }

            if batch.len() < self.batch_size {
                break;
            }
        }

        tracing::info!(
            scope = %self.scope,
            total = report.total,
            legacy = report.legacy,
            undecryptable = report.undecryptable.len(),
            index_mismatch = report.index_mismatch.len(),
            sealed_by_migration = report.sealed_by_migration,
            "verification finished"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AmbiguityPolicy, FieldKind};
    use crate::key_provider::Keyring;
    use crate::store::MemoryStore;
    use secrecy::SecretVec;

    fn codec(kind: FieldKind) -> FieldCodec {
        let keyring = Keyring::new(SecretVec::new(vec![42u8; 32]), None).unwrap();
        FieldCodec::new(&keyring, kind).unwrap()
    }

    fn scope() -> FieldScope {
        FieldScope::new("applications", "email")
    }

    fn migrator(store: &Arc<MemoryStore>) -> Migrator<MemoryStore> {
        Migrator::new(codec(FieldKind::Email), Arc::clone(store), scope())
    }

    #[test]
    fn test_migrates_legacy_plaintext_and_seals_it() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_legacy(&scope(), "alice@example.com");

        let report = migrator(&store).run().unwrap();

        assert_eq!(report.migrated, 1);
        assert_eq!(report.encrypted_legacy, 1);
        assert!(report.unique_index_applied);
        assert!(report.is_complete());

        let row = store.get(&scope(), id).unwrap().unwrap();
        assert!(FieldCodec::is_sealed(&row.value));
        assert_eq!(codec(FieldKind::Email).decode(&row.value).unwrap(), "alice@example.com");
        assert_eq!(row.blind_index, Some(codec(FieldKind::Email).blind_index("alice@example.com").unwrap()));
    }

    #[test]
    fn test_migrates_already_encrypted_row_without_rewriting() {
        let store = Arc::new(MemoryStore::new());
        let sealed = codec(FieldKind::Email).encode("bob@example.com").unwrap();
        let id = store.insert_legacy(&scope(), sealed.ciphertext());

        let report = migrator(&store).run().unwrap();

        assert_eq!(report.migrated, 1);
        assert_eq!(report.encrypted_legacy, 0);
        let row = store.get(&scope(), id).unwrap().unwrap();
        assert_eq!(row.value, sealed.ciphertext());
        assert_eq!(row.blind_index, Some(*sealed.blind_index()));
    }

    #[test]
    fn test_counts_already_conformant_rows() {
        let store = Arc::new(MemoryStore::new());
        let codec = codec(FieldKind::Email);
        store.insert(&scope(), &codec.encode("a@x.com").unwrap()).unwrap();
        store.insert(&scope(), &codec.encode("b@x.com").unwrap()).unwrap();
        store.insert_legacy(&scope(), "c@x.com");

        let report = migrator(&store).run().unwrap();

        assert_eq!(report.already_conformant, 2);
        assert_eq!(report.migrated, 1);
    }

    #[test]
    fn test_duplicate_is_skipped_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let first = store.insert_legacy(&scope(), "a@x.com");
        let second = store.insert_legacy(&scope(), "A@X.com ");
        let third = store.insert_legacy(&scope(), "c@x.com");

        let report = migrator(&store).run().unwrap();

        assert_eq!(report.migrated, 2);
        assert_eq!(
            report.skipped_duplicates,
            vec![SkippedDuplicate { row: second, existing: Some(first) }]
        );
        assert_eq!(report.duplicate_row_ids(), vec![first, second]);
        assert!(store.get(&scope(), third).unwrap().unwrap().blind_index.is_some());

        // Skipped row keeps its original value: no data loss
        let skipped = store.get(&scope(), second).unwrap().unwrap();
        assert_eq!(skipped.value, "A@X.com ");
        assert!(skipped.blind_index.is_none());
    }

    #[test]
    fn test_failed_rows_are_reported_and_batch_continues() {
        let store = Arc::new(MemoryStore::new());
        let foreign = {
            let keyring = Keyring::new(SecretVec::new(vec![9u8; 32]), None).unwrap();
            FieldCodec::new(&keyring, FieldKind::Email).unwrap()
        };
        let bad = store.insert_legacy(&scope(), foreign.encode("x@y.com").unwrap().ciphertext());
        let blank = store.insert_legacy(&scope(), "   ");
        let good = store.insert_legacy(&scope(), "ok@y.com");

        let report = migrator(&store).run().unwrap();

        let failed: Vec<RowId> = report.failed.iter().map(|f| f.row).collect();
        assert_eq!(failed, vec![bad, blank]);
        assert_eq!(report.migrated, 1);
        assert!(store.get(&scope(), good).unwrap().unwrap().blind_index.is_some());
        assert!(!report.is_complete());
    }

    #[test]
    fn test_failure_reason_does_not_leak_value() {
        let store = Arc::new(MemoryStore::new());
        store.insert_legacy(&scope(), "fs1:c2VjcmV0QGV4YW1wbGUuY29t");

        let report = migrator(&store).run().unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(!report.failed[0].reason.contains("secret@example.com"));
    }

    #[test]
    fn test_ambiguous_rows_are_flagged() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_legacy(&scope(), "no-at-sign");

        let report = migrator(&store).run().unwrap();

        assert_eq!(report.ambiguous, vec![id]);
        assert_eq!(report.migrated, 1);
    }

    #[test]
    fn test_ambiguous_rows_fail_under_reject_policy() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_legacy(&scope(), "no-at-sign");
        let codec = codec(FieldKind::Email).with_ambiguity_policy(AmbiguityPolicy::Reject);

        let report = Migrator::new(codec, Arc::clone(&store), scope()).run().unwrap();

        assert_eq!(report.failed.iter().map(|f| f.row).collect::<Vec<_>>(), vec![id]);
        assert_eq!(store.get(&scope(), id).unwrap().unwrap().value, "no-at-sign");
    }

    #[test]
    fn test_idempotent_second_run() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..7 {
            store.insert_legacy(&scope(), &format!("user{i}@example.com"));
        }
        store.insert_legacy(&scope(), "USER3@example.com");

        let first = migrator(&store).with_batch_size(3).run().unwrap();
        let snapshot = store.scan(&scope(), None, 100).unwrap();
        let second = migrator(&store).with_batch_size(3).run().unwrap();

        assert_eq!(first.migrated, 7);
        assert_eq!(second.migrated, 0);
        assert_eq!(second.skipped_duplicates.len(), 1);
        assert_eq!(store.scan(&scope(), None, 100).unwrap(), snapshot);
    }

    #[test]
    fn test_batches_cover_all_rows() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..10 {
            store.insert_legacy(&scope(), &format!("user{i}@example.com"));
        }

        let report = migrator(&store).with_batch_size(4).run().unwrap();

        assert_eq!(report.scanned, 10);
        assert_eq!(report.migrated, 10);
        assert_eq!(store.count_legacy(&scope()).unwrap(), 0);
    }

    #[test]
    fn test_stop_signal_leaves_valid_partial_state() {
        let store = Arc::new(MemoryStore::new());
        store.insert_legacy(&scope(), "a@x.com");
        let stop = Arc::new(AtomicBool::new(true));

        let report = migrator(&store).with_stop_signal(stop).run().unwrap();

        assert!(report.stopped_early);
        assert!(!report.unique_index_applied);
        assert_eq!(report.scanned, 0);
        assert!(!store.has_unique_index(&scope()));
        assert_eq!(store.count_legacy(&scope()).unwrap(), 1);
    }

    #[test]
    fn test_invalid_scope_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let bad = FieldScope::new("users;--", "email");

        let result = Migrator::new(codec(FieldKind::Email), store, bad).run();
        assert!(matches!(result, Err(Error::Store(StoreError::InvalidScope(_)))));
    }

    #[test]
    fn test_verify_after_migration_is_clean() {
        let store = Arc::new(MemoryStore::new());
        store.insert_legacy(&scope(), "a@x.com");
        store.insert_legacy(&scope(), "b@x.com");

        let before = migrator(&store).verify().unwrap();
        assert_eq!(before.legacy, 2);
        assert!(!before.is_clean());

        migrator(&store).run().unwrap();

        let after = migrator(&store).verify().unwrap();
        assert_eq!(after.total, 2);
        assert!(after.is_clean());
        assert_eq!(after.sealed_by_migration, 2);
    }

    #[test]
    fn test_verify_counts_only_migration_sealed_rows() {
        let store = Arc::new(MemoryStore::new());
        let codec = codec(FieldKind::Email);
        store.insert(&scope(), &codec.encode("fresh@x.com").unwrap()).unwrap();
        store.insert_legacy(&scope(), codec.encode("early@x.com").unwrap().ciphertext());
        store.insert_legacy(&scope(), "plain@x.com");

        migrator(&store).run().unwrap();
        let report = migrator(&store).verify().unwrap();

        assert!(report.is_clean());
        assert_eq!(report.total, 3);
        assert_eq!(report.sealed_by_migration, 1);
    }

    #[test]
    fn test_verify_flags_index_mismatch() {
        let store = Arc::new(MemoryStore::new());
        let codec = codec(FieldKind::Email);
        let id = store.insert_legacy(&scope(), codec.encode("a@x.com").unwrap().ciphertext());
        let wrong = codec.blind_index("b@x.com").unwrap();
        store.backfill(&scope(), id, &wrong, None).unwrap();

        let report = migrator(&store).verify().unwrap();

        assert_eq!(report.index_mismatch, vec![id]);
    }
}
