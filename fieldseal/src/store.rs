//! Storage seam for protected columns.
//!
//! This crate owns exactly two columns per protected field: the value column
//! (ciphertext, or plaintext on legacy rows) and `<column>_blind_index`.
//! Everything else about the row belongs to the caller's schema.

use crate::blind_index::BlindIndex;
use crate::codec::{RowFormat, SealedField};
use crate::context::FieldScope;
use crate::error::StoreError;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;

/// Primary key of a row in the owning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(pub i64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two columns of one row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Row id
    pub id: RowId,
    /// Value column: ciphertext or legacy plaintext
    pub value: String,
    /// Blind-index column; `None` on legacy rows
    pub blind_index: Option<BlindIndex>,
}

impl StoredRow {
    /// How the value column must be decoded.
    #[must_use]
    pub const fn format(&self) -> RowFormat {
        RowFormat::of(self.blind_index.as_ref())
    }
}

/// Storage operations used by the migrator and lookup service.
///
/// Each method is one storage round-trip. Implementations must be
/// thread-safe and must reject a second row with the same non-null blind
/// index with [`StoreError::UniqueViolation`] once
/// [`FieldStore::ensure_unique_index`] has run.
pub trait FieldStore: Send + Sync {
    /// Inserts a new row holding `field`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if the index is already taken.
    fn insert(&self, scope: &FieldScope, field: &SealedField) -> Result<RowId, StoreError>;

    /// Fetches one row.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` on storage failure.
    fn get(&self, scope: &FieldScope, id: RowId) -> Result<Option<StoredRow>, StoreError>;

    /// Replaces both ciphertext and blind index of an existing row.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RowNotFound` or `StoreError::UniqueViolation`.
    fn replace(&self, scope: &FieldScope, id: RowId, field: &SealedField)
        -> Result<(), StoreError>;

    /// Deletes a whole row; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` on storage failure.
    fn delete(&self, scope: &FieldScope, id: RowId) -> Result<bool, StoreError>;

    /// Indexed equality lookup on the blind-index column.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` on storage failure.
    fn find_by_index(
        &self,
        scope: &FieldScope,
        index: &BlindIndex,
    ) -> Result<Option<RowId>, StoreError>;

    /// All rows ordered by id, strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` on storage failure.
    fn scan(
        &self,
        scope: &FieldScope,
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError>;

    /// Rows whose blind index is null, ordered by id, strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` on storage failure.
    fn legacy_rows(
        &self,
        scope: &FieldScope,
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError>;

    /// Sets the blind index of a row and, when given, its new ciphertext, in
    /// one atomic write.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::RowNotFound` or `StoreError::UniqueViolation`.
    fn backfill(
        &self,
        scope: &FieldScope,
        id: RowId,
        index: &BlindIndex,
        ciphertext: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Total number of rows in the scope's table.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` on storage failure.
    fn count_rows(&self, scope: &FieldScope) -> Result<u64, StoreError>;

    /// Number of rows whose blind index is null.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` on storage failure.
    fn count_legacy(&self, scope: &FieldScope) -> Result<u64, StoreError>;

    /// Applies (or confirms) the unique constraint on the blind-index column.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if duplicates are still present.
    fn ensure_unique_index(&self, scope: &FieldScope) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryTable {
    rows: BTreeMap<RowId, StoredRow>,
    by_index: HashMap<BlindIndex, RowId>,
    unique_applied: bool,
}

impl MemoryTable {
    fn claim(&self, id: RowId, index: &BlindIndex) -> Result<(), StoreError> {
        match self.by_index.get(index) {
            Some(&owner) if owner != id => Err(StoreError::UniqueViolation { existing: Some(owner) }),
            _ => Ok(()),
        }
    }
}

/// In-memory [`FieldStore`] with a hash index on the blind-index column.
///
/// Non-null blind indexes are always unique, as with a `UNIQUE` index in SQL
/// that ignores nulls.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<FieldScope, MemoryTable>>,
    next_id: Mutex<i64>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> RowId {
        let mut next = self.next_id.lock();
        *next += 1;
        RowId(*next)
    }

    /// Inserts a row as the pre-encryption system wrote it: raw value, no index.
    pub fn insert_legacy(&self, scope: &FieldScope, value: &str) -> RowId {
        let id = self.allocate_id();
        let mut tables = self.tables.write();
        tables
            .entry(scope.clone())
            .or_default()
            .rows
            .insert(id, StoredRow { id, value: value.to_string(), blind_index: None });
        id
    }

    /// Whether [`FieldStore::ensure_unique_index`] has run for `scope`.
    #[must_use]
    pub fn has_unique_index(&self, scope: &FieldScope) -> bool {
        self.tables.read().get(scope).is_some_and(|t| t.unique_applied)
    }
}

impl FieldStore for MemoryStore {
    fn insert(&self, scope: &FieldScope, field: &SealedField) -> Result<RowId, StoreError> {
        let id = self.allocate_id();
        let mut tables = self.tables.write();
        let table = tables.entry(scope.clone()).or_default();

        table.claim(id, field.blind_index())?;
        table.by_index.insert(*field.blind_index(), id);
        table.rows.insert(
            id,
            StoredRow {
                id,
                value: field.ciphertext().to_string(),
                blind_index: Some(*field.blind_index()),
            },
        );
        Ok(id)
    }

    fn get(&self, scope: &FieldScope, id: RowId) -> Result<Option<StoredRow>, StoreError> {
        Ok(self.tables.read().get(scope).and_then(|t| t.rows.get(&id).cloned()))
    }

    fn replace(
        &self,
        scope: &FieldScope,
        id: RowId,
        field: &SealedField,
    ) -> Result<(), StoreError> {
        self.backfill(scope, id, field.blind_index(), Some(field.ciphertext()))
    }

    fn delete(&self, scope: &FieldScope, id: RowId) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(scope) else {
            return Ok(false);
        };
        let Some(row) = table.rows.remove(&id) else {
            return Ok(false);
        };
        if let Some(index) = row.blind_index {
            table.by_index.remove(&index);
        }
        Ok(true)
    }

    fn find_by_index(
        &self,
        scope: &FieldScope,
        index: &BlindIndex,
    ) -> Result<Option<RowId>, StoreError> {
        Ok(self.tables.read().get(scope).and_then(|t| t.by_index.get(index).copied()))
    }

    fn scan(
        &self,
        scope: &FieldScope,
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let tables = self.tables.read();
        let Some(table) = tables.get(scope) else {
            return Ok(Vec::new());
        };
        let start = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(table.rows.range((start, Bound::Unbounded)).map(|(_, r)| r.clone()).take(limit).collect())
    }

    fn legacy_rows(
        &self,
        scope: &FieldScope,
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let tables = self.tables.read();
        let Some(table) = tables.get(scope) else {
            return Ok(Vec::new());
        };
        Ok(table
            .rows
            .values()
            .filter(|row| after.map_or(true, |a| row.id > a) && row.blind_index.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    fn backfill(
        &self,
        scope: &FieldScope,
        id: RowId,
        index: &BlindIndex,
        ciphertext: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let table = tables.get_mut(scope).ok_or(StoreError::RowNotFound(id))?;
        if !table.rows.contains_key(&id) {
            return Err(StoreError::RowNotFound(id));
        }
        table.claim(id, index)?;

        let row = table.rows.get_mut(&id).ok_or(StoreError::RowNotFound(id))?;
        let previous = row.blind_index.replace(*index);
        if let Some(value) = ciphertext {
            row.value = value.to_string();
        }

        if let Some(old) = previous.filter(|old| old != index) {
            table.by_index.remove(&old);
        }
        table.by_index.insert(*index, id);
        Ok(())
    }

    fn count_rows(&self, scope: &FieldScope) -> Result<u64, StoreError> {
        Ok(self.tables.read().get(scope).map_or(0, |t| t.rows.len() as u64))
    }

    fn count_legacy(&self, scope: &FieldScope) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .read()
            .get(scope)
            .map_or(0, |t| t.rows.values().filter(|r| r.blind_index.is_none()).count() as u64))
    }

    fn ensure_unique_index(&self, scope: &FieldScope) -> Result<(), StoreError> {
        self.tables.write().entry(scope.clone()).or_default().unique_applied = true;
        Ok(())
    }
}
