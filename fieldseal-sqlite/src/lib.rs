//! SQLite storage backend for `FieldSeal`.
//!
//! Each [`FieldScope`] maps to a table holding an `id INTEGER PRIMARY KEY`,
//! the value column and `<column>_blind_index`. Tables created elsewhere only
//! need those three columns; [`SqliteStore::init_schema`] adds the index
//! column to an existing table that lacks it.

#![warn(clippy::pedantic, clippy::nursery)]

use fieldseal::blind_index::BlindIndex;
use fieldseal::codec::SealedField;
use fieldseal::context::FieldScope;
use fieldseal::error::StoreError;
use fieldseal::store::{FieldStore, RowId, StoredRow};
use parking_lot::Mutex;
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;

/// [`FieldStore`] over a single SQLite connection.
///
/// Statements are serialized through one connection; each trait method runs
/// one statement or one transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a database file.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        Ok(Self::from_connection(conn))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if SQLite cannot allocate it.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an existing connection.
    #[must_use]
    pub const fn from_connection(conn: Connection) -> Self {
        Self { conn: Mutex::new(conn) }
    }

    /// Creates the scope's table if missing and makes sure it has a
    /// blind-index column with a lookup index.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidScope` for a non-identifier name, or
    /// `StoreError::Backend`.
    pub fn init_schema(&self, scope: &FieldScope) -> Result<(), StoreError> {
        scope.validate()?;
        let table = scope.table_name();
        let column = scope.column_name();
        let index_column = scope.index_column();

        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    {column} TEXT NOT NULL,
                    {index_column} TEXT
                )"
            ),
            [],
        )
        .map_err(backend)?;

        if !has_column(&conn, table, &index_column)? {
            tracing::info!(%scope, column = %index_column, "adding blind index column");
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {index_column} TEXT"), [])
                .map_err(backend)?;
        }

        // The unique index also serves lookups once it exists.
        if !index_exists(&conn, &unique_index_name(scope))? {
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {table}({index_column})",
                    lookup_index_name(scope)
                ),
                [],
            )
            .map_err(backend)?;
        }
        Ok(())
    }

    /// Inserts a raw value with no blind index, as rows written before
    /// encryption existed look.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidScope` or `StoreError::Backend`.
    pub fn insert_legacy(&self, scope: &FieldScope, value: &str) -> Result<RowId, StoreError> {
        scope.validate()?;
        let conn = self.conn.lock();
        conn.execute(
            &format!("INSERT INTO {} ({}) VALUES (?1)", scope.table_name(), scope.column_name()),
            params![value],
        )
        .map_err(backend)?;
        Ok(RowId(conn.last_insert_rowid()))
    }

    /// Whether the unique blind-index constraint exists for `scope`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the catalog cannot be read.
    pub fn has_unique_index(&self, scope: &FieldScope) -> Result<bool, StoreError> {
        scope.validate()?;
        let conn = self.conn.lock();
        index_exists(&conn, &unique_index_name(scope))
    }

    /// Whether the non-unique lookup index exists for `scope`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the catalog cannot be read.
    pub fn has_lookup_index(&self, scope: &FieldScope) -> Result<bool, StoreError> {
        scope.validate()?;
        let conn = self.conn.lock();
        index_exists(&conn, &lookup_index_name(scope))
    }
}

fn lookup_index_name(scope: &FieldScope) -> String {
    format!("idx_{}_{}", scope.table_name(), scope.index_column())
}

fn unique_index_name(scope: &FieldScope) -> String {
    format!("uq_{}_{}", scope.table_name(), scope.index_column())
}

fn index_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
        params![name],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .map_err(backend)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})")).map_err(backend)?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1)).map_err(backend)?;
    for name in names {
        if name.map_err(backend)? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Maps only unique-constraint failures to `UniqueViolation`.
fn map_write_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            StoreError::UniqueViolation { existing: None }
        }
        _ => backend(err),
    }
}

fn to_u64(n: i64) -> Result<u64, StoreError> {
    u64::try_from(n).map_err(|_| StoreError::Backend(format!("negative row count: {n}")))
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn into_stored((id, value, index): (i64, String, Option<String>)) -> Result<StoredRow, StoreError> {
    let blind_index = index
        .map(|hex| {
            BlindIndex::from_hex(&hex)
                .map_err(|e| StoreError::Backend(format!("row {id}: corrupt blind index: {e}")))
        })
        .transpose()?;
    Ok(StoredRow { id: RowId(id), value, blind_index })
}

/// Returns the row owning `index`, unless it is `id` itself.
fn index_owner(
    conn: &Connection,
    scope: &FieldScope,
    index: &BlindIndex,
    id: Option<RowId>,
) -> Result<Option<RowId>, StoreError> {
    let owner = conn
        .query_row(
            &format!(
                "SELECT id FROM {} WHERE {} = ?1 LIMIT 1",
                scope.table_name(),
                scope.index_column()
            ),
            params![index.to_hex()],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(backend)?
        .map(RowId);
    Ok(owner.filter(|owner| Some(*owner) != id))
}

impl SqliteStore {
    fn select_rows(
        &self,
        scope: &FieldScope,
        legacy_only: bool,
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        scope.validate()?;
        let filter = if legacy_only {
            format!(" AND {} IS NULL", scope.index_column())
        } else {
            String::new()
        };
        // Row ids may be zero or negative in tables created elsewhere.
        let (op, start) = after.map_or((">=", i64::MIN), |a| (">", a.0));
        let sql = format!(
            "SELECT id, {}, {} FROM {} WHERE id {op} ?1{filter} ORDER BY id LIMIT ?2",
            scope.column_name(),
            scope.index_column(),
            scope.table_name(),
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![start, to_limit(limit)], read_row)
            .map_err(backend)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(into_stored(row.map_err(backend)?)?);
        }
        Ok(out)
    }
}

impl FieldStore for SqliteStore {
    fn insert(&self, scope: &FieldScope, field: &SealedField) -> Result<RowId, StoreError> {
        scope.validate()?;
        let conn = self.conn.lock();
        if let Some(owner) = index_owner(&conn, scope, field.blind_index(), None)? {
            return Err(StoreError::UniqueViolation { existing: Some(owner) });
        }

        conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}) VALUES (?1, ?2)",
                scope.table_name(),
                scope.column_name(),
                scope.index_column()
            ),
            params![field.ciphertext(), field.blind_index().to_hex()],
        )
        .map_err(map_write_error)?;
        Ok(RowId(conn.last_insert_rowid()))
    }

    fn get(&self, scope: &FieldScope, id: RowId) -> Result<Option<StoredRow>, StoreError> {
        scope.validate()?;
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT id, {}, {} FROM {} WHERE id = ?1",
                scope.column_name(),
                scope.index_column(),
                scope.table_name()
            ),
            params![id.0],
            read_row,
        )
        .optional()
        .map_err(backend)?
        .map(into_stored)
        .transpose()
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
        scope.validate()?;
        let conn = self.conn.lock();
        let n = conn
            .execute(&format!("DELETE FROM {} WHERE id = ?1", scope.table_name()), params![id.0])
            .map_err(backend)?;
        Ok(n > 0)
    }

    fn find_by_index(
        &self,
        scope: &FieldScope,
        index: &BlindIndex,
    ) -> Result<Option<RowId>, StoreError> {
        scope.validate()?;
        let conn = self.conn.lock();
        index_owner(&conn, scope, index, None)
    }

    fn scan(
        &self,
        scope: &FieldScope,
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        self.select_rows(scope, false, after, limit)
    }

    fn legacy_rows(
        &self,
        scope: &FieldScope,
        after: Option<RowId>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        self.select_rows(scope, true, after, limit)
    }

    fn backfill(
        &self,
        scope: &FieldScope,
        id: RowId,
        index: &BlindIndex,
        ciphertext: Option<&str>,
    ) -> Result<(), StoreError> {
        scope.validate()?;
        let conn = self.conn.lock();
        if let Some(owner) = index_owner(&conn, scope, index, Some(id))? {
            return Err(StoreError::UniqueViolation { existing: Some(owner) });
        }

        let table = scope.table_name();
        let index_column = scope.index_column();
        let updated = match ciphertext {
            Some(value) => conn.execute(
                &format!(
                    "UPDATE {table} SET {} = ?1, {index_column} = ?2 WHERE id = ?3",
                    scope.column_name()
                ),
                params![value, index.to_hex(), id.0],
            ),
            None => conn.execute(
                &format!("UPDATE {table} SET {index_column} = ?1 WHERE id = ?2"),
                params![index.to_hex(), id.0],
            ),
        }
        .map_err(map_write_error)?;

        if updated == 0 {
            return Err(StoreError::RowNotFound(id));
        }
        Ok(())
    }

    fn count_rows(&self, scope: &FieldScope) -> Result<u64, StoreError> {
        scope.validate()?;
        let conn = self.conn.lock();
        let n = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", scope.table_name()), [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(backend)?;
        to_u64(n)
    }

    fn count_legacy(&self, scope: &FieldScope) -> Result<u64, StoreError> {
        scope.validate()?;
        let conn = self.conn.lock();
        let n = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
                    scope.table_name(),
                    scope.index_column()
                ),
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(backend)?;
        to_u64(n)
    }

    fn ensure_unique_index(&self, scope: &FieldScope) -> Result<(), StoreError> {
        scope.validate()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        tx.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}({})",
                unique_index_name(scope),
                scope.table_name(),
                scope.index_column()
            ),
            [],
        )
        .map_err(map_write_error)?;
        tx.execute(&format!("DROP INDEX IF EXISTS {}", lookup_index_name(scope)), [])
            .map_err(backend)?;
        tx.commit().map_err(backend)?;

        tracing::info!(%scope, "unique blind index constraint in place");
        Ok(())
    }
}
