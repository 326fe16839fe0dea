//! Scope of a protected column: which table, which field.

use crate::error::StoreError;
use std::fmt;

/// Suffix of the column holding a field's blind index.
pub const BLIND_INDEX_SUFFIX: &str = "_blind_index";

/// A protected field within one owning table.
///
/// Blind-index uniqueness is enforced per scope: the same email may appear
/// once in `applications.email` and once in `users.email`.
///
/// # Example
///
/// ```
/// use fieldseal::context::FieldScope;
///
/// let scope = FieldScope::new("applications", "email");
/// assert_eq!(scope.index_column(), "email_blind_index");
/// assert_eq!(scope.to_string(), "applications.email");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldScope {
    table_name: String,
    column_name: String,
}

impl FieldScope {
    /// Creates a new field scope.
    ///
    /// # Arguments
    ///
    /// * `table_name` - Owning table
    /// * `column_name` - Column storing the ciphertext (or legacy plaintext)
    #[must_use]
    pub fn new(table_name: impl Into<String>, column_name: impl Into<String>) -> Self {
        Self { table_name: table_name.into(), column_name: column_name.into() }
    }

    /// Returns the table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Returns the value column name.
    #[must_use]
    pub fn column_name(&self) -> &str {
        &self.column_name
    }

    /// Returns the blind-index column name, `<column>_blind_index`.
    #[must_use]
    pub fn index_column(&self) -> String {
        format!("{}{BLIND_INDEX_SUFFIX}", self.column_name)
    }

    /// Checks that table and column are plain SQL identifiers.
    ///
    /// Backends interpolate these names into statements, so anything beyond
    /// `[A-Za-z_][A-Za-z0-9_]*` is rejected.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidScope` naming the offending identifier.
    pub fn validate(&self) -> Result<(), StoreError> {
        for ident in [&self.table_name, &self.column_name] {
            if !is_identifier(ident) {
                return Err(StoreError::InvalidScope(ident.clone()));
            }
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for FieldScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table_name, self.column_name)
    }
}
