//! Error types for the Beacon table engine.

use thiserror::Error;

/// Convert any `Display` error into a `TableError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::TableError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// Result type alias for table engine operations.
pub type TableResult<T> = Result<T, TableError>;

/// Errors that can occur during table engine operations.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid schema for table {table}: {reason}")]
    Schema { table: String, reason: String },

    #[error("unknown index {index} on table {table}")]
    UnknownIndex { table: String, index: String },

    #[error("missing value for field {field} of index {index} on table {table}")]
    MissingField {
        table: String,
        index: String,
        field: String,
    },

    #[error("index {index} on table {table} takes at most {max} fields, got {given}")]
    TooManyFields {
        table: String,
        index: String,
        max: usize,
        given: usize,
    },

    #[error("value for field {field} of index {index} on table {table} contains a NUL byte")]
    ReservedByte {
        table: String,
        index: String,
        field: String,
    },

    #[error("duplicate key for unique index {index} on table {table}")]
    UniqueViolation { table: String, index: String },
}

impl TableError {
    /// Whether the error comes from the row itself rather than from storage.
    ///
    /// Constraint errors are a pure function of the rows and the schema, so
    /// every replica applying the same entry sees the same one.
    pub fn is_constraint(&self) -> bool {
        matches!(
            self,
            TableError::UnknownIndex { .. }
                | TableError::MissingField { .. }
                | TableError::TooManyFields { .. }
                | TableError::ReservedByte { .. }
                | TableError::UniqueViolation { .. }
        )
    }
}
