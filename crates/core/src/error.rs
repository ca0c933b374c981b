use std::path::PathBuf;
use thiserror::Error;

use crate::db::transaction::TxId;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Table with name `{0}` already exists.")]
    Exist(String),
    #[error("Table with name `{0}` not found.")]
    NotFound(String),
    #[error("Table name `{0}` is longer than {1} bytes.")]
    NameTooLong(String, usize),
    #[error("Column with name `{0}` already exists.")]
    ColumnExists(String),
    #[error("Column `{0}` not found.")]
    ColumnNotFound(String),
    #[error("Column name `{0}` is longer than {1} bytes.")]
    ColumnNameTooLong(String, usize),
    #[error("Column `{0}` is reserved and cannot be dropped.")]
    ReservedColumn(String),
    #[error("Row {row} is out of bounds for a table with {rows} rows.")]
    RowOutOfBounds { row: u64, rows: u64 },
    #[error("Row {0} is tombstoned.")]
    RowTombstoned(u64),
    #[error("Malformed definition line `{line}` in {}.", path.display())]
    BadDefLine { line: String, path: PathBuf },
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database path `{}` is not a directory.", .0.display())]
    NotADirectory(PathBuf),
}

#[derive(Error, Debug)]
pub enum ViewError {
    #[error("Table `{0}` is already prepared in this view.")]
    DuplicateTable(String),
    #[error("Table `{0}` is not prepared in this view.")]
    TableNotPrepared(String),
    #[error("Column alias `{0}` already exists.")]
    AliasExists(String),
    #[error("Column alias `{0}` not found.")]
    AliasNotFound(String),
    #[error("Row {row} is out of bounds for a view with {rows} rows.")]
    RowOutOfBounds { row: usize, rows: usize },
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Cannot take an exclusive lock on `{table}`: held by transaction {holder}.")]
    ExclusiveConflict { table: String, holder: TxId },
    #[error("Cannot take a shared lock on `{table}`: exclusive lock held by transaction {holder}.")]
    SharedConflict { table: String, holder: TxId },
}

#[derive(Error, Debug)]
pub enum ConstraintError {
    #[error("Primary key violation on `{table}.{column}`: value `{value}` already present.")]
    PkViolation {
        table: String,
        column: String,
        value: String,
    },
    #[error(
        "Foreign key violation on `{table}.{column}`: value `{value}` has no match in `{parent_table}.{parent_column}`."
    )]
    FkViolation {
        table: String,
        column: String,
        value: String,
        parent_table: String,
        parent_column: String,
    },
    #[error(
        "Update restricted on `{table}.{column}`: value `{value}` is still referenced by `{child_table}.{child_column}`."
    )]
    UpdateRestricted {
        table: String,
        column: String,
        value: String,
        child_table: String,
        child_column: String,
    },
    #[error(
        "Delete restricted on `{table}.{column}`: value `{value}` is still referenced by `{child_table}.{child_column}`."
    )]
    DeleteRestricted {
        table: String,
        column: String,
        value: String,
        child_table: String,
        child_column: String,
    },
    #[error("Trigger function `{0}` is not registered.")]
    UnknownTrigger(String),
    #[error("Trigger function `{function}` expects {expected} parameters, got {got}.")]
    MissingParameters {
        function: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Error, Debug)]
pub enum DBError {
    #[error("TableError: {0}")]
    Table(#[from] TableError),
    #[error("DatabaseError: {0}")]
    Database(#[from] DatabaseError),
    #[error("ViewError: {0}")]
    View(#[from] ViewError),
    #[error("LockError: {0}")]
    Lock(#[from] LockError),
    #[error("ConstraintError: {0}")]
    Constraint(#[from] ConstraintError),
    #[error("IoError: {0}.")]
    Io(#[from] std::io::Error),
    #[error("EncodeError: {0}.")]
    Encode(#[from] serde_json::Error),
    #[error("{op} on `{table}` failed and the transaction was rolled back: {source}")]
    TransactionAborted {
        op: &'static str,
        table: String,
        #[source]
        source: Box<DBError>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DBError {
    /// The constraint violation at the root of this error, if any.
    ///
    /// Transactional mutations wrap trigger failures in
    /// [`DBError::TransactionAborted`]; this peels the wrapper.
    pub fn constraint_violation(&self) -> Option<&ConstraintError> {
        match self {
            Self::Constraint(e) => Some(e),
            Self::TransactionAborted { source, .. } => source.constraint_violation(),
            _ => None,
        }
    }
}
