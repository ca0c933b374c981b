//! flatbase: a small file-backed relational engine.
//!
//! Tables are human-readable fixed-width records on disk; queries are
//! relational-algebra pipelines over row indexes; primary and foreign keys
//! are triggers stored in two reserved meta-tables; mutations run inside
//! transactions with advisory filesystem locks and an in-memory undo log.

pub mod db;
pub mod error;

pub use db::constraints;
pub use db::filter;
pub use db::relational_db::{Database, OpenOptions};
pub use db::relational_operators::View;
pub use db::table::{Column, Row, Table, DELETED_COLUMN, MAX_NAME_LEN};
pub use db::transaction::{locks_of, LockState, Transaction, TxId, DEFAULT_LOCK_TIMEOUT};
pub use db::trigger::{register_trigger, Operation, TriggerParams};
pub use error::DBError;

/// Build a [`Row`] from `key => value` pairs. Values go through
/// [`ToString`], so numbers can be written as-is.
#[macro_export]
macro_rules! row {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut row = $crate::Row::new();
        $(row.insert($key.to_string(), $value.to_string());)*
        row
    }};
}
