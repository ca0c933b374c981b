//! Trigger registry and dispatch.
//!
//! Triggers are stored as rows in the `~before`/`~after` meta-tables and
//! refer to their implementation by a string key into a process-wide
//! registry. Dispatch runs the relational algebra against the meta-table to
//! find the rows that apply to a mutation, then looks the keys up at fire
//! time; persisted trigger rows are thereby decoupled from source
//! identifiers.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::db::filter;
use crate::db::relational_db::Database;
use crate::db::relational_operators::View;
use crate::db::system_tables::TriggerFields;
use crate::db::table::{Row, Table};
use crate::error::{ConstraintError, DBError};

/// The mutation kinds a trigger can be registered for. Stored in the
/// meta-table's 6-byte `operation` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context handed to every trigger invocation.
///
/// `row1`/`row2` follow the row-operation convention: insert passes the new
/// row as `row1`; update passes the pre-write row as `row1` and the new
/// cells as `row2`; delete passes the old row as `row1`.
pub struct TriggerParams<'a> {
    pub table: &'a Table,
    pub column: &'a str,
    pub row1: &'a Row,
    pub row2: Option<&'a Row>,
}

/// A registered trigger implementation. The trailing slice carries the
/// extra positional parameters persisted in the trigger row (the
/// `parameters` cell split on `;`).
pub type TriggerFn =
    Arc<dyn Fn(&Database, &TriggerParams<'_>, &[&str]) -> Result<(), DBError> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, TriggerFn>>> = Lazy::new(|| {
    let mut map: HashMap<String, TriggerFn> = HashMap::new();
    map.insert("pk".into(), Arc::new(pk));
    map.insert("fk".into(), Arc::new(fk));
    map.insert("update_restricted".into(), Arc::new(update_restricted));
    map.insert("delete_restricted".into(), Arc::new(delete_restricted));
    RwLock::new(map)
});

/// Install `f` under `key`, replacing any previous registration. Trigger
/// rows referencing `key` will call it from then on.
pub fn register_trigger(
    key: &str,
    f: impl Fn(&Database, &TriggerParams<'_>, &[&str]) -> Result<(), DBError> + Send + Sync + 'static,
) {
    REGISTRY.write().insert(key.to_owned(), Arc::new(f));
}

fn lookup(key: &str) -> Option<TriggerFn> {
    REGISTRY.read().get(key).cloned()
}

/// Fire every trigger applicable to mutating `table` with `op`.
///
/// `view` is a view over the relevant meta-table, already narrowed to
/// `table`. For each column of `row1` the view is copied and narrowed
/// further to that column and the operation, and each surviving trigger row
/// is resolved and invoked.
pub(crate) fn execute(
    db: &Database,
    table: &Table,
    view: &View<'_>,
    op: Operation,
    row1: &Row,
    row2: Option<&Row>,
) -> Result<(), DBError> {
    for column in row1.keys() {
        let mut applicable = view.clone();
        applicable.select(TriggerFields::Column.name(), |c| filter::equals(c, column))?;
        applicable.select(TriggerFields::Operation.name(), |c| filter::equals(c, op.as_str()))?;

        for i in 0..applicable.number_of_rows() {
            let trigger_row = applicable.read_row(i)?;
            let key = trigger_row[TriggerFields::Function.name()].trim().to_owned();
            let raw_params = trigger_row[TriggerFields::Parameters.name()].trim().to_owned();
            let params: Vec<&str> = if raw_params.is_empty() {
                Vec::new()
            } else {
                raw_params.split(';').collect()
            };

            let f = lookup(&key).ok_or(ConstraintError::UnknownTrigger(key.clone()))?;
            log::trace!("firing trigger `{key}` for {op} on `{}`.`{column}`", table.name());
            f(
                db,
                &TriggerParams {
                    table,
                    column: column.as_str(),
                    row1,
                    row2,
                },
                &params,
            )?;
        }
    }
    Ok(())
}

fn check_params(function: &str, params: &[&str], expected: usize) -> Result<(), ConstraintError> {
    if params.len() < expected {
        return Err(ConstraintError::MissingParameters {
            function: function.to_owned(),
            expected,
            got: params.len(),
        });
    }
    Ok(())
}

/// Primary-key trigger: the candidate value must not already be present in
/// the column. Scans every physical row, tombstoned ones included.
fn pk(_db: &Database, p: &TriggerParams<'_>, _params: &[&str]) -> Result<(), DBError> {
    // On update the candidate is the incoming value; an update that does
    // not touch the keyed column has nothing to check.
    let candidate = match p.row2 {
        Some(row2) => row2.get(p.column),
        None => p.row1.get(p.column),
    };
    let Some(candidate) = candidate else {
        return Ok(());
    };

    for n in 0..p.table.number_of_rows()? {
        if p.table.read_cell_trimmed(n, p.column)? == candidate.trim() {
            return Err(ConstraintError::PkViolation {
                table: p.table.name().to_owned(),
                column: p.column.to_owned(),
                value: candidate.trim().to_owned(),
            }
            .into());
        }
    }
    Ok(())
}

/// Foreign-key trigger: the value must appear in a live row of the parent
/// column.
//
// Known quirk: the candidate is always read from `row1`, so on update the
// OLD value is checked rather than the incoming one.
fn fk(db: &Database, p: &TriggerParams<'_>, params: &[&str]) -> Result<(), DBError> {
    check_params("fk", params, 2)?;
    let (parent_table, parent_column) = (params[0], params[1]);
    let value = p.row1.get(p.column).map(String::as_str).unwrap_or("");

    let parent = db.table(parent_table)?;
    for n in 0..parent.number_of_rows()? {
        if parent.is_deleted(n)? {
            continue;
        }
        if parent.read_cell_trimmed(n, parent_column)? == value.trim() {
            return Ok(());
        }
    }
    Err(ConstraintError::FkViolation {
        table: p.table.name().to_owned(),
        column: p.column.to_owned(),
        value: value.trim().to_owned(),
        parent_table: parent_table.to_owned(),
        parent_column: parent_column.to_owned(),
    }
    .into())
}

/// `true` if the trimmed `value` appears in a live row of
/// `child_table.child_column`.
fn referenced_by(db: &Database, child_table: &str, child_column: &str, value: &str) -> Result<bool, DBError> {
    let child = db.table(child_table)?;
    for n in 0..child.number_of_rows()? {
        if child.is_deleted(n)? {
            continue;
        }
        if child.read_cell_trimmed(n, child_column)? == value {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Restrict updating a parent value that a child row still references.
fn update_restricted(db: &Database, p: &TriggerParams<'_>, params: &[&str]) -> Result<(), DBError> {
    check_params("update_restricted", params, 2)?;
    let (child_table, child_column) = (params[0], params[1]);
    let old = p.row1.get(p.column).map(String::as_str).unwrap_or("").trim();

    if referenced_by(db, child_table, child_column, old)? {
        return Err(ConstraintError::UpdateRestricted {
            table: p.table.name().to_owned(),
            column: p.column.to_owned(),
            value: old.to_owned(),
            child_table: child_table.to_owned(),
            child_column: child_column.to_owned(),
        }
        .into());
    }
    Ok(())
}

/// Restrict deleting a parent row whose value a child row still references.
fn delete_restricted(db: &Database, p: &TriggerParams<'_>, params: &[&str]) -> Result<(), DBError> {
    check_params("delete_restricted", params, 2)?;
    let (child_table, child_column) = (params[0], params[1]);
    let old = p.row1.get(p.column).map(String::as_str).unwrap_or("").trim();

    if referenced_by(db, child_table, child_column, old)? {
        return Err(ConstraintError::DeleteRestricted {
            table: p.table.name().to_owned(),
            column: p.column.to_owned(),
            value: old.to_owned(),
            child_table: child_table.to_owned(),
            child_column: child_column.to_owned(),
        }
        .into());
    }
    Ok(())
}
