//! Constraint registration.
//!
//! Constraints are nothing but rows in the `~before` meta-table: a primary
//! key is the `pk` trigger registered for insert and update, a foreign key
//! is the `fk` trigger on the child plus the two `*_restricted` triggers on
//! the parent. Registration and removal go through the same triggered
//! row-operation path as every other mutation; since the meta-tables carry
//! no triggers of their own, this does not recurse.

use crate::db::filter;
use crate::db::relational_db::Database;
use crate::db::relational_operators::View;
use crate::db::system_tables::{TriggerFields, ST_BEFORE};
use crate::db::table::Row;
use crate::db::trigger::Operation;
use crate::error::DBError;

fn trigger_row(table: &str, column: &str, op: Operation, function: &str, parameters: &str) -> Row {
    Row::from([
        (TriggerFields::Table.name().to_owned(), table.to_owned()),
        (TriggerFields::Column.name().to_owned(), column.to_owned()),
        (TriggerFields::Operation.name().to_owned(), op.as_str().to_owned()),
        (TriggerFields::Function.name().to_owned(), function.to_owned()),
        (TriggerFields::Parameters.name().to_owned(), parameters.to_owned()),
    ])
}

/// Register a primary key on `table.column`.
pub fn pk(db: &Database, table: &str, column: &str) -> Result<(), DBError> {
    for op in [Operation::Insert, Operation::Update] {
        db.insert_row(ST_BEFORE, &trigger_row(table, column, op, "pk", ""))?;
    }
    Ok(())
}

/// Drop the primary key on `table.column`.
pub fn remove_pk(db: &Database, table: &str, column: &str) -> Result<(), DBError> {
    remove_trigger_rows(db, table, column, None, Some("pk"), None)
}

/// Register a foreign key: `child_table.child_column` references
/// `parent_table.parent_column`. The parent side gains the restriction
/// triggers that keep referenced values alive.
pub fn fk(
    db: &Database,
    child_table: &str,
    child_column: &str,
    parent_table: &str,
    parent_column: &str,
) -> Result<(), DBError> {
    let parent_ref = format!("{parent_table};{parent_column}");
    let child_ref = format!("{child_table};{child_column}");
    for op in [Operation::Insert, Operation::Update] {
        db.insert_row(ST_BEFORE, &trigger_row(child_table, child_column, op, "fk", &parent_ref))?;
    }
    db.insert_row(
        ST_BEFORE,
        &trigger_row(parent_table, parent_column, Operation::Update, "update_restricted", &child_ref),
    )?;
    db.insert_row(
        ST_BEFORE,
        &trigger_row(parent_table, parent_column, Operation::Delete, "delete_restricted", &child_ref),
    )?;
    Ok(())
}

/// Drop the foreign key registered by [`fk`] with the same arguments.
pub fn remove_fk(
    db: &Database,
    child_table: &str,
    child_column: &str,
    parent_table: &str,
    parent_column: &str,
) -> Result<(), DBError> {
    let parent_ref = format!("{parent_table};{parent_column}");
    let child_ref = format!("{child_table};{child_column}");
    for op in [Operation::Insert, Operation::Update] {
        remove_trigger_rows(db, child_table, child_column, Some(op), Some("fk"), Some(&parent_ref))?;
    }
    remove_trigger_rows(
        db,
        parent_table,
        parent_column,
        Some(Operation::Update),
        Some("update_restricted"),
        Some(&child_ref),
    )?;
    remove_trigger_rows(
        db,
        parent_table,
        parent_column,
        Some(Operation::Delete),
        Some("delete_restricted"),
        Some(&child_ref),
    )?;
    Ok(())
}

/// Delete every live `~before` row matching the given attributes; `None`
/// matches any value.
fn remove_trigger_rows(
    db: &Database,
    table: &str,
    column: &str,
    op: Option<Operation>,
    function: Option<&str>,
    parameters: Option<&str>,
) -> Result<(), DBError> {
    let mut view = View::new();
    view.prepare_table(db.table(ST_BEFORE)?)?;
    view.select(TriggerFields::Table.name(), |c| filter::equals(c, table))?;
    view.select(TriggerFields::Column.name(), |c| filter::equals(c, column))?;
    if let Some(op) = op {
        view.select(TriggerFields::Operation.name(), |c| filter::equals(c, op.as_str()))?;
    }
    if let Some(function) = function {
        view.select(TriggerFields::Function.name(), |c| filter::equals(c, function))?;
    }
    if let Some(parameters) = parameters {
        view.select(TriggerFields::Parameters.name(), |c| filter::equals(c, parameters))?;
    }

    let rows: Vec<u64> = view.row_numbers(ST_BEFORE)?.to_vec();
    for n in rows {
        db.delete_row(ST_BEFORE, n)?;
    }
    Ok(())
}
