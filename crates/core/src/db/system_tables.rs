//! Reserved trigger meta-tables.
//!
//! Two tables, `~before` and `~after`, exist in every database directory
//! and hold the registered triggers as ordinary rows. They are created by
//! `init_dir` and mutated through the same row-operation path as user
//! tables; since no triggers are ever registered *for* them, mutating them
//! does not recurse.

/// Meta-table scanned before a physical mutation.
pub const ST_BEFORE: &str = "~before";
/// Meta-table scanned after a physical mutation.
pub const ST_AFTER: &str = "~after";

/// Width of the `operation` column; fits `insert`, `update` and `delete`.
pub const OPERATION_LEN: usize = 6;
/// Width of every name-carrying meta column.
pub const NAME_LEN: usize = 50;

// WARNING: the on-disk `.def` files of existing databases encode these
// names and widths; don't change them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerFields {
    Table,
    Column,
    Operation,
    Function,
    Parameters,
}

impl TriggerFields {
    pub fn name(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Column => "column",
            Self::Operation => "operation",
            Self::Function => "function",
            Self::Parameters => "parameters",
        }
    }

    pub fn width(self) -> usize {
        match self {
            Self::Operation => OPERATION_LEN,
            _ => NAME_LEN,
        }
    }
}

/// The five user columns of a trigger meta-table, in schema order.
/// `~del` is inherited like on any other table and is not listed here.
pub fn trigger_table_columns() -> [TriggerFields; 5] {
    [
        TriggerFields::Table,
        TriggerFields::Column,
        TriggerFields::Operation,
        TriggerFields::Function,
        TriggerFields::Parameters,
    ]
}

/// `true` for the two reserved meta-table names.
pub fn is_reserved_table_name(name: &str) -> bool {
    name == ST_BEFORE || name == ST_AFTER
}
