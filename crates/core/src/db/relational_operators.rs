//! Lazy relational algebra over row indexes.
//!
//! A [`View`] never materialises intermediate rows: it keeps, per prepared
//! table, an ordered sequence of row numbers, plus a mapping from column
//! aliases back to `(table, column)`. The per-table sequences are
//! positionally aligned: position `i` of every sequence together forms the
//! `i`-th result tuple. Every reshaping operation (select, join, cross)
//! therefore rewrites *all* sequences through one projection helper, which
//! is what keeps joins over three and more tables correct.

use itertools::iproduct;

use crate::db::table::{Row, Table};
use crate::error::{DBError, ViewError};

#[derive(Clone)]
struct ViewTable<'a> {
    table: &'a Table,
    /// Row numbers kept by the pipeline so far, in result order.
    rows: Vec<u64>,
}

#[derive(Clone)]
struct ViewColumn {
    table: String,
    column: String,
}

/// A relational-algebra view over one or more tables.
///
/// Views are per-query and short-lived; they borrow the tables they were
/// prepared with. Cloning a view is cheap (row indexes and alias names
/// only) and is how trigger dispatch evaluates many filters against one
/// base view.
#[derive(Clone, Default)]
pub struct View<'a> {
    tables: Vec<ViewTable<'a>>,
    columns: Vec<(String, ViewColumn)>,
}

impl<'a> View<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    fn table_index(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|vt| vt.table.name() == name)
    }

    fn alias_index(&self, alias: &str) -> Option<usize> {
        self.columns.iter().position(|(a, _)| a == alias)
    }

    fn lookup_alias(&self, alias: &str) -> Result<&ViewColumn, ViewError> {
        self.alias_index(alias)
            .map(|i| &self.columns[i].1)
            .ok_or_else(|| ViewError::AliasNotFound(alias.to_owned()))
    }

    /// Register `table` with an explicit row sequence and import its
    /// columns as aliases. An alias imported by a later table shadows an
    /// earlier one of the same name.
    fn register(&mut self, table: &'a Table, rows: Vec<u64>) {
        for column in table.order() {
            let entry = ViewColumn {
                table: table.name().to_owned(),
                column: column.clone(),
            };
            match self.alias_index(column) {
                Some(i) => self.columns[i].1 = entry,
                None => self.columns.push((column.clone(), entry)),
            }
        }
        self.tables.push(ViewTable { table, rows });
    }

    fn check_new_table(&self, table: &Table) -> Result<(), ViewError> {
        if self.table_index(table.name()).is_some() {
            return Err(ViewError::DuplicateTable(table.name().to_owned()));
        }
        Ok(())
    }

    /// Project every table's row sequence through `kept`, a list of
    /// positions into the current result. This is the single place the
    /// alignment invariant is maintained.
    fn project_rows(&mut self, kept: &[usize]) {
        for vt in &mut self.tables {
            vt.rows = kept.iter().map(|&i| vt.rows[i]).collect();
        }
        debug_assert!(self.tables.iter().all(|vt| vt.rows.len() == kept.len()));
    }

    /// Bring `table` into the view with all of its rows and columns.
    pub fn prepare_table(&mut self, table: &'a Table) -> Result<(), DBError> {
        self.check_new_table(table)?;
        let rows = (0..table.number_of_rows()?).collect();
        self.register(table, rows);
        Ok(())
    }

    /// Keep only the result tuples whose trimmed cell under `alias`
    /// satisfies `predicate`. Tombstoned rows are dropped as a side effect.
    /// Every table in the view is narrowed, not just the aliased one.
    pub fn select(&mut self, alias: &str, predicate: impl Fn(&str) -> bool) -> Result<(), DBError> {
        let col = self.lookup_alias(alias)?.clone();
        let ti = self
            .table_index(&col.table)
            .ok_or_else(|| ViewError::TableNotPrepared(col.table.clone()))?;

        let vt = &self.tables[ti];
        let mut kept = Vec::with_capacity(vt.rows.len());
        for (i, &rn) in vt.rows.iter().enumerate() {
            if vt.table.is_deleted(rn)? {
                continue;
            }
            let cell = vt.table.read_cell(rn, &col.column)?;
            if predicate(cell.trim()) {
                kept.push(i);
            }
        }
        self.project_rows(&kept);
        Ok(())
    }

    /// Drop every alias not named in `keep`. A table whose last alias goes
    /// away is dropped from the view entirely.
    pub fn project(&mut self, keep: &[&str]) -> Result<(), DBError> {
        for alias in keep {
            self.lookup_alias(alias)?;
        }
        self.columns.retain(|(alias, _)| keep.contains(&alias.as_str()));
        self.tables
            .retain(|vt| self.columns.iter().any(|(_, c)| c.table == vt.table.name()));
        Ok(())
    }

    /// Rename alias `old` to `new`.
    pub fn redefine(&mut self, old: &str, new: &str) -> Result<(), DBError> {
        if self.alias_index(new).is_some() {
            return Err(ViewError::AliasExists(new.to_owned()).into());
        }
        let i = self
            .alias_index(old)
            .ok_or_else(|| ViewError::AliasNotFound(old.to_owned()))?;
        self.columns[i].0 = new.to_owned();
        Ok(())
    }

    /// Cartesian product with `table`. Existing sequences are replicated
    /// once per row of `table`; the new sequence repeats each row number
    /// once per existing tuple, keeping all sequences aligned.
    pub fn cross(&mut self, table: &'a Table) -> Result<(), DBError> {
        self.check_new_table(table)?;
        let m = table.number_of_rows()?;
        let k = self.number_of_rows();

        let pairs: Vec<(u64, usize)> = iproduct!(0..m, 0..k).collect();
        let positions: Vec<usize> = pairs.iter().map(|&(_, j)| j).collect();
        let new_rows: Vec<u64> = pairs.iter().map(|&(i, _)| i).collect();

        self.project_rows(&positions);
        self.register(table, new_rows);
        Ok(())
    }

    /// Nested-loop equi-join of `table.column` against the aliased column.
    /// A pair is kept iff neither row is tombstoned and the trimmed cells
    /// are equal; existing tables are re-indexed through the kept
    /// positions.
    pub fn nl_join(&mut self, alias: &str, table: &'a Table, column: &str) -> Result<(), DBError> {
        self.check_new_table(table)?;
        table.column(column)?;
        let col = self.lookup_alias(alias)?.clone();
        let ti = self
            .table_index(&col.table)
            .ok_or_else(|| ViewError::TableNotPrepared(col.table.clone()))?;

        let right_rows = table.number_of_rows()?;
        let mut positions = Vec::new();
        let mut new_rows = Vec::new();

        let vt = &self.tables[ti];
        for (i, &rn1) in vt.rows.iter().enumerate() {
            if vt.table.is_deleted(rn1)? {
                continue;
            }
            let left = vt.table.read_cell(rn1, &col.column)?;
            for rn2 in 0..right_rows {
                if table.is_deleted(rn2)? {
                    continue;
                }
                let right = table.read_cell(rn2, column)?;
                if left.trim() == right.trim() {
                    positions.push(i);
                    new_rows.push(rn2);
                }
            }
        }

        self.project_rows(&positions);
        self.register(table, new_rows);
        Ok(())
    }

    /// Assemble result tuple `i` as a row keyed by alias.
    pub fn read_row(&self, i: usize) -> Result<Row, DBError> {
        let rows = self.number_of_rows();
        if i >= rows {
            return Err(ViewError::RowOutOfBounds { row: i, rows }.into());
        }
        let mut out = Row::with_capacity(self.columns.len());
        for (alias, col) in &self.columns {
            let ti = self
                .table_index(&col.table)
                .ok_or_else(|| ViewError::TableNotPrepared(col.table.clone()))?;
            let vt = &self.tables[ti];
            out.insert(alias.clone(), vt.table.read_cell(vt.rows[i], &col.column)?);
        }
        Ok(out)
    }

    /// Number of result tuples. All per-table sequences have this length.
    pub fn number_of_rows(&self) -> usize {
        self.tables.first().map(|vt| vt.rows.len()).unwrap_or(0)
    }

    /// The kept row numbers of `table`, in result order.
    pub fn row_numbers(&self, table: &str) -> Result<&[u64], DBError> {
        let ti = self
            .table_index(table)
            .ok_or_else(|| ViewError::TableNotPrepared(table.to_owned()))?;
        Ok(&self.tables[ti].rows)
    }
}
