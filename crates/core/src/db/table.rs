//! Fixed-width table storage.
//!
//! A table is three files in the database directory: `<name>.def` holds one
//! `name:length` line per column in schema order, `<name>.data` holds the
//! records, and `<name>.log` is an append-only audit trail of mutations.
//! A record is every column padded or truncated to its declared byte width,
//! terminated by a single newline, so the data file is always exactly
//! `number_of_rows * row_length` bytes.
//!
//! Deletion is logical: the reserved `~del` column (width 1) holds `'y'`
//! for a tombstoned row and a space for a live one. The physical record
//! stays in place until a schema change rebuilds the file.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use parking_lot::Mutex;

#[cfg(target_family = "unix")]
use std::os::unix::fs::FileExt;
#[cfg(target_family = "windows")]
use std::os::windows::fs::FileExt;

use crate::error::{DBError, TableError};

/// Maximum byte length of a table or column name.
pub const MAX_NAME_LEN: usize = 50;

/// The reserved tombstone column present in every table.
pub const DELETED_COLUMN: &str = "~del";
/// Cell value of `~del` for a tombstoned row.
pub const TOMBSTONE: &str = "y";

/// A row keyed by column name. Values are plain strings; the storage layer
/// pads or truncates them to the declared column width on write.
pub type Row = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Byte width of the cell in the record.
    pub len: usize,
    /// Byte offset from the start of the record.
    pub offset: usize,
}

/// The filesystem entries belonging to one table.
#[derive(Debug, Clone)]
pub(crate) struct TablePaths {
    pub def: PathBuf,
    pub data: PathBuf,
    pub log: PathBuf,
    /// Directory of shared-lock marker files, one per holding transaction.
    pub shared: PathBuf,
    /// Single-line file naming the exclusive-lock holder.
    pub exclusive: PathBuf,
}

impl TablePaths {
    pub(crate) fn new(dir: &Path, name: &str) -> Self {
        Self {
            def: dir.join(format!("{name}.def")),
            data: dir.join(format!("{name}.data")),
            log: dir.join(format!("{name}.log")),
            shared: dir.join(format!("{name}.shared")),
            exclusive: dir.join(format!("{name}.exclusive")),
        }
    }
}

pub struct Table {
    name: String,
    paths: TablePaths,
    columns: HashMap<String, Column>,
    /// Column names in schema order.
    order: Vec<String>,
    /// Record length in bytes, including the newline terminator.
    row_length: usize,
    data: File,
    log: Mutex<File>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("row_length", &self.row_length)
            .finish()
    }
}

impl Table {
    /// Create the three table files plus the `.shared` lock directory, then
    /// open the table. The new table has no columns; the caller adds the
    /// default DB columns.
    pub(crate) fn create(dir: &Path, name: &str) -> Result<Self, DBError> {
        let paths = TablePaths::new(dir, name);
        for path in [&paths.def, &paths.data, &paths.log] {
            File::create(path).with_context(|| format!("could not create {}", path.display()))?;
        }
        fs::create_dir(&paths.shared)
            .with_context(|| format!("could not create lock directory {}", paths.shared.display()))?;
        Self::open(dir, name)
    }

    /// Open an existing table by reading its `.def` file.
    pub(crate) fn open(dir: &Path, name: &str) -> Result<Self, DBError> {
        let paths = TablePaths::new(dir, name);
        let def = fs::read_to_string(&paths.def)
            .with_context(|| format!("could not read table definition {}", paths.def.display()))?;

        let mut columns = HashMap::new();
        let mut order = Vec::new();
        let mut offset = 0;
        for line in def.lines() {
            if line.is_empty() {
                continue;
            }
            let bad_line = || TableError::BadDefLine {
                line: line.to_owned(),
                path: paths.def.clone(),
            };
            let (col_name, len) = line.split_once(':').ok_or_else(bad_line)?;
            let len: usize = len.trim().parse().map_err(|_| bad_line())?;
            columns.insert(
                col_name.to_owned(),
                Column {
                    name: col_name.to_owned(),
                    len,
                    offset,
                },
            );
            order.push(col_name.to_owned());
            offset += len;
        }

        let data = File::options()
            .read(true)
            .write(true)
            .open(&paths.data)
            .with_context(|| format!("could not open data file {}", paths.data.display()))?;
        let log = File::options()
            .append(true)
            .open(&paths.log)
            .with_context(|| format!("could not open log file {}", paths.log.display()))?;

        Ok(Self {
            name: name.to_owned(),
            paths,
            columns,
            order,
            row_length: offset + 1,
            data,
            log: Mutex::new(log),
        })
    }

    /// Re-derive paths for `name` under `dir` and reopen the file handles.
    /// Used after the table's files have been renamed on disk.
    pub(crate) fn reopen(&mut self, dir: &Path, name: &str) -> Result<(), DBError> {
        let reopened = Self::open(dir, name)?;
        *self = reopened;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column names in schema order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn column(&self, name: &str) -> Result<&Column, TableError> {
        self.columns
            .get(name)
            .ok_or_else(|| TableError::ColumnNotFound(name.to_owned()))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Record length in bytes, including the newline terminator.
    pub fn row_length(&self) -> usize {
        self.row_length
    }

    pub(crate) fn paths(&self) -> &TablePaths {
        &self.paths
    }

    /// Number of physical records, tombstoned rows included. Callers filter
    /// on `~del` when they want the live count.
    pub fn number_of_rows(&self) -> Result<u64, DBError> {
        let size = self
            .data
            .metadata()
            .with_context(|| format!("could not stat {}", self.paths.data.display()))?
            .len();
        Ok(size / self.row_length as u64)
    }

    fn check_row(&self, n: u64) -> Result<(), DBError> {
        let rows = self.number_of_rows()?;
        if n >= rows {
            return Err(TableError::RowOutOfBounds { row: n, rows }.into());
        }
        Ok(())
    }

    fn row_offset(&self, n: u64) -> u64 {
        n * self.row_length as u64
    }

    fn cell_offset(&self, n: u64, column: &Column) -> u64 {
        self.row_offset(n) + column.offset as u64
    }

    #[cfg(target_family = "unix")]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.data.read_exact_at(buf, offset)
    }

    #[cfg(target_family = "windows")]
    fn read_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.data.seek_read(buf, offset)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            offset += n as u64;
            buf = &mut buf[n..];
        }
        Ok(())
    }

    #[cfg(target_family = "unix")]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.data.write_all_at(buf, offset)
    }

    #[cfg(target_family = "windows")]
    fn write_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.data.seek_write(buf, offset)?;
            offset += n as u64;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Read row `n` as a mapping `column -> raw cell`: fixed width, padding
    /// included.
    pub fn read_row(&self, n: u64) -> Result<Row, DBError> {
        self.check_row(n)?;
        let mut buf = vec![0; self.row_length];
        self.read_at(&mut buf, self.row_offset(n))
            .with_context(|| format!("could not read row {n} of {}", self.paths.data.display()))?;

        let mut row = Row::with_capacity(self.order.len());
        for name in &self.order {
            let col = &self.columns[name];
            let cell = String::from_utf8_lossy(&buf[col.offset..col.offset + col.len]).into_owned();
            row.insert(name.clone(), cell);
        }
        Ok(row)
    }

    /// [`Self::read_row`] with every cell trimmed.
    pub fn read_row_trimmed(&self, n: u64) -> Result<Row, DBError> {
        let mut row = self.read_row(n)?;
        for cell in row.values_mut() {
            *cell = cell.trim().to_owned();
        }
        Ok(row)
    }

    /// Read the raw fixed-width cell at `(n, column)`.
    pub fn read_cell(&self, n: u64, column: &str) -> Result<String, DBError> {
        let col = self.column(column)?;
        self.check_row(n)?;
        let mut buf = vec![0; col.len];
        let offset = self.cell_offset(n, col);
        self.read_at(&mut buf, offset).with_context(|| {
            format!("could not read cell `{column}` of row {n} in {}", self.paths.data.display())
        })?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn read_cell_trimmed(&self, n: u64, column: &str) -> Result<String, DBError> {
        Ok(self.read_cell(n, column)?.trim().to_owned())
    }

    /// `true` if row `n` carries a tombstone (non-blank `~del`).
    pub fn is_deleted(&self, n: u64) -> Result<bool, DBError> {
        Ok(!self.read_cell(n, DELETED_COLUMN)?.trim().is_empty())
    }

    /// Pad or truncate `value` to exactly `len` bytes.
    fn pad_cell(value: &str, len: usize) -> Vec<u8> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.resize(len, b' ');
        bytes
    }

    /// Pad or truncate `value` to the column's declared width and overwrite
    /// the cell at `(n, column)`. The raw write primitive; no trigger or
    /// tombstone handling, no audit line.
    pub fn write_cell(&self, n: u64, column: &str, value: &str) -> Result<(), DBError> {
        let col = self.column(column)?;
        self.check_row(n)?;
        self.write_at(&Self::pad_cell(value, col.len), self.cell_offset(n, col))
            .with_context(|| {
                format!("could not write cell `{column}` of row {n} in {}", self.paths.data.display())
            })?;
        Ok(())
    }

    /// Append `row`. Columns absent from the row are stored empty; values
    /// wider than the column are truncated. Returns the new row number.
    pub fn insert(&self, row: &Row) -> Result<u64, DBError> {
        let n = self.number_of_rows()?;
        let mut record = Vec::with_capacity(self.row_length);
        for name in &self.order {
            let value = row.get(name).map(String::as_str).unwrap_or("");
            record.extend_from_slice(&Self::pad_cell(value, self.columns[name].len));
        }
        record.push(b'\n');
        self.write_at(&record, self.row_offset(n))
            .with_context(|| format!("could not append to {}", self.paths.data.display()))?;
        self.log_op("Insert", &row_details(row)?)?;
        Ok(n)
    }

    /// Overwrite, in row `n`, every cell named in `row` that exists in the
    /// schema. Unknown keys are ignored. Tombstoned rows are rejected.
    pub fn update(&self, n: u64, row: &Row) -> Result<(), DBError> {
        self.check_row(n)?;
        if self.is_deleted(n)? {
            return Err(TableError::RowTombstoned(n).into());
        }
        for (name, value) in row {
            if !self.columns.contains_key(name) {
                continue;
            }
            self.write_cell(n, name, value)?;
        }
        self.log_op("Update", &format!("{n} {}", row_details(row)?))
    }

    /// Tombstone row `n`. Fails if the row is out of bounds or already
    /// tombstoned.
    pub fn delete_row(&self, n: u64) -> Result<(), DBError> {
        self.column(DELETED_COLUMN)?;
        self.check_row(n)?;
        if self.is_deleted(n)? {
            return Err(TableError::RowTombstoned(n).into());
        }
        self.write_cell(n, DELETED_COLUMN, TOMBSTONE)?;
        self.log_op("Delete", &n.to_string())
    }

    /// Clear the tombstone of row `n` back to a space. Used by rollback to
    /// undo a delete; bypasses the tombstone check so reverse replay stays
    /// idempotent.
    pub(crate) fn restore_row(&self, n: u64) -> Result<(), DBError> {
        self.write_cell(n, DELETED_COLUMN, " ")
    }

    /// Append a column to the schema and the `.def` file. Only valid while
    /// the table has no rows; the caller otherwise goes through a rebuild.
    pub(crate) fn push_column(&mut self, name: &str, len: usize) -> Result<(), DBError> {
        let mut def = File::options()
            .append(true)
            .open(&self.paths.def)
            .with_context(|| format!("could not open {}", self.paths.def.display()))?;
        writeln!(def, "{name}:{len}")
            .with_context(|| format!("could not append to {}", self.paths.def.display()))?;

        let offset = self.row_length - 1;
        self.columns.insert(
            name.to_owned(),
            Column {
                name: name.to_owned(),
                len,
                offset,
            },
        );
        self.order.push(name.to_owned());
        self.row_length += len;
        self.log_op("AddColumn", &format!("{name}:{len}"))
    }

    /// Drop a column from the schema and rewrite the `.def` file. Only
    /// valid while the table has no rows.
    pub(crate) fn drop_column_in_place(&mut self, name: &str) -> Result<(), DBError> {
        self.order.retain(|c| c != name);
        self.columns.remove(name);

        let mut offset = 0;
        let mut def = String::new();
        for col_name in &self.order {
            let col = self.columns.get_mut(col_name).expect("column in order but not in map");
            col.offset = offset;
            offset += col.len;
            def.push_str(&format!("{}:{}\n", col.name, col.len));
        }
        self.row_length = offset + 1;
        fs::write(&self.paths.def, def)
            .with_context(|| format!("could not rewrite {}", self.paths.def.display()))?;
        self.log_op("DeleteColumn", name)
    }

    /// Append one audit line to the `.log` file:
    /// `<unix_seconds>\t<Type>\t<details>`. The log is never read back.
    pub(crate) fn log_op(&self, ty: &str, details: &str) -> Result<(), DBError> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut log = self.log.lock();
        writeln!(log, "{ts}\t{ty}\t{details}")
            .with_context(|| format!("could not append to {}", self.paths.log.display()))?;
        log.flush()
            .with_context(|| format!("could not flush {}", self.paths.log.display()))?;
        Ok(())
    }
}

/// Deterministic rendering of a row for audit-log lines. Keys are sorted so
/// identical rows always produce identical lines.
fn row_details(row: &Row) -> Result<String, DBError> {
    let sorted: BTreeMap<&str, &str> = row.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    Ok(serde_json::to_string(&sorted)?)
}
