//! The database: a directory-scoped set of tables.
//!
//! Opening a directory scans it for `<name>.(data|log|def)` triples and
//! instantiates one [`Table`] per distinct name. First-time initialisation
//! creates the two reserved trigger meta-tables and a `.init` flag file;
//! re-opening is idempotent.
//!
//! The database is also the entry point for row mutations: insert, update
//! and delete each wrap the physical mutation in a before-trigger pass and
//! an after-trigger pass, with the applicable triggers looked up through
//! the relational algebra against the meta-tables.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;

use crate::db::filter;
use crate::db::relational_operators::View;
use crate::db::system_tables::{is_reserved_table_name, trigger_table_columns, ST_AFTER, ST_BEFORE};
use crate::db::table::{Row, Table, TablePaths, DELETED_COLUMN, MAX_NAME_LEN};
use crate::db::transaction::{Transaction, UndoRecord, DEFAULT_LOCK_TIMEOUT};
use crate::db::trigger::{self, Operation};
use crate::error::{DBError, DatabaseError, TableError};

/// Options for opening a [`Database`], similar to [`fs::OpenOptions`].
#[derive(Clone, Copy, Debug)]
pub struct OpenOptions {
    lock_timeout: Duration,
}

impl OpenOptions {
    /// Set the age after which advisory lock files are considered stale
    /// and garbage-collected.
    ///
    /// Default: 300 seconds.
    pub fn lock_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.lock_timeout = timeout;
        self
    }

    /// Open the [`Database`] at `path` with the options in self.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Database, DBError> {
        Database::open_with(path.as_ref(), *self)
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

pub struct Database {
    path: PathBuf,
    tables: HashMap<String, Table>,
    lock_timeout: Duration,
    /// Handle to the `.init` flag file; transactions take an OS-level
    /// advisory lock on it around lock-state read-modify-write sections.
    init_file: File,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl Database {
    /// Open the database at `path` with default options. The path must be
    /// an existing directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DBError> {
        OpenOptions::default().open(path)
    }

    pub fn options() -> OpenOptions {
        OpenOptions::default()
    }

    fn open_with(path: &Path, options: OpenOptions) -> Result<Self, DBError> {
        if !path.is_dir() {
            return Err(DatabaseError::NotADirectory(path.to_owned()).into());
        }

        let mut names = BTreeSet::new();
        for entry in
            fs::read_dir(path).with_context(|| format!("unable to read directory {}", path.display()))?
        {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with('.') {
                continue;
            }
            let entry_path = entry.path();
            let Some(ext) = entry_path.extension() else {
                continue;
            };
            if ext != "data" && ext != "log" && ext != "def" {
                continue;
            }
            if let Some(stem) = entry_path.file_stem().and_then(|s| s.to_str()) {
                names.insert(stem.to_owned());
            }
        }

        let mut tables = HashMap::with_capacity(names.len() + 2);
        for name in names {
            let table = Table::open(path, &name)?;
            tables.insert(name, table);
        }

        let init_path = path.join(".init");
        if !init_path.try_exists()? {
            for meta in [ST_BEFORE, ST_AFTER] {
                if tables.contains_key(meta) {
                    continue;
                }
                let mut table = Table::create(path, meta)?;
                table.push_column(DELETED_COLUMN, 1)?;
                for field in trigger_table_columns() {
                    table.push_column(field.name(), field.width())?;
                }
                tables.insert(meta.to_owned(), table);
            }
            File::create(&init_path)
                .with_context(|| format!("could not create {}", init_path.display()))?;
            log::debug!("initialised database directory {}", path.display());
        }

        let init_file = File::options()
            .read(true)
            .write(true)
            .open(&init_path)
            .with_context(|| format!("could not open {}", init_path.display()))?;

        log::debug!("opened database at {} with {} tables", path.display(), tables.len());
        Ok(Self {
            path: path.to_owned(),
            tables,
            lock_timeout: options.lock_timeout,
            init_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// The file transactions flock around lock-state changes.
    pub(crate) fn meta_lock(&self) -> &File {
        &self.init_file
    }

    pub fn table(&self, name: &str) -> Result<&Table, DBError> {
        self.tables
            .get(name)
            .ok_or_else(|| TableError::NotFound(name.to_owned()).into())
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Tables created by the user, i.e. everything but `~before`/`~after`.
    pub fn iter_user_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values().filter(|t| !is_reserved_table_name(t.name()))
    }

    pub fn iter_system_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values().filter(|t| is_reserved_table_name(t.name()))
    }

    /// Create an empty table: the three files, the `.shared` lock
    /// directory, and every default DB column.
    pub fn new_table(&mut self, name: &str) -> Result<&Table, DBError> {
        if name.len() > MAX_NAME_LEN {
            return Err(TableError::NameTooLong(name.to_owned(), MAX_NAME_LEN).into());
        }
        if self.tables.contains_key(name) {
            return Err(TableError::Exist(name.to_owned()).into());
        }
        let paths = TablePaths::new(&self.path, name);
        for path in [&paths.def, &paths.data, &paths.log] {
            if path.try_exists()? {
                return Err(TableError::Exist(name.to_owned()).into());
            }
        }

        let mut table = Table::create(&self.path, name)?;
        table.push_column(DELETED_COLUMN, 1)?;
        self.tables.insert(name.to_owned(), table);
        Ok(&self.tables[name])
    }

    /// Unlink the table's files and lock entries and drop it from the
    /// database.
    pub fn delete_table(&mut self, name: &str) -> Result<(), DBError> {
        let table = self
            .tables
            .remove(name)
            .ok_or_else(|| TableError::NotFound(name.to_owned()))?;
        let paths = table.paths().clone();
        drop(table);

        for path in [&paths.data, &paths.log, &paths.def] {
            fs::remove_file(path).with_context(|| format!("could not remove {}", path.display()))?;
        }
        fs::remove_dir_all(&paths.shared)
            .with_context(|| format!("could not remove {}", paths.shared.display()))?;
        remove_if_exists(&paths.exclusive)?;
        Ok(())
    }

    /// Rename every filesystem entry of the table and reopen its handles.
    pub fn rename_table(&mut self, old: &str, new: &str) -> Result<(), DBError> {
        if new.len() > MAX_NAME_LEN {
            return Err(TableError::NameTooLong(new.to_owned(), MAX_NAME_LEN).into());
        }
        if !self.tables.contains_key(old) {
            return Err(TableError::NotFound(old.to_owned()).into());
        }
        if self.tables.contains_key(new) {
            return Err(TableError::Exist(new.to_owned()).into());
        }
        let new_paths = TablePaths::new(&self.path, new);
        for path in [&new_paths.def, &new_paths.data, &new_paths.log] {
            if path.try_exists()? {
                return Err(TableError::Exist(new.to_owned()).into());
            }
        }

        let mut table = self.tables.remove(old).expect("checked above");
        let old_paths = table.paths().clone();
        for (from, to) in [
            (&old_paths.def, &new_paths.def),
            (&old_paths.data, &new_paths.data),
            (&old_paths.log, &new_paths.log),
            (&old_paths.shared, &new_paths.shared),
        ] {
            fs::rename(from, to)
                .with_context(|| format!("could not rename {} to {}", from.display(), to.display()))?;
        }
        if old_paths.exclusive.try_exists()? {
            fs::rename(&old_paths.exclusive, &new_paths.exclusive).with_context(|| {
                format!("could not rename {}", old_paths.exclusive.display())
            })?;
        }

        table.reopen(&self.path, new)?;
        self.tables.insert(new.to_owned(), table);
        Ok(())
    }

    /// Add a column. An empty table is patched in place; a table with rows
    /// is rebuilt with the new (empty) column appended.
    pub fn add_column(&mut self, table: &str, column: &str, len: usize) -> Result<(), DBError> {
        if column.len() > MAX_NAME_LEN {
            return Err(TableError::ColumnNameTooLong(column.to_owned(), MAX_NAME_LEN).into());
        }
        let t = self.table(table)?;
        if t.has_column(column) {
            return Err(TableError::ColumnExists(column.to_owned()).into());
        }
        if t.number_of_rows()? == 0 {
            let t = self.tables.get_mut(table).expect("looked up above");
            return t.push_column(column, len);
        }
        self.rebuild_data_file(table, Some((column, len)), None)
    }

    /// Drop a column. Reserved DB columns cannot be dropped. A table with
    /// rows is rebuilt without the column.
    pub fn delete_column(&mut self, table: &str, column: &str) -> Result<(), DBError> {
        if column == DELETED_COLUMN {
            return Err(TableError::ReservedColumn(column.to_owned()).into());
        }
        let t = self.table(table)?;
        t.column(column)?;
        if t.number_of_rows()? == 0 {
            let t = self.tables.get_mut(table).expect("looked up above");
            return t.drop_column_in_place(column);
        }
        self.rebuild_data_file(table, None, Some(column))?;
        self.table(table)?.log_op("DeleteColumn", column)
    }

    /// Schema change by rebuild: copy the column definitions (with
    /// `added` appended and `dropped` left out) into a throwaway sibling
    /// table named `~<timestamp>`, re-insert every live row, delete the
    /// original, rename the temp table over it and reopen the handles.
    /// Tombstoned rows do not survive a rebuild.
    fn rebuild_data_file(
        &mut self,
        name: &str,
        added: Option<(&str, usize)>,
        dropped: Option<&str>,
    ) -> Result<(), DBError> {
        let (columns, live_rows) = {
            let t = self.table(name)?;
            let mut columns = Vec::new();
            for col_name in t.order() {
                if col_name == DELETED_COLUMN || Some(col_name.as_str()) == dropped {
                    continue;
                }
                columns.push((col_name.clone(), t.column(col_name)?.len));
            }
            let mut rows = Vec::new();
            for n in 0..t.number_of_rows()? {
                if !t.is_deleted(n)? {
                    rows.push(t.read_row(n)?);
                }
            }
            (columns, rows)
        };

        let tmp = format!("~{}", unix_micros());
        self.new_table(&tmp)?;
        {
            let t = self.tables.get_mut(&tmp).expect("just created");
            for (column, len) in &columns {
                t.push_column(column, *len)?;
            }
            if let Some((column, len)) = added {
                t.push_column(column, len)?;
            }
        }
        {
            let t = self.table(&tmp)?;
            for row in &live_rows {
                t.insert(row)?;
            }
        }

        self.delete_table(name)?;
        self.rename_table(&tmp, name)?;
        log::debug!("rebuilt table `{name}` ({} live rows)", live_rows.len());
        Ok(())
    }

    /// Build a view over the given meta-table, narrowed to triggers
    /// registered for `table`, and fire them.
    fn run_triggers(
        &self,
        meta: &str,
        table: &Table,
        op: Operation,
        row1: &Row,
        row2: Option<&Row>,
    ) -> Result<(), DBError> {
        let meta_table = self.table(meta)?;
        let mut view = View::new();
        view.prepare_table(meta_table)?;
        view.select("table", |c| filter::equals(c, table.name()))?;
        trigger::execute(self, table, &view, op, row1, row2)
    }

    /// Insert `row` into `table` under the trigger pipeline: before
    /// triggers, physical append, after triggers. Returns the row number.
    pub fn insert_row(&self, table: &str, row: &Row) -> Result<u64, DBError> {
        let t = self.table(table)?;
        self.run_triggers(ST_BEFORE, t, Operation::Insert, row, None)?;
        let n = t.insert(row)?;
        self.run_triggers(ST_AFTER, t, Operation::Insert, row, None)?;
        Ok(n)
    }

    /// Update row `n` of `table` under the trigger pipeline. `row1` seen
    /// by triggers is the row as read before the write; `row2` is `row`.
    pub fn update_row(&self, table: &str, n: u64, row: &Row) -> Result<(), DBError> {
        let old = self.table(table)?.read_row(n)?;
        self.update_row_inner(table, n, row, &old)
    }

    fn update_row_inner(&self, table: &str, n: u64, row: &Row, old: &Row) -> Result<(), DBError> {
        let t = self.table(table)?;
        self.run_triggers(ST_BEFORE, t, Operation::Update, old, Some(row))?;
        t.update(n, row)?;
        self.run_triggers(ST_AFTER, t, Operation::Update, old, Some(row))?;
        Ok(())
    }

    /// Tombstone row `n` of `table` under the trigger pipeline.
    pub fn delete_row(&self, table: &str, n: u64) -> Result<(), DBError> {
        let t = self.table(table)?;
        let old = t.read_row(n)?;
        self.run_triggers(ST_BEFORE, t, Operation::Delete, &old, None)?;
        t.delete_row(n)?;
        self.run_triggers(ST_AFTER, t, Operation::Delete, &old, None)?;
        Ok(())
    }

    /// Transactional insert: on success the undo log gains an entry; on
    /// failure the whole transaction is rolled back and the error is
    /// re-raised with context.
    pub fn insert(&self, tx: &mut Transaction, table: &str, row: &Row) -> Result<u64, DBError> {
        match self.insert_row(table, row) {
            Ok(n) => {
                tx.record(UndoRecord::Insert {
                    table: table.to_owned(),
                    row: n,
                });
                Ok(n)
            }
            Err(e) => Err(self.abort(tx, "Insert", table, e)?),
        }
    }

    /// Transactional update; snapshots the old row for the undo log.
    pub fn update(&self, tx: &mut Transaction, table: &str, n: u64, row: &Row) -> Result<(), DBError> {
        let old = match self.table(table).and_then(|t| t.read_row(n)) {
            Ok(old) => old,
            Err(e) => return Err(self.abort(tx, "Update", table, e)?),
        };
        match self.update_row_inner(table, n, row, &old) {
            Ok(()) => {
                tx.record(UndoRecord::Update {
                    table: table.to_owned(),
                    row: n,
                    old,
                });
                Ok(())
            }
            Err(e) => Err(self.abort(tx, "Update", table, e)?),
        }
    }

    /// Transactional delete.
    pub fn delete(&self, tx: &mut Transaction, table: &str, n: u64) -> Result<(), DBError> {
        match self.delete_row(table, n) {
            Ok(()) => {
                tx.record(UndoRecord::Delete {
                    table: table.to_owned(),
                    row: n,
                });
                Ok(())
            }
            Err(e) => Err(self.abort(tx, "Delete", table, e)?),
        }
    }

    /// Roll the transaction back and wrap the failure. Returns `Ok` with
    /// the wrapped error so rollback failures take precedence.
    fn abort(
        &self,
        tx: &mut Transaction,
        op: &'static str,
        table: &str,
        source: DBError,
    ) -> Result<DBError, DBError> {
        tx.rollback(self)?;
        Ok(DBError::TransactionAborted {
            op,
            table: table.to_owned(),
            source: Box::new(source),
        })
    }
}

fn remove_if_exists(path: &Path) -> Result<(), DBError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("could not remove {}", path.display()))
            .into()),
    }
}

pub(crate) fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
