//! Transactions: advisory table locks, an in-memory undo log, commit and
//! rollback.
//!
//! Locks live on the filesystem so separate processes sharing a database
//! directory can see them: a shared lock is an empty file named after the
//! holding transaction inside `<table>.shared/`, the exclusive lock is a
//! single-line file `<table>.exclusive` containing the holder's id. Lock
//! files older than the database's configured timeout are garbage-collected
//! by the next [`locks_of`] call.
//!
//! The read-then-create window between inspecting the lock state and
//! writing a lock file is closed within cooperating processes by holding an
//! OS-level advisory lock on the database's `.init` file for the duration
//! of each lock-state change. The on-disk lock files clients see are
//! unchanged by this.
//!
//! The undo log is in-memory only and does not survive the process; it is
//! replayed in strict reverse order on rollback.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use fs2::FileExt as _;

use crate::db::relational_db::{unix_micros, Database};
use crate::db::table::Row;
use crate::error::{DBError, LockError, TableError};

/// Age after which an advisory lock file is considered abandoned.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// A transaction id: wall-clock seconds with microsecond precision,
/// allocated strictly increasing within the process. The rendered form is
/// also the filename of the transaction's shared-lock markers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxId(String);

impl TxId {
    fn allocate() -> Self {
        static LAST: AtomicU64 = AtomicU64::new(0);
        let now = unix_micros();
        let prev = LAST
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(0);
        let micros = now.max(prev + 1);
        Self(format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000))
    }

    fn from_name(name: String) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id as fractional unix seconds, for expiry checks.
    fn as_seconds(&self) -> Option<f64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One reversible mutation, tagged by the operation that produced it.
#[derive(Debug, Clone)]
pub(crate) enum UndoRecord {
    Insert { table: String, row: u64 },
    Update { table: String, row: u64, old: Row },
    Delete { table: String, row: u64 },
}

/// The advisory locks currently held on a table.
#[derive(Debug, Default, Clone)]
pub struct LockState {
    pub shared: Vec<TxId>,
    pub exclusive: Option<TxId>,
}

/// Scan a table's lock files, unlink the expired ones, and return the
/// surviving holders.
pub fn locks_of(db: &Database, table: &str) -> Result<LockState, DBError> {
    let paths = db.table(table)?.paths().clone();
    let timeout = db.lock_timeout().as_secs_f64();
    let now = unix_micros() as f64 / 1e6;
    let expired = |id: &TxId| id.as_seconds().is_some_and(|secs| now - secs > timeout);

    let mut shared = Vec::new();
    match fs::read_dir(&paths.shared) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let id = TxId::from_name(name);
                if expired(&id) {
                    log::debug!("collecting expired shared lock {id} on `{table}`");
                    fs::remove_file(entry.path())
                        .with_context(|| format!("could not remove {}", entry.path().display()))?;
                } else {
                    shared.push(id);
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("unable to read lock directory {}", paths.shared.display()))
                .into())
        }
    }

    let exclusive = match fs::read_to_string(&paths.exclusive) {
        Ok(contents) => {
            let id = TxId::from_name(contents.trim().to_owned());
            if id.as_str().is_empty() {
                None
            } else if expired(&id) {
                log::debug!("collecting expired exclusive lock {id} on `{table}`");
                fs::remove_file(&paths.exclusive)
                    .with_context(|| format!("could not remove {}", paths.exclusive.display()))?;
                None
            } else {
                Some(id)
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("could not read {}", paths.exclusive.display()))
                .into())
        }
    };

    Ok(LockState { shared, exclusive })
}

/// Holds the database meta lock for the duration of a lock-state change.
struct MetaLockGuard<'a> {
    file: &'a File,
}

impl<'a> MetaLockGuard<'a> {
    fn acquire(db: &'a Database) -> Result<Self, DBError> {
        let file = db.meta_lock();
        file.lock_exclusive()
            .context("could not take the database meta lock")?;
        Ok(Self { file })
    }
}

impl Drop for MetaLockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// A reusable transaction: after [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) the undo log is empty, all locks are
/// released, and the transaction can be used again under the same id.
pub struct Transaction {
    id: TxId,
    log: Vec<UndoRecord>,
    locked: Vec<String>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: TxId::allocate(),
            log: Vec::new(),
            locked: Vec::new(),
        }
    }

    pub fn id(&self) -> &TxId {
        &self.id
    }

    /// Tables this transaction currently holds a lock on.
    pub fn locked_tables(&self) -> &[String] {
        &self.locked
    }

    pub(crate) fn record(&mut self, undo: UndoRecord) {
        self.log.push(undo);
    }

    /// Take the exclusive lock on `table`: allowed iff no other live
    /// transaction holds a shared or exclusive lock. An own shared lock is
    /// released first (downgrade-then-upgrade).
    pub fn e_lock(&mut self, db: &Database, table: &str) -> Result<(), DBError> {
        let _guard = MetaLockGuard::acquire(db)?;
        let state = locks_of(db, table)?;

        if let Some(holder) = state.exclusive.as_ref().filter(|id| **id != self.id) {
            return Err(LockError::ExclusiveConflict {
                table: table.to_owned(),
                holder: holder.clone(),
            }
            .into());
        }
        if let Some(holder) = state.shared.iter().find(|id| **id != self.id) {
            return Err(LockError::ExclusiveConflict {
                table: table.to_owned(),
                holder: holder.clone(),
            }
            .into());
        }
        if state.shared.contains(&self.id) {
            self.release(db, table)?;
        }

        let paths = db.table(table)?.paths();
        fs::write(&paths.exclusive, self.id.as_str())
            .with_context(|| format!("could not write {}", paths.exclusive.display()))?;
        self.note_locked(table);
        Ok(())
    }

    /// Take a shared lock on `table`: allowed iff no other live
    /// transaction holds the exclusive lock. An own exclusive lock is
    /// dropped first.
    pub fn s_lock(&mut self, db: &Database, table: &str) -> Result<(), DBError> {
        let _guard = MetaLockGuard::acquire(db)?;
        let state = locks_of(db, table)?;

        match state.exclusive {
            Some(ref holder) if *holder != self.id => {
                return Err(LockError::SharedConflict {
                    table: table.to_owned(),
                    holder: holder.clone(),
                }
                .into());
            }
            Some(_) => self.release(db, table)?,
            None => {}
        }

        let paths = db.table(table)?.paths();
        let marker = paths.shared.join(self.id.as_str());
        File::create(&marker).with_context(|| format!("could not create {}", marker.display()))?;
        self.note_locked(table);
        Ok(())
    }

    /// Release whatever lock this transaction holds on `table`.
    pub fn unlock(&mut self, db: &Database, table: &str) -> Result<(), DBError> {
        let _guard = MetaLockGuard::acquire(db)?;
        self.release(db, table)?;
        self.locked.retain(|t| t != table);
        Ok(())
    }

    /// Filesystem part of unlock; callers maintain `self.locked` and the
    /// meta lock.
    fn release(&self, db: &Database, table: &str) -> Result<(), DBError> {
        let state = locks_of(db, table)?;
        let paths = db.table(table)?.paths();
        if state.exclusive.as_ref() == Some(&self.id) {
            fs::remove_file(&paths.exclusive)
                .with_context(|| format!("could not remove {}", paths.exclusive.display()))?;
        } else if state.shared.contains(&self.id) {
            let marker = paths.shared.join(self.id.as_str());
            fs::remove_file(&marker)
                .with_context(|| format!("could not remove {}", marker.display()))?;
        }
        Ok(())
    }

    fn note_locked(&mut self, table: &str) {
        if !self.locked.iter().any(|t| t == table) {
            self.locked.push(table.to_owned());
        }
    }

    /// Release all locks and clear the undo log.
    pub fn commit(&mut self, db: &Database) -> Result<(), DBError> {
        let tables = std::mem::take(&mut self.locked);
        if !tables.is_empty() {
            let _guard = MetaLockGuard::acquire(db)?;
            for table in &tables {
                match self.release(db, table) {
                    // a table dropped mid-transaction took its lock files with it
                    Err(DBError::Table(TableError::NotFound(_))) => {
                        log::warn!("table `{table}` vanished before its lock was released")
                    }
                    result => result?,
                }
            }
        }
        self.log.clear();
        Ok(())
    }

    /// Walk the undo log in reverse, restoring every mutated row, then
    /// commit. An undone insert leaves a tombstoned record behind; an
    /// undone delete has its tombstone cleared back to a space.
    pub fn rollback(&mut self, db: &Database) -> Result<(), DBError> {
        log::debug!("rolling back transaction {} ({} undo entries)", self.id, self.log.len());
        let entries = std::mem::take(&mut self.log);
        for undo in entries.iter().rev() {
            match undo {
                UndoRecord::Insert { table, row } => db.table(table)?.delete_row(*row)?,
                UndoRecord::Update { table, row, old } => db.table(table)?.update(*row, old)?,
                UndoRecord::Delete { table, row } => db.table(table)?.restore_row(*row)?,
            }
        }
        self.commit(db)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("undo_entries", &self.log.len())
            .field("locked", &self.locked)
            .finish()
    }
}
