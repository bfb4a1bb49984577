//! SQLite persistence on a dedicated worker thread.
//!
//! All writes are append-style or check-and-insert; nothing here ever
//! destructively updates an attendance record or capture event. The
//! at-most-one-record-per-(session, student) invariant lives in the
//! schema as a uniqueness constraint, so racing writers resolve to
//! "first insert wins" without coordination.

use std::{
    path::PathBuf,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::oneshot;

mod attendance;
mod captures;
mod migrations;
mod roster;
mod sessions;

pub use attendance::{AttendanceRecord, NewAttendance};
pub use captures::{CaptureEvent, CaptureStats, NewCapture};
pub use roster::Roster;

use migrations::apply_schema;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to open database: {0}")]
    Open(String),
    #[error("store worker unavailable")]
    WorkerGone,
    #[error("class already has an active session")]
    ActiveSessionExists,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if self.sender.send(DbCommand::Shutdown).is_err() {
                tracing::error!("store worker already gone at shutdown");
            }
            if let Err(err) = handle.join() {
                tracing::error!(?err, "failed to join store worker");
            }
        }
    }
}

/// Handle to the store. Clone-safe; all clones share one worker thread
/// owning the single SQLite connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

/// Where the worker opens its connection.
enum Backing {
    File(PathBuf),
    Memory,
}

impl Database {
    /// Open (or create) the database at `db_path` and apply the schema.
    pub fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("{}: {e}", parent.display())))?;
        }
        Self::spawn_worker(Backing::File(db_path))
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::spawn_worker(Backing::Memory)
    }

    fn spawn_worker(backing: Backing) -> Result<Self, StoreError> {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), StoreError>>();

        let worker = thread::Builder::new()
            .name("rollcall-store".into())
            .spawn(move || {
                let conn_result = match &backing {
                    Backing::File(path) => Connection::open(path),
                    Backing::Memory => Connection::open_in_memory(),
                };
                let mut conn = match conn_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(StoreError::Open(err.to_string())));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    tracing::warn!(error = %err, "failed to enable WAL mode");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    tracing::warn!(error = %err, "failed to enable foreign keys");
                }

                let init = apply_schema(&mut conn).map_err(StoreError::from);
                if ready_tx.send(init).is_err() {
                    tracing::error!("store opener dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }
            })
            .map_err(|e| StoreError::Open(format!("failed to spawn store worker: {e}")))?;

        ready_rx.recv().map_err(|_| StoreError::WorkerGone)??;

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Run a closure against the connection on the worker thread.
    pub(crate) async fn execute<T, F>(&self, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: DbTask = Box::new(move |conn| {
            let _ = reply_tx.send(task(conn));
        });

        self.inner
            .sender
            .send(DbCommand::Execute(wrapped))
            .map_err(|_| StoreError::WorkerGone)?;

        reply_rx.await.map_err(|_| StoreError::WorkerGone)?
    }
}

/// Timestamps are persisted RFC 3339 UTC with fixed microsecond width,
/// so lexicographic text comparison in SQL matches chronological order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("{column}: invalid datetime '{value}': {err}")))
}
