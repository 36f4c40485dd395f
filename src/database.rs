//! SQLite database for notecore.
//!
//! Owns the connection and the schema shared by the local store, the sync
//! queue and the conflict log. All timestamps are Unix milliseconds (INTEGER),
//! UUIDs are stored as BLOB (16 bytes).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::{NoteError, NoteResult};

/// Current schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Database handle shared between the store and the queue
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database file
    pub fn new<P: AsRef<Path>>(db_path: P) -> NoteResult<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        // Commits must reach disk before put/delete return
        conn.execute_batch("PRAGMA synchronous=FULL;")?;

        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> NoteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Wrap the database for sharing between components
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Initialize database schema
    pub fn init_database(&mut self) -> NoteResult<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(NoteError::database_op(format!(
                "database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        self.conn.execute_batch(
            r#"
            -- One durable record per note, keyed by id.
            -- remote_version is the last version confirmed by the remote (NULL = never synced)
            CREATE TABLE IF NOT EXISTS notes (
                id BLOB PRIMARY KEY,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                color TEXT NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL,
                deleted_at INTEGER,
                remote_version INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_notes_updated_at ON notes (updated_at, id);

            -- Ordered log of mutations awaiting remote confirmation
            CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id BLOB NOT NULL UNIQUE,
                note_id BLOB NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                last_attempt_at INTEGER,
                next_attempt_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_sync_queue_note ON sync_queue (note_id, seq);

            -- Losing side of every resolved sync conflict
            CREATE TABLE IF NOT EXISTS conflict_log (
                id BLOB PRIMARY KEY,
                note_id BLOB NOT NULL,
                winner TEXT NOT NULL,
                local_payload TEXT NOT NULL,
                remote_payload TEXT NOT NULL,
                resolved_at INTEGER NOT NULL,
                dismissed_at INTEGER
            );
            "#,
        )?;

        if version < SCHEMA_VERSION {
            tracing::info!(from = version, to = SCHEMA_VERSION, "Initialized database schema");
            self.conn
                .execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
        }

        Ok(())
    }

    /// Get the underlying connection (for advanced operations)
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Close the connection, reporting any error from SQLite
    pub fn close(self) -> NoteResult<()> {
        self.conn.close().map_err(|(_, e)| NoteError::from(e))
    }
}

/// Lock a shared database, turning a poisoned lock into an error.
pub fn lock(db: &SharedDatabase) -> NoteResult<MutexGuard<'_, Database>> {
    db.lock()
        .map_err(|_| NoteError::Other("database lock poisoned".to_string()))
}
