//! The explicitly owned application core.
//!
//! `NotesContext` owns the configuration, the database and every component
//! built on it. UI mutations go through the context so that the note write and
//! its sync queue entry commit in one transaction.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::conflicts::ConflictLog;
use crate::connectivity::ConnectivityMonitor;
use crate::database::{lock, Database, SharedDatabase};
use crate::error::{NoteError, NoteResult};
use crate::models::{Note, SyncOperation};
use crate::store::{read_note, write_note, write_tombstone, Ack, LocalStore};
use crate::sync_client::{HttpRemote, RemoteApi};
use crate::sync_queue::{FlushResult, SyncQueue};
use crate::worker::{Notifier, WorkerLifecycle, WorkerPlatform};

pub struct NotesContext<R: RemoteApi, P: WorkerPlatform> {
    config: Config,
    db: SharedDatabase,
    store: LocalStore,
    queue: SyncQueue<R>,
    conflicts: ConflictLog,
    connectivity: ConnectivityMonitor,
    lifecycle: WorkerLifecycle<R, P>,
    tasks: Vec<JoinHandle<()>>,
}

impl<P: WorkerPlatform> NotesContext<HttpRemote, P> {
    /// Open the core against the configured HTTP remote
    pub fn open(config: Config, platform: Arc<P>, notifier: Arc<dyn Notifier>) -> NoteResult<Self> {
        let url = config
            .remote_url()
            .ok_or_else(|| NoteError::Config("remote_url is not set".to_string()))?;
        let remote = HttpRemote::new(url, config.sync_config().request_timeout())?;
        Self::with_remote(config, Arc::new(remote), platform, notifier)
    }
}

impl<R: RemoteApi, P: WorkerPlatform> NotesContext<R, P> {
    /// Open the database named by the configuration
    pub fn with_remote(
        config: Config,
        remote: Arc<R>,
        platform: Arc<P>,
        notifier: Arc<dyn Notifier>,
    ) -> NoteResult<Self> {
        let db_path = if config.database_file().is_empty() {
            config.config_dir().join("notes.db")
        } else {
            PathBuf::from(config.database_file())
        };
        tracing::info!(path = %db_path.display(), "Opening notes database");
        let db = Database::new(&db_path)?.into_shared();
        Ok(Self::with_database(config, db, remote, platform, notifier))
    }

    pub fn with_database(
        config: Config,
        db: SharedDatabase,
        remote: Arc<R>,
        platform: Arc<P>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let sync = config.sync_config().clone();
        let queue = SyncQueue::new(db.clone(), remote, &sync);
        let lifecycle = WorkerLifecycle::new(
            platform,
            queue.clone(),
            notifier,
            config.notifications_granted(),
        );

        Self {
            store: LocalStore::new(db.clone()),
            conflicts: ConflictLog::new(db.clone()),
            connectivity: ConnectivityMonitor::from_config(&sync, false),
            queue,
            lifecycle,
            config,
            db,
            tasks: Vec::new(),
        }
    }

    /// Start background work: the reconnect watcher and, when sync is enabled,
    /// worker registration.
    ///
    /// A failed registration is not an error here: the core keeps working
    /// offline and the UI can call [`WorkerLifecycle::retry_registration`].
    pub async fn start(&mut self) -> NoteResult<()> {
        let hook = Arc::new(self.lifecycle.clone());
        self.tasks.push(self.connectivity.spawn_reconnect_watcher(hook));

        if !self.config.is_sync_enabled() {
            tracing::info!("Sync disabled in config, running offline only");
            return Ok(());
        }

        if let Err(e) = self.lifecycle.register().await {
            tracing::warn!(error = %e, "Running offline only");
        }
        Ok(())
    }

    /// Stop background tasks and persist the configuration
    pub async fn shutdown(mut self) -> NoteResult<()> {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.config.save()?;
        tracing::info!(
            unsynced = self.queue.has_unsynced_changes()?,
            "Notes core shut down"
        );
        Ok(())
    }

    /// Create and persist a new note, queueing it for sync
    pub fn create_note(&self, title: &str, body: &str) -> NoteResult<Note> {
        self.save_with(Note::new(title, body), SyncOperation::Create)
    }

    /// Persist an edit of an existing note, queueing it for sync
    pub fn update_note(&self, note: Note) -> NoteResult<Note> {
        self.save_with(note, SyncOperation::Update)
    }

    /// Tombstone a note and queue the deletion
    pub fn delete_note(&self, id: Uuid) -> NoteResult<Ack> {
        let db = lock(&self.db)?;
        let tx = db.connection().unchecked_transaction()?;
        let tombstone = write_tombstone(&tx, id)?;
        self.queue.enqueue_in(&tx, SyncOperation::Delete, &tombstone.snapshot())?;
        tx.commit()?;

        tracing::info!(note_id = %id.simple(), version = tombstone.version, "Deleted note");
        Ok(Ack {
            id,
            version: tombstone.version,
        })
    }

    /// Flush now, if the worker is active
    pub async fn sync_now(&self) -> Option<FlushResult> {
        self.lifecycle.sync_now().await
    }

    fn save_with(&self, note: Note, operation: SyncOperation) -> NoteResult<Note> {
        let db = lock(&self.db)?;
        let tx = db.connection().unchecked_transaction()?;

        if operation == SyncOperation::Update && read_note(&tx, note.id, false)?.is_none() {
            return Err(NoteError::not_found(format!("note {}", note.id.simple())));
        }
        let saved = write_note(&tx, note)?;
        self.queue.enqueue_in(&tx, operation, &saved.snapshot())?;
        tx.commit()?;

        tracing::info!(
            note_id = %saved.id.simple(),
            version = saved.version,
            operation = operation.as_str(),
            "Saved note"
        );
        Ok(saved)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &SyncQueue<R> {
        &self.queue
    }

    pub fn conflicts(&self) -> &ConflictLog {
        &self.conflicts
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn lifecycle(&self) -> &WorkerLifecycle<R, P> {
        &self.lifecycle
    }
}
