//! notecore - local-first persistence and sync core of an offline notes app.
//!
//! This library provides:
//! - Data models (Note, sync queue entries, connectivity and worker state)
//! - Durable local note store (SQLite)
//! - Sync queue with retry, backoff and conflict resolution
//! - Connectivity monitoring with debounced reconnect
//! - Background worker lifecycle management
//! - Sync protocol (HTTP client and reference server)
//! - Configuration management
//!
//! Rendering, routing and analytics live in the host application, which calls
//! into [`NotesContext`] and receives events through [`worker::Notifier`].
//!
//! # Feature Flags
//!
//! - `server`: Include the reference HTTP server (axum). Not needed on clients.
//! - `desktop`: Include desktop-specific features (hostname detection, config dir detection).

pub mod backoff;
pub mod config;
pub mod conflicts;
pub mod connectivity;
pub mod context;
pub mod database;
pub mod error;
pub mod models;
pub mod store;
pub mod sync_client;
pub mod sync_queue;
#[cfg(feature = "server")]
pub mod sync_server;
pub mod validation;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use connectivity::ConnectivityMonitor;
pub use context::NotesContext;
pub use database::Database;
pub use error::{NoteError, NoteResult};
pub use models::{Note, NoteSnapshot, SyncOperation, SyncQueueEntry, WorkerState};
pub use store::{LocalStore, NoteFilter};
pub use sync_queue::{FlushResult, SyncQueue};
pub use worker::WorkerLifecycle;
