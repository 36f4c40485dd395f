//! Data models for notecore.
//!
//! This module defines the core entities: Note, the sync queue entry and the
//! process state owned by the connectivity monitor and the worker lifecycle manager.
//! Timestamps are UTC with millisecond precision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default colour for new notes
pub const DEFAULT_NOTE_COLOR: &str = "default";

/// Represents a note in the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Unique identifier for the note (UUID7), immutable once created
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub color: String,
    pub pinned: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every local or remote write
    pub version: i64,
    /// Tombstone, set until the remote confirms the deletion
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Note {
    /// Create a new, never persisted note
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::now_v7(),
            title: title.into(),
            body: body.into(),
            color: DEFAULT_NOTE_COLOR.to_string(),
            pinned: false,
            archived: false,
            created_at: now,
            updated_at: now,
            version: 0,
            deleted_at: None,
        }
    }

    /// Get the note ID as a hex string
    pub fn id_hex(&self) -> String {
        self.id.simple().to_string()
    }

    /// Check if the note is tombstoned
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn snapshot(&self) -> NoteSnapshot {
        NoteSnapshot::from(self)
    }
}

/// The wire form of a note exchanged with the remote sync API.
///
/// Timestamps travel as Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSnapshot {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub color: String,
    pub pinned: bool,
    pub archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: i64,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

impl From<&Note> for NoteSnapshot {
    fn from(note: &Note) -> Self {
        Self {
            id: note.id,
            title: note.title.clone(),
            body: note.body.clone(),
            color: note.color.clone(),
            pinned: note.pinned,
            archived: note.archived,
            created_at: note.created_at.timestamp_millis(),
            updated_at: note.updated_at.timestamp_millis(),
            version: note.version,
            deleted_at: note.deleted_at.map(|t| t.timestamp_millis()),
        }
    }
}

impl NoteSnapshot {
    /// Convert back into a Note. Out-of-range timestamps fall back to the epoch.
    pub fn to_note(&self) -> Note {
        Note {
            id: self.id,
            title: self.title.clone(),
            body: self.body.clone(),
            color: self.color.clone(),
            pinned: self.pinned,
            archived: self.archived,
            created_at: millis_to_datetime(self.created_at),
            updated_at: millis_to_datetime(self.updated_at),
            version: self.version,
            deleted_at: self.deleted_at.map(millis_to_datetime),
        }
    }
}

/// Kind of mutation carried by a sync queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create" => Some(SyncOperation::Create),
            "update" => Some(SyncOperation::Update),
            "delete" => Some(SyncOperation::Delete),
            _ => None,
        }
    }
}

/// Delivery status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for (re)delivery
    Pending,
    /// Attempt ceiling reached; needs a manual retry
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "error" => Some(EntryStatus::Error),
            _ => None,
        }
    }
}

/// A mutation waiting for confirmation by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub entry_id: Uuid,
    /// Durable append order
    pub seq: i64,
    pub note_id: Uuid,
    pub operation: SyncOperation,
    pub payload: NoteSnapshot,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: EntryStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncQueueEntry {
    /// Whether the entry may be sent at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Online/offline state owned by the connectivity monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub is_online: bool,
    pub last_changed_at: DateTime<Utc>,
}

/// Lifecycle of the background update worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Unregistered,
    Registering,
    Registered,
    UpdateAvailable,
    OfflineReady,
    Error,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Unregistered => "unregistered",
            WorkerState::Registering => "registering",
            WorkerState::Registered => "registered",
            WorkerState::UpdateAvailable => "update_available",
            WorkerState::OfflineReady => "offline_ready",
            WorkerState::Error => "error",
        }
    }

    /// States in which the worker is active and sync may run
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkerState::Registered | WorkerState::UpdateAvailable | WorkerState::OfflineReady
        )
    }
}

/// Current time truncated to the millisecond precision we persist.
pub fn now_millis() -> DateTime<Utc> {
    millis_to_datetime(Utc::now().timestamp_millis())
}

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_creation() {
        let note = Note::new("Groceries", "milk");

        assert!(!note.id.is_nil());
        assert_eq!(note.title, "Groceries");
        assert_eq!(note.color, DEFAULT_NOTE_COLOR);
        assert_eq!(note.version, 0);
        assert_eq!(note.created_at, note.updated_at);
        assert!(!note.is_deleted());
    }

    #[test]
    fn test_snapshot_preserves_note() {
        let mut note = Note::new("Title", "Body");
        note.pinned = true;
        note.deleted_at = Some(now_millis());

        assert_eq!(note.snapshot().to_note(), note);
    }

    #[test]
    fn test_id_hex_format() {
        let note = Note::new("Test", "");
        let hex = note.id_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_operation_names() {
        for op in [SyncOperation::Create, SyncOperation::Update, SyncOperation::Delete] {
            assert_eq!(SyncOperation::from_str(op.as_str()), Some(op));
        }
        assert_eq!(SyncOperation::from_str("upsert"), None);
    }

    #[test]
    fn test_entry_due() {
        let note = Note::new("a", "b");
        let now = now_millis();
        let mut entry = SyncQueueEntry {
            entry_id: Uuid::now_v7(),
            seq: 1,
            note_id: note.id,
            operation: SyncOperation::Create,
            payload: note.snapshot(),
            enqueued_at: now,
            attempts: 0,
            last_error: None,
            status: EntryStatus::Pending,
            last_attempt_at: None,
            next_attempt_at: None,
        };
        assert!(entry.is_due(now));

        entry.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(!entry.is_due(now));

        entry.next_attempt_at = None;
        entry.status = EntryStatus::Error;
        assert!(!entry.is_due(now));
    }

    #[test]
    fn test_worker_state_active() {
        assert!(WorkerState::Registered.is_active());
        assert!(WorkerState::OfflineReady.is_active());
        assert!(!WorkerState::Error.is_active());
        assert!(!WorkerState::Registering.is_active());
    }
}
