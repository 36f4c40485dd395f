//! Conflict resolution for notecore.
//!
//! When the remote rejects a mutation because our base version is stale, the
//! two copies of the note are compared and one wins outright:
//! - the copy with the later `updated_at` wins
//! - on equal timestamps the lexically greater note id wins
//! - then the higher version wins
//! - a complete tie keeps the remote copy
//!
//! The losing copy is never silently dropped: both sides are written to the
//! `conflict_log` table so the user can recover it.

use std::cmp::Ordering;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::{lock, SharedDatabase};
use crate::error::{NoteError, NoteResult};
use crate::models::{millis_to_datetime, now_millis, NoteSnapshot};
use crate::store::uuid_column;

/// Which side of a conflict was kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::Local => "local",
            Winner::Remote => "remote",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Winner::Local),
            "remote" => Some(Winner::Remote),
            _ => None,
        }
    }
}

/// Decide which copy of a note survives a conflict.
pub fn resolve(local: &NoteSnapshot, remote: &NoteSnapshot) -> Winner {
    // Uuid orders by its bytes, which matches the order of the hex form
    let ordering = local
        .updated_at
        .cmp(&remote.updated_at)
        .then_with(|| local.id.cmp(&remote.id))
        .then_with(|| local.version.cmp(&remote.version));

    match ordering {
        Ordering::Greater => Winner::Local,
        Ordering::Less | Ordering::Equal => Winner::Remote,
    }
}

/// A resolved conflict with both copies of the note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub note_id: Uuid,
    pub winner: Winner,
    pub local: NoteSnapshot,
    pub remote: NoteSnapshot,
    pub resolved_at: chrono::DateTime<chrono::Utc>,
    pub dismissed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ConflictRecord {
    /// The copy that was overwritten
    pub fn loser(&self) -> &NoteSnapshot {
        match self.winner {
            Winner::Local => &self.remote,
            Winner::Remote => &self.local,
        }
    }
}

/// Read access to the conflict log
#[derive(Clone)]
pub struct ConflictLog {
    db: SharedDatabase,
}

impl ConflictLog {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// List conflicts, newest first
    pub fn list(&self, include_dismissed: bool) -> NoteResult<Vec<ConflictRecord>> {
        let query = if include_dismissed {
            "SELECT id, note_id, winner, local_payload, remote_payload, resolved_at, dismissed_at \
             FROM conflict_log ORDER BY resolved_at DESC, id DESC"
        } else {
            "SELECT id, note_id, winner, local_payload, remote_payload, resolved_at, dismissed_at \
             FROM conflict_log WHERE dismissed_at IS NULL ORDER BY resolved_at DESC, id DESC"
        };

        let db = lock(&self.db)?;
        let mut stmt = db.connection().prepare(query)?;
        let rows = stmt.query_map([], row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Conflicts for one note, newest first
    pub fn for_note(&self, note_id: Uuid) -> NoteResult<Vec<ConflictRecord>> {
        Ok(self
            .list(true)?
            .into_iter()
            .filter(|record| record.note_id == note_id)
            .collect())
    }

    /// Number of conflicts the user has not dismissed yet
    pub fn count_undismissed(&self) -> NoteResult<usize> {
        let db = lock(&self.db)?;
        let count: i64 = db.connection().query_row(
            "SELECT COUNT(*) FROM conflict_log WHERE dismissed_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Mark a conflict as seen
    pub fn dismiss(&self, conflict_id: Uuid) -> NoteResult<()> {
        let db = lock(&self.db)?;
        let conn = db.connection();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conflict_log WHERE id = ?",
                [conflict_id.as_bytes().to_vec()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(NoteError::not_found(format!(
                "conflict {}",
                conflict_id.simple()
            )));
        }

        conn.execute(
            "UPDATE conflict_log SET dismissed_at = ? WHERE id = ? AND dismissed_at IS NULL",
            params![
                now_millis().timestamp_millis(),
                conflict_id.as_bytes().to_vec()
            ],
        )?;
        Ok(())
    }
}

/// Write both sides of a resolved conflict. Runs inside the caller's transaction.
pub(crate) fn record_conflict(
    conn: &Connection,
    local: &NoteSnapshot,
    remote: &NoteSnapshot,
    winner: Winner,
) -> NoteResult<Uuid> {
    let id = Uuid::now_v7();
    conn.execute(
        "INSERT INTO conflict_log (id, note_id, winner, local_payload, remote_payload, resolved_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            id.as_bytes().to_vec(),
            local.id.as_bytes().to_vec(),
            winner.as_str(),
            serde_json::to_string(local)?,
            serde_json::to_string(remote)?,
            now_millis().timestamp_millis(),
        ],
    )?;

    tracing::info!(
        note_id = %local.id.simple(),
        winner = winner.as_str(),
        local_version = local.version,
        remote_version = remote.version,
        "Recorded sync conflict"
    );
    Ok(id)
}

fn row_to_record(row: &Row) -> rusqlite::Result<ConflictRecord> {
    let winner: String = row.get(2)?;
    let dismissed_at: Option<i64> = row.get(6)?;

    Ok(ConflictRecord {
        id: uuid_column(row, 0)?,
        note_id: uuid_column(row, 1)?,
        winner: Winner::from_str(&winner).unwrap_or(Winner::Remote),
        local: json_column(row, 3)?,
        remote: json_column(row, 4)?,
        resolved_at: millis_to_datetime(row.get(5)?),
        dismissed_at: dismissed_at.map(millis_to_datetime),
    })
}

fn json_column(row: &Row, idx: usize) -> rusqlite::Result<NoteSnapshot> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
