//! Local note store.
//!
//! Durable key-value persistence of notes on-device. Every write runs in its
//! own SQLite transaction, so a failed write (`StorageFull`, `Io`) is rolled
//! back before the caller sees the error and readers never observe a note that
//! was not durably recorded.
//!
//! Deleting a note only tombstones it; the row is purged once the remote has
//! confirmed the deletion.

use std::collections::VecDeque;

use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::{lock, SharedDatabase};
use crate::error::{NoteError, NoteResult};
use crate::models::{millis_to_datetime, now_millis, Note, NoteSnapshot};
use crate::validation::{validate_color, validate_note, validate_query};

const NOTE_COLUMNS: &str =
    "id, title, body, color, pinned, archived, created_at, updated_at, version, deleted_at";

/// Default number of notes fetched per page by [`NoteCursor`]
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Acknowledgement of a tombstoning delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub id: Uuid,
    /// Version of the tombstone
    pub version: i64,
}

/// Column a listing is ordered by. Ties are broken by note id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    UpdatedAt,
    CreatedAt,
    Title,
}

impl SortField {
    fn column(&self) -> &'static str {
        match self {
            SortField::UpdatedAt => "updated_at",
            SortField::CreatedAt => "created_at",
            SortField::Title => "title",
        }
    }

    fn key_of(&self, note: &Note) -> Value {
        match self {
            SortField::UpdatedAt => Value::Integer(note.updated_at.timestamp_millis()),
            SortField::CreatedAt => Value::Integer(note.created_at.timestamp_millis()),
            SortField::Title => Value::Text(note.title.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Descending,
    Ascending,
}

/// Selection and ordering for [`LocalStore::list`].
///
/// The default lists every live note, most recently updated first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteFilter {
    /// `Some(b)` keeps only notes whose `pinned` flag equals `b`
    pub pinned: Option<bool>,
    /// `Some(b)` keeps only notes whose `archived` flag equals `b`
    pub archived: Option<bool>,
    pub include_deleted: bool,
    pub color: Option<String>,
    /// Case-insensitive substring match over title and body
    pub query: Option<String>,
    pub sort: SortField,
    pub direction: SortDirection,
    pub page_size: usize,
}

impl Default for NoteFilter {
    fn default() -> Self {
        Self {
            pinned: None,
            archived: None,
            include_deleted: false,
            color: None,
            query: None,
            sort: SortField::default(),
            direction: SortDirection::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl NoteFilter {
    /// Live notes that are not archived
    pub fn active() -> Self {
        Self {
            archived: Some(false),
            ..Default::default()
        }
    }

    fn validate(&self) -> NoteResult<()> {
        validate_query(self.query.as_deref())?;
        if let Some(color) = &self.color {
            validate_color(color)?;
        }
        if self.page_size == 0 {
            return Err(NoteError::validation("page_size", "must be at least 1"));
        }
        Ok(())
    }

    /// Build the WHERE clause (without keyset condition) and its parameters.
    fn where_clause(&self) -> (Vec<String>, Vec<Value>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if !self.include_deleted {
            conditions.push("deleted_at IS NULL".to_string());
        }
        if let Some(pinned) = self.pinned {
            conditions.push("pinned = ?".to_string());
            values.push(Value::Integer(pinned as i64));
        }
        if let Some(archived) = self.archived {
            conditions.push("archived = ?".to_string());
            values.push(Value::Integer(archived as i64));
        }
        if let Some(color) = &self.color {
            conditions.push("color = ?".to_string());
            values.push(Value::Text(color.clone()));
        }
        if let Some(query) = self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let pattern = format!("%{}%", escape_like(query));
            conditions.push(
                "(title LIKE ? ESCAPE '\\' OR body LIKE ? ESCAPE '\\')".to_string(),
            );
            values.push(Value::Text(pattern.clone()));
            values.push(Value::Text(pattern));
        }

        (conditions, values)
    }
}

fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Local note store backed by the shared database
#[derive(Clone)]
pub struct LocalStore {
    db: SharedDatabase,
}

impl LocalStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Get a live note. Tombstoned notes are reported as not found.
    pub fn get(&self, id: Uuid) -> NoteResult<Note> {
        let db = lock(&self.db)?;
        read_note(db.connection(), id, false)?
            .ok_or_else(|| NoteError::not_found(format!("note {}", id.simple())))
    }

    /// Get a note, tombstones included
    pub fn get_including_deleted(&self, id: Uuid) -> NoteResult<Option<Note>> {
        let db = lock(&self.db)?;
        read_note(db.connection(), id, true)
    }

    /// Persist a note, bumping its version.
    ///
    /// Returns the note as stored. The write is durable when this returns.
    pub fn put(&self, note: Note) -> NoteResult<Note> {
        let db = lock(&self.db)?;
        let tx = db.connection().unchecked_transaction()?;
        let saved = write_note(&tx, note)?;
        tx.commit()?;
        Ok(saved)
    }

    /// Tombstone a note
    pub fn delete(&self, id: Uuid) -> NoteResult<Ack> {
        let db = lock(&self.db)?;
        let tx = db.connection().unchecked_transaction()?;
        let tombstone = write_tombstone(&tx, id)?;
        tx.commit()?;
        Ok(Ack {
            id,
            version: tombstone.version,
        })
    }

    /// Physically remove a note. Returns false if it did not exist.
    pub fn purge(&self, id: Uuid) -> NoteResult<bool> {
        let db = lock(&self.db)?;
        purge_note(db.connection(), id)
    }

    /// Overwrite a note with the authoritative remote state
    pub fn apply_remote(&self, remote: &NoteSnapshot) -> NoteResult<Note> {
        let db = lock(&self.db)?;
        let tx = db.connection().unchecked_transaction()?;
        let saved = write_remote(&tx, remote)?;
        tx.commit()?;
        Ok(saved)
    }

    /// Record the version the remote acknowledged for a note
    pub fn mark_confirmed(&self, id: Uuid, remote_version: i64) -> NoteResult<()> {
        let db = lock(&self.db)?;
        set_remote_version(db.connection(), id, remote_version)
    }

    /// Last version confirmed by the remote (None if never synced)
    pub fn remote_version(&self, id: Uuid) -> NoteResult<Option<i64>> {
        let db = lock(&self.db)?;
        read_remote_version(db.connection(), id)
    }

    /// Lazily enumerate notes matching `filter`.
    ///
    /// Nothing is read until the cursor is advanced; pages are fetched on demand
    /// and the cursor can be restarted from the beginning.
    pub fn list(&self, filter: NoteFilter) -> NoteResult<NoteCursor<'_>> {
        filter.validate()?;
        Ok(NoteCursor {
            store: self,
            filter,
            buffer: VecDeque::new(),
            after: None,
            exhausted: false,
        })
    }

    /// Count notes matching `filter`
    pub fn count(&self, filter: &NoteFilter) -> NoteResult<usize> {
        filter.validate()?;
        let (conditions, values) = filter.where_clause();
        let mut sql = "SELECT COUNT(*) FROM notes".to_string();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let db = lock(&self.db)?;
        let count: i64 = db
            .connection()
            .query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count as usize)
    }

    fn fetch_page(
        &self,
        filter: &NoteFilter,
        after: Option<&(Value, Vec<u8>)>,
    ) -> NoteResult<Vec<Note>> {
        let (mut conditions, mut values) = filter.where_clause();
        let column = filter.sort.column();
        let (cmp, dir) = match filter.direction {
            SortDirection::Descending => ("<", "DESC"),
            SortDirection::Ascending => (">", "ASC"),
        };

        if let Some((key, id)) = after {
            conditions.push(format!(
                "({col} {cmp} ? OR ({col} = ? AND id {cmp} ?))",
                col = column,
                cmp = cmp
            ));
            values.push(key.clone());
            values.push(key.clone());
            values.push(Value::Blob(id.clone()));
        }

        let mut sql = format!("SELECT {} FROM notes", NOTE_COLUMNS);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {col} {dir}, id {dir} LIMIT ?",
            col = column,
            dir = dir
        ));
        values.push(Value::Integer(filter.page_size as i64));

        let db = lock(&self.db)?;
        let mut stmt = db.connection().prepare(&sql)?;
        let notes = stmt
            .query_map(params_from_iter(values), row_to_note)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }
}

/// Lazy, restartable sequence of notes produced by [`LocalStore::list`].
///
/// Uses keyset pagination, so notes written while iterating neither shift nor
/// duplicate the remaining results.
pub struct NoteCursor<'a> {
    store: &'a LocalStore,
    filter: NoteFilter,
    buffer: VecDeque<Note>,
    after: Option<(Value, Vec<u8>)>,
    exhausted: bool,
}

impl NoteCursor<'_> {
    /// Start again from the first note
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.after = None;
        self.exhausted = false;
    }

    pub fn filter(&self) -> &NoteFilter {
        &self.filter
    }
}

impl Iterator for NoteCursor<'_> {
    type Item = NoteResult<Note>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.fetch_page(&self.filter, self.after.as_ref()) {
                Ok(page) => {
                    if page.len() < self.filter.page_size {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.after =
                            Some((self.filter.sort.key_of(last), last.id.as_bytes().to_vec()));
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

// ============================================================================
// Connection-level operations, shared with the sync queue so a note write and
// its queue entry can commit in one transaction.
// ============================================================================

pub(crate) fn read_note(conn: &Connection, id: Uuid, include_deleted: bool) -> NoteResult<Option<Note>> {
    let sql = if include_deleted {
        format!("SELECT {} FROM notes WHERE id = ?", NOTE_COLUMNS)
    } else {
        format!(
            "SELECT {} FROM notes WHERE id = ? AND deleted_at IS NULL",
            NOTE_COLUMNS
        )
    };
    let note = conn
        .query_row(&sql, [id.as_bytes().to_vec()], row_to_note)
        .optional()?;
    Ok(note)
}

pub(crate) fn write_note(conn: &Connection, note: Note) -> NoteResult<Note> {
    validate_note(&note)?;
    let existing = read_note(conn, note.id, true)?;
    let now = now_millis();

    let saved = match existing {
        Some(stored) => Note {
            created_at: stored.created_at,
            updated_at: now.max(stored.updated_at),
            version: stored.version.max(note.version) + 1,
            deleted_at: None,
            ..note
        },
        None => Note {
            updated_at: now.max(note.created_at),
            version: note.version + 1,
            deleted_at: None,
            ..note
        },
    };

    upsert(conn, &saved)?;
    tracing::debug!(note_id = %saved.id.simple(), version = saved.version, "Stored note");
    Ok(saved)
}

pub(crate) fn write_tombstone(conn: &Connection, id: Uuid) -> NoteResult<Note> {
    let stored = read_note(conn, id, false)?
        .ok_or_else(|| NoteError::not_found(format!("note {}", id.simple())))?;
    let now = now_millis().max(stored.updated_at);
    let tombstone = Note {
        updated_at: now,
        deleted_at: Some(now),
        version: stored.version + 1,
        ..stored
    };

    upsert(conn, &tombstone)?;
    tracing::debug!(note_id = %id.simple(), version = tombstone.version, "Tombstoned note");
    Ok(tombstone)
}

pub(crate) fn write_remote(conn: &Connection, remote: &NoteSnapshot) -> NoteResult<Note> {
    let incoming = remote.to_note();
    validate_note(&incoming)?;
    let local_version = read_note(conn, remote.id, true)?.map(|n| n.version);

    let saved = Note {
        version: match local_version {
            Some(v) => (v + 1).max(remote.version),
            None => remote.version,
        },
        ..incoming
    };

    upsert(conn, &saved)?;
    set_remote_version(conn, saved.id, remote.version)?;
    tracing::debug!(
        note_id = %saved.id.simple(),
        version = saved.version,
        remote_version = remote.version,
        "Applied remote note"
    );
    Ok(saved)
}

pub(crate) fn set_remote_version(conn: &Connection, id: Uuid, remote_version: i64) -> NoteResult<()> {
    conn.execute(
        "UPDATE notes SET remote_version = ? WHERE id = ?",
        params![remote_version, id.as_bytes().to_vec()],
    )?;
    Ok(())
}

pub(crate) fn read_remote_version(conn: &Connection, id: Uuid) -> NoteResult<Option<i64>> {
    let version: Option<Option<i64>> = conn
        .query_row(
            "SELECT remote_version FROM notes WHERE id = ?",
            [id.as_bytes().to_vec()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.flatten())
}

pub(crate) fn purge_note(conn: &Connection, id: Uuid) -> NoteResult<bool> {
    let removed = conn.execute("DELETE FROM notes WHERE id = ?", [id.as_bytes().to_vec()])?;
    if removed > 0 {
        tracing::debug!(note_id = %id.simple(), "Purged note");
    }
    Ok(removed > 0)
}

fn upsert(conn: &Connection, note: &Note) -> NoteResult<()> {
    conn.execute(
        r#"
        INSERT INTO notes (id, title, body, color, pinned, archived, created_at, updated_at, version, deleted_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            body = excluded.body,
            color = excluded.color,
            pinned = excluded.pinned,
            archived = excluded.archived,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            version = excluded.version,
            deleted_at = excluded.deleted_at
        "#,
        params![
            note.id.as_bytes().to_vec(),
            note.title,
            note.body,
            note.color,
            note.pinned,
            note.archived,
            note.created_at.timestamp_millis(),
            note.updated_at.timestamp_millis(),
            note.version,
            note.deleted_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(())
}

pub(crate) fn uuid_column(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let bytes: Vec<u8> = row.get(idx)?;
    Uuid::from_slice(&bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e)))
}

fn row_to_note(row: &Row) -> rusqlite::Result<Note> {
    let deleted_at: Option<i64> = row.get(9)?;
    Ok(Note {
        id: uuid_column(row, 0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        color: row.get(3)?,
        pinned: row.get(4)?,
        archived: row.get(5)?,
        created_at: millis_to_datetime(row.get(6)?),
        updated_at: millis_to_datetime(row.get(7)?),
        version: row.get(8)?,
        deleted_at: deleted_at.map(millis_to_datetime),
    })
}
