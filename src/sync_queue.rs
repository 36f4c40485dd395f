//! Durable queue of local mutations awaiting confirmation by the remote.
//!
//! Every local write appends an entry in the same transaction as the note
//! itself, so a note is never persisted without its pending sync entry. A
//! flush sends due entries in sequence order; an entry is only removed once the
//! remote acknowledged it.
//!
//! Per-note order is strict: if an entry of a note fails (or is not due yet),
//! the later entries of that note wait for the next flush. Other notes are
//! unaffected.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::conflicts::{record_conflict, resolve, Winner};
use crate::database::{lock, SharedDatabase};
use crate::error::{NoteError, NoteResult};
use crate::models::{
    millis_to_datetime, now_millis, EntryStatus, NoteSnapshot, SyncOperation, SyncQueueEntry,
};
use crate::store::{purge_note, read_remote_version, set_remote_version, uuid_column, write_remote};
use crate::sync_client::{RemoteApi, RemoteOutcome};

const ENTRY_COLUMNS: &str = "entry_id, seq, note_id, operation, payload, enqueued_at, attempts, \
                             last_error, status, last_attempt_at, next_attempt_at";

/// Summary of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushResult {
    /// Requests sent to the remote (a rebased re-send counts twice)
    pub sent: usize,
    /// Entries acknowledged and removed
    pub confirmed: usize,
    /// 409 answers received
    pub conflicts: usize,
    /// Entries rescheduled with backoff
    pub failed: usize,
    /// Entries moved to error in this flush (attempt ceiling or a non-retryable error)
    pub errored: usize,
    /// Entries not attempted (not due, errored, or behind an unfinished entry of their note)
    pub skipped: usize,
    /// The flush was dropped before it completed
    pub cancelled: bool,
}

type SharedOutcome = Option<Result<FlushResult, String>>;

/// The sync queue, shared by the UI write path and the background flush.
pub struct SyncQueue<R: RemoteApi> {
    db: SharedDatabase,
    remote: Arc<R>,
    backoff: Backoff,
    max_attempts: u32,
    request_timeout: Duration,
    /// Entries currently being sent; never coalesced into
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    /// Result channel of the running flush, if any
    running: Arc<Mutex<Option<watch::Receiver<SharedOutcome>>>>,
}

impl<R: RemoteApi> Clone for SyncQueue<R> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            remote: self.remote.clone(),
            backoff: self.backoff,
            max_attempts: self.max_attempts,
            request_timeout: self.request_timeout,
            in_flight: self.in_flight.clone(),
            running: self.running.clone(),
        }
    }
}

/// Clears the flush bookkeeping when a flush ends, including when its future
/// is dropped mid-send.
struct FlightGuard {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    running: Arc<Mutex<Option<watch::Receiver<SharedOutcome>>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.clear();
        }
        if let Ok(mut running) = self.running.lock() {
            *running = None;
        }
    }
}

impl<R: RemoteApi> SyncQueue<R> {
    pub fn new(db: SharedDatabase, remote: Arc<R>, config: &SyncConfig) -> Self {
        Self {
            db,
            remote,
            backoff: Backoff::from_config(config),
            max_attempts: config.max_attempts.max(1),
            request_timeout: config.request_timeout(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Append a mutation, coalescing into the note's pending tail entry when possible.
    ///
    /// Returns the id of the entry that now carries the payload.
    pub fn enqueue(&self, operation: SyncOperation, payload: &NoteSnapshot) -> NoteResult<Uuid> {
        let db = lock(&self.db)?;
        let tx = db.connection().unchecked_transaction()?;
        let entry_id = self.enqueue_in(&tx, operation, payload)?;
        tx.commit()?;
        Ok(entry_id)
    }

    /// [`SyncQueue::enqueue`] inside a transaction opened by the caller, so the
    /// note write and its entry commit together.
    pub(crate) fn enqueue_in(
        &self,
        conn: &Connection,
        operation: SyncOperation,
        payload: &NoteSnapshot,
    ) -> NoteResult<Uuid> {
        let tail: Option<(Uuid, String, String)> = conn
            .query_row(
                "SELECT entry_id, operation, status FROM sync_queue \
                 WHERE note_id = ? ORDER BY seq DESC LIMIT 1",
                [payload.id.as_bytes().to_vec()],
                |row| Ok((uuid_column(row, 0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let payload_json = serde_json::to_string(payload)?;

        if let Some((entry_id, tail_op, tail_status)) = tail {
            let in_flight = self
                .in_flight
                .lock()
                .map_err(|_| NoteError::Other("in-flight set poisoned".to_string()))?
                .contains(&entry_id);
            let coalesces = SyncOperation::from_str(&tail_op)
                .is_some_and(|tail_op| coalesces_into(tail_op, operation));

            if coalesces && !in_flight && tail_status == EntryStatus::Pending.as_str() {
                conn.execute(
                    "UPDATE sync_queue SET payload = ?, attempts = 0, last_error = NULL, \
                     last_attempt_at = NULL, next_attempt_at = NULL WHERE entry_id = ?",
                    params![payload_json, entry_id.as_bytes().to_vec()],
                )?;
                tracing::debug!(
                    note_id = %payload.id.simple(),
                    entry_id = %entry_id.simple(),
                    operation = operation.as_str(),
                    "Coalesced sync entry"
                );
                return Ok(entry_id);
            }
        }

        let entry_id = Uuid::now_v7();
        conn.execute(
            "INSERT INTO sync_queue (entry_id, note_id, operation, payload, enqueued_at, status) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                entry_id.as_bytes().to_vec(),
                payload.id.as_bytes().to_vec(),
                operation.as_str(),
                payload_json,
                now_millis().timestamp_millis(),
                EntryStatus::Pending.as_str(),
            ],
        )?;
        tracing::debug!(
            note_id = %payload.id.simple(),
            entry_id = %entry_id.simple(),
            operation = operation.as_str(),
            "Enqueued sync entry"
        );
        Ok(entry_id)
    }

    /// All entries in sequence order
    pub fn entries(&self) -> NoteResult<Vec<SyncQueueEntry>> {
        self.query_entries("", params![])
    }

    /// Entries of one note in sequence order
    pub fn entries_for_note(&self, note_id: Uuid) -> NoteResult<Vec<SyncQueueEntry>> {
        self.query_entries("WHERE note_id = ?", [note_id.as_bytes().to_vec()])
    }

    /// Entries that reached the attempt ceiling or failed for good, and need a manual retry
    pub fn errored_entries(&self) -> NoteResult<Vec<SyncQueueEntry>> {
        self.query_entries("WHERE status = ?", [EntryStatus::Error.as_str()])
    }

    /// Number of entries still waiting to be delivered
    pub fn pending_count(&self) -> NoteResult<usize> {
        let db = lock(&self.db)?;
        let count: i64 = db.connection().query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status = ?",
            [EntryStatus::Pending.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Whether anything written locally is not yet confirmed by the remote
    pub fn has_unsynced_changes(&self) -> NoteResult<bool> {
        let db = lock(&self.db)?;
        let exists: Option<i64> = db
            .connection()
            .query_row("SELECT 1 FROM sync_queue LIMIT 1", [], |row| row.get(0))
            .optional()?;
        Ok(exists.is_some())
    }

    /// Put errored entries back in the queue with a fresh attempt budget.
    ///
    /// Returns the number of entries reset.
    pub fn retry_errored(&self) -> NoteResult<usize> {
        let db = lock(&self.db)?;
        let reset = db.connection().execute(
            "UPDATE sync_queue SET status = ?, attempts = 0, next_attempt_at = NULL \
             WHERE status = ?",
            params![EntryStatus::Pending.as_str(), EntryStatus::Error.as_str()],
        )?;
        if reset > 0 {
            tracing::info!(entries = reset, "Reset errored sync entries");
        }
        Ok(reset)
    }

    /// Send due entries to the remote.
    ///
    /// A call while another flush is running waits for that flush and returns
    /// its result without sending anything itself.
    pub async fn flush(&self) -> NoteResult<FlushResult> {
        let (sender, joined) = {
            let mut running = self
                .running
                .lock()
                .map_err(|_| NoteError::Other("flush state poisoned".to_string()))?;
            match running.as_ref() {
                Some(receiver) => (None, Some(receiver.clone())),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    *running = Some(receiver);
                    (Some(sender), None)
                }
            }
        };

        if let Some(receiver) = joined {
            tracing::debug!("Flush already running, waiting for it");
            return wait_for_running(receiver).await;
        }
        let Some(sender) = sender else {
            return Err(NoteError::Other("flush state lost".to_string()));
        };

        let guard = FlightGuard {
            in_flight: self.in_flight.clone(),
            running: self.running.clone(),
        };
        let outcome = self.run_flush().await;
        drop(guard);

        let shared = match &outcome {
            Ok(result) => Ok(result.clone()),
            Err(e) => Err(e.to_string()),
        };
        let _ = sender.send(Some(shared));
        outcome
    }

    async fn run_flush(&self) -> NoteResult<FlushResult> {
        let mut result = FlushResult::default();
        let entries = self.entries()?;
        if entries.is_empty() {
            return Ok(result);
        }

        let now = now_millis();
        let mut blocked: HashSet<Uuid> = HashSet::new();

        for entry in entries {
            if blocked.contains(&entry.note_id) || !entry.is_due(now) {
                blocked.insert(entry.note_id);
                result.skipped += 1;
                continue;
            }

            // Re-read under the lock: the payload may have been coalesced since
            let Some(entry) = self.claim(entry.entry_id)? else {
                continue;
            };

            if !self.deliver(&entry, &mut result).await? {
                blocked.insert(entry.note_id);
            }
            self.release(entry.entry_id);
        }

        tracing::info!(
            sent = result.sent,
            confirmed = result.confirmed,
            conflicts = result.conflicts,
            failed = result.failed,
            errored = result.errored,
            skipped = result.skipped,
            "Flush complete"
        );
        Ok(result)
    }

    /// Send one entry. Returns true once the entry is settled and removed.
    async fn deliver(&self, entry: &SyncQueueEntry, result: &mut FlushResult) -> NoteResult<bool> {
        let mut rebased = false;

        loop {
            let base_version = {
                let db = lock(&self.db)?;
                read_remote_version(db.connection(), entry.note_id)?
            };

            result.sent += 1;
            let sent = tokio::time::timeout(
                self.request_timeout,
                self.remote.send(entry.operation, &entry.payload, base_version),
            )
            .await
            .unwrap_or_else(|_| Err(NoteError::Timeout(self.request_timeout.as_millis() as u64)));

            match sent {
                Ok(RemoteOutcome::Accepted(remote)) => {
                    let settled = self.confirm(entry, Some(&remote));
                    let done = self.settle(entry, settled, result)?;
                    if done {
                        result.confirmed += 1;
                    }
                    return Ok(done);
                }
                Ok(RemoteOutcome::Gone) => {
                    let settled = self.confirm(entry, None);
                    let done = self.settle(entry, settled, result)?;
                    if done {
                        result.confirmed += 1;
                    }
                    return Ok(done);
                }
                Ok(RemoteOutcome::Conflict(remote)) => {
                    result.conflicts += 1;
                    if rebased {
                        let err = NoteError::Conflict(format!(
                            "remote rejected rebased version {}",
                            remote.version
                        ));
                        self.record_failure(entry, &err, result)?;
                        return Ok(false);
                    }

                    match resolve(&entry.payload, &remote) {
                        Winner::Remote => {
                            let settled = self.accept_remote(entry, &remote);
                            return self.settle(entry, settled, result);
                        }
                        Winner::Local => {
                            if let Err(err) = self.rebase(entry, &remote) {
                                self.record_failure(entry, &err, result)?;
                                return Ok(false);
                            }
                            rebased = true;
                        }
                    }
                }
                Err(err) => {
                    self.record_failure(entry, &err, result)?;
                    return Ok(false);
                }
            }
        }
    }

    /// Apply the local side of an answer. A failure there (an invalid remote
    /// note, a full disk) is charged to the entry so other notes keep syncing.
    fn settle(
        &self,
        entry: &SyncQueueEntry,
        settled: NoteResult<()>,
        result: &mut FlushResult,
    ) -> NoteResult<bool> {
        match settled {
            Ok(()) => Ok(true),
            Err(err) => {
                tracing::warn!(
                    note_id = %entry.note_id.simple(),
                    error = %err,
                    "Could not apply remote answer locally"
                );
                self.record_failure(entry, &err, result)?;
                Ok(false)
            }
        }
    }

    /// Load an entry and mark it in flight in one step, so an enqueue cannot
    /// coalesce into it while it is being sent.
    fn claim(&self, entry_id: Uuid) -> NoteResult<Option<SyncQueueEntry>> {
        let db = lock(&self.db)?;
        let entry = db
            .connection()
            .query_row(
                &format!("SELECT {} FROM sync_queue WHERE entry_id = ?", ENTRY_COLUMNS),
                [entry_id.as_bytes().to_vec()],
                row_to_entry,
            )
            .optional()?;

        if entry.is_some() {
            self.in_flight
                .lock()
                .map_err(|_| NoteError::Other("in-flight set poisoned".to_string()))?
                .insert(entry_id);
        }
        Ok(entry)
    }

    fn release(&self, entry_id: Uuid) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&entry_id);
        }
    }

    /// Remove an acknowledged entry and record the confirmed version.
    ///
    /// A confirmed delete purges the tombstone unless later mutations of the
    /// note are still queued.
    fn confirm(&self, entry: &SyncQueueEntry, remote: Option<&NoteSnapshot>) -> NoteResult<()> {
        let db = lock(&self.db)?;
        let tx = db.connection().unchecked_transaction()?;
        remove_entry(&tx, entry.entry_id)?;

        let has_later = has_entries_for_note(&tx, entry.note_id)?;
        if entry.operation == SyncOperation::Delete && !has_later {
            purge_note(&tx, entry.note_id)?;
        } else if let Some(remote) = remote {
            set_remote_version(&tx, entry.note_id, remote.version)?;
        }
        tx.commit()?;

        tracing::info!(
            note_id = %entry.note_id.simple(),
            operation = entry.operation.as_str(),
            remote_version = ?remote.map(|r| r.version),
            "Sync entry confirmed"
        );
        Ok(())
    }

    /// The remote copy won: drop the entry, and every later entry of the note
    /// that is older than the remote copy. The newest losing local copy is
    /// kept in the conflict log.
    ///
    /// The remote note is applied locally unless a newer local edit is still
    /// queued; that edit goes out on top of the remote version instead.
    fn accept_remote(&self, entry: &SyncQueueEntry, remote: &NoteSnapshot) -> NoteResult<()> {
        let db = lock(&self.db)?;
        let tx = db.connection().unchecked_transaction()?;
        remove_entry(&tx, entry.entry_id)?;

        let mut loser = &entry.payload;
        let later = later_entries(&tx, entry.note_id)?;
        let mut pending = 0;
        for queued in &later {
            if resolve(&queued.payload, remote) == Winner::Remote {
                remove_entry(&tx, queued.entry_id)?;
                loser = &queued.payload;
                tracing::debug!(
                    note_id = %entry.note_id.simple(),
                    entry_id = %queued.entry_id.simple(),
                    operation = queued.operation.as_str(),
                    "Dropped sync entry older than remote copy"
                );
            } else {
                pending += 1;
            }
        }
        record_conflict(&tx, loser, remote, Winner::Remote)?;

        if pending > 0 {
            set_remote_version(&tx, entry.note_id, remote.version)?;
        } else {
            write_remote(&tx, remote)?;
        }
        tx.commit()?;

        tracing::info!(
            note_id = %entry.note_id.simple(),
            remote_version = remote.version,
            dropped = later.len() - pending,
            pending,
            "Conflict resolved in favour of remote"
        );
        Ok(())
    }

    /// The local copy won: re-send it on top of the remote version.
    fn rebase(&self, entry: &SyncQueueEntry, remote: &NoteSnapshot) -> NoteResult<()> {
        let db = lock(&self.db)?;
        let tx = db.connection().unchecked_transaction()?;
        record_conflict(&tx, &entry.payload, remote, Winner::Local)?;
        set_remote_version(&tx, entry.note_id, remote.version)?;
        tx.commit()?;

        tracing::info!(
            note_id = %entry.note_id.simple(),
            remote_version = remote.version,
            "Conflict resolved in favour of local copy, re-sending"
        );
        Ok(())
    }

    fn record_failure(
        &self,
        entry: &SyncQueueEntry,
        err: &NoteError,
        result: &mut FlushResult,
    ) -> NoteResult<()> {
        let attempts = entry.attempts + 1;
        let now = now_millis();

        // Retrying cannot fix a rejected or unappliable entry
        let (status, next_attempt_at) = if attempts >= self.max_attempts || !err.is_transient() {
            result.errored += 1;
            tracing::warn!(
                note_id = %entry.note_id.simple(),
                entry_id = %entry.entry_id.simple(),
                attempts,
                transient = err.is_transient(),
                error = %err,
                "Sync entry needs a manual retry"
            );
            (EntryStatus::Error, None)
        } else {
            result.failed += 1;
            let delay = self.backoff.delay(attempts);
            let next = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
            tracing::info!(
                note_id = %entry.note_id.simple(),
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Sync attempt failed, rescheduled"
            );
            (EntryStatus::Pending, Some(next.timestamp_millis()))
        };

        let db = lock(&self.db)?;
        db.connection().execute(
            "UPDATE sync_queue SET attempts = ?, last_error = ?, status = ?, \
             last_attempt_at = ?, next_attempt_at = ? WHERE entry_id = ?",
            params![
                attempts,
                err.to_string(),
                status.as_str(),
                now.timestamp_millis(),
                next_attempt_at,
                entry.entry_id.as_bytes().to_vec(),
            ],
        )?;
        Ok(())
    }

    fn query_entries<P: rusqlite::Params>(
        &self,
        condition: &str,
        params: P,
    ) -> NoteResult<Vec<SyncQueueEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_queue {} ORDER BY seq ASC",
            ENTRY_COLUMNS, condition
        );
        let db = lock(&self.db)?;
        let mut stmt = db.connection().prepare(&sql)?;
        let entries = stmt
            .query_map(params, row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// Await the result of a flush started by another caller.
async fn wait_for_running(
    mut receiver: watch::Receiver<SharedOutcome>,
) -> NoteResult<FlushResult> {
    let cancelled = FlushResult {
        cancelled: true,
        ..Default::default()
    };
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => match outcome.as_ref() {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(message)) => Err(NoteError::Other(message.clone())),
            None => Ok(cancelled),
        },
        // The running flush was dropped before it finished
        Err(_) => Ok(cancelled),
    }
}

/// Whether a new mutation may replace the payload of a pending tail entry.
///
/// Updates fold into a pending create or update (a create keeps its kind, the
/// remote has not seen the note yet). Deletes only fold into deletes.
fn coalesces_into(tail: SyncOperation, new: SyncOperation) -> bool {
    matches!(
        (tail, new),
        (SyncOperation::Create, SyncOperation::Create)
            | (SyncOperation::Create, SyncOperation::Update)
            | (SyncOperation::Update, SyncOperation::Update)
            | (SyncOperation::Delete, SyncOperation::Delete)
    )
}

fn remove_entry(conn: &Connection, entry_id: Uuid) -> NoteResult<()> {
    conn.execute(
        "DELETE FROM sync_queue WHERE entry_id = ?",
        [entry_id.as_bytes().to_vec()],
    )?;
    Ok(())
}

fn has_entries_for_note(conn: &Connection, note_id: Uuid) -> NoteResult<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sync_queue WHERE note_id = ? LIMIT 1",
            [note_id.as_bytes().to_vec()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

fn later_entries(conn: &Connection, note_id: Uuid) -> NoteResult<Vec<SyncQueueEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sync_queue WHERE note_id = ? ORDER BY seq ASC",
        ENTRY_COLUMNS
    ))?;
    let entries = stmt
        .query_map([note_id.as_bytes().to_vec()], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(NoteError::database_op(message)),
    )
}

fn row_to_entry(row: &Row) -> rusqlite::Result<SyncQueueEntry> {
    let operation: String = row.get(3)?;
    let payload: String = row.get(4)?;
    let status: String = row.get(8)?;
    let last_attempt_at: Option<i64> = row.get(9)?;
    let next_attempt_at: Option<i64> = row.get(10)?;

    Ok(SyncQueueEntry {
        entry_id: uuid_column(row, 0)?,
        seq: row.get(1)?,
        note_id: uuid_column(row, 2)?,
        operation: SyncOperation::from_str(&operation)
            .ok_or_else(|| conversion_error(3, format!("unknown operation '{}'", operation)))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        enqueued_at: millis_to_datetime(row.get(5)?),
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        status: EntryStatus::from_str(&status)
            .ok_or_else(|| conversion_error(8, format!("unknown status '{}'", status)))?,
        last_attempt_at: last_attempt_at.map(millis_to_datetime),
        next_attempt_at: next_attempt_at.map(millis_to_datetime),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conflicts::ConflictLog;
    use crate::database::Database;
    use crate::models::Note;
    use crate::store::LocalStore;
    use std::collections::VecDeque;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Scripted answer of the test remote
    #[derive(Debug, Clone)]
    pub(crate) enum Script {
        Accept,
        Conflict(NoteSnapshot),
        Gone,
        Fail,
        /// Refuse for good (an unknown note)
        Reject,
        /// Wait for `release` before accepting
        Hold,
        /// Never answer
        Hang,
    }

    /// In-memory remote that answers from a script (accepting once the script is empty)
    #[derive(Default)]
    pub(crate) struct ScriptedRemote {
        script: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<(SyncOperation, NoteSnapshot, Option<i64>)>>,
        pub(crate) started: Notify,
        pub(crate) release: Notify,
    }

    impl ScriptedRemote {
        pub(crate) fn push(&self, step: Script) {
            self.script.lock().unwrap().push_back(step);
        }

        pub(crate) fn calls(&self) -> Vec<(SyncOperation, NoteSnapshot, Option<i64>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RemoteApi for ScriptedRemote {
        async fn send(
            &self,
            operation: SyncOperation,
            note: &NoteSnapshot,
            base_version: Option<i64>,
        ) -> NoteResult<RemoteOutcome> {
            let step = {
                self.calls
                    .lock()
                    .unwrap()
                    .push((operation, note.clone(), base_version));
                self.script.lock().unwrap().pop_front().unwrap_or(Script::Accept)
            };
            self.started.notify_one();

            let accepted = NoteSnapshot {
                version: base_version.unwrap_or(0) + 1,
                ..note.clone()
            };
            match step {
                Script::Accept => Ok(RemoteOutcome::Accepted(accepted)),
                Script::Conflict(remote) => Ok(RemoteOutcome::Conflict(remote)),
                Script::Gone => Ok(RemoteOutcome::Gone),
                Script::Fail => Err(NoteError::network("connection reset")),
                Script::Reject => Err(NoteError::not_found("remote note")),
                Script::Hold => {
                    self.release.notified().await;
                    Ok(RemoteOutcome::Accepted(accepted))
                }
                Script::Hang => std::future::pending().await,
            }
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    fn setup_with(
        db: SharedDatabase,
        config: &SyncConfig,
    ) -> (LocalStore, SyncQueue<ScriptedRemote>, Arc<ScriptedRemote>) {
        let remote = Arc::new(ScriptedRemote::default());
        let queue = SyncQueue::new(db.clone(), remote.clone(), config);
        (LocalStore::new(db), queue, remote)
    }

    fn setup() -> (LocalStore, SyncQueue<ScriptedRemote>, Arc<ScriptedRemote>) {
        setup_with(
            Database::new_in_memory().unwrap().into_shared(),
            &SyncConfig::default(),
        )
    }

    /// Config whose retries are due immediately
    fn no_backoff(max_attempts: u32) -> SyncConfig {
        SyncConfig {
            max_attempts,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
            ..Default::default()
        }
    }

    fn create(store: &LocalStore, queue: &SyncQueue<ScriptedRemote>, title: &str) -> Note {
        let note = store.put(Note::new(title, "")).unwrap();
        queue.enqueue(SyncOperation::Create, &note.snapshot()).unwrap();
        note
    }

    #[test]
    fn test_enqueue_coalesces_pending_tail() {
        let (store, queue, _) = setup();
        let note = create(&store, &queue, "v1");

        let mut edited = note.clone();
        edited.title = "v2".to_string();
        let edited = store.put(edited).unwrap();
        queue.enqueue(SyncOperation::Update, &edited.snapshot()).unwrap();

        let entries = queue.entries_for_note(note.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, SyncOperation::Create);
        assert_eq!(entries[0].payload.title, "v2");

        let ack = store.delete(note.id).unwrap();
        let tombstone = store.get_including_deleted(ack.id).unwrap().unwrap();
        queue.enqueue(SyncOperation::Delete, &tombstone.snapshot()).unwrap();

        let operations: Vec<SyncOperation> = queue
            .entries_for_note(note.id)
            .unwrap()
            .into_iter()
            .map(|e| e.operation)
            .collect();
        assert_eq!(operations, vec![SyncOperation::Create, SyncOperation::Delete]);
        assert_eq!(queue.pending_count().unwrap(), 2);
        assert!(queue.has_unsynced_changes().unwrap());
    }

    #[tokio::test]
    async fn test_flush_confirms_and_removes() {
        let (store, queue, remote) = setup();
        let a = create(&store, &queue, "a");
        let b = create(&store, &queue, "b");

        let result = queue.flush().await.unwrap();
        assert_eq!(result.sent, 2);
        assert_eq!(result.confirmed, 2);
        assert!(!result.cancelled);

        assert!(queue.entries().unwrap().is_empty());
        assert!(!queue.has_unsynced_changes().unwrap());
        assert_eq!(store.remote_version(a.id).unwrap(), Some(1));
        assert_eq!(store.remote_version(b.id).unwrap(), Some(1));

        let calls = remote.calls();
        assert_eq!(calls[0].1.id, a.id);
        assert_eq!(calls[0].2, None);
        assert_eq!(calls[1].1.id, b.id);

        // Nothing left to send
        let result = queue.flush().await.unwrap();
        assert_eq!(result, FlushResult::default());
    }

    #[tokio::test]
    async fn test_update_uses_confirmed_base_version() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "a");
        queue.flush().await.unwrap();

        let edited = store
            .put(Note {
                title: "b".to_string(),
                ..note
            })
            .unwrap();
        queue.enqueue(SyncOperation::Update, &edited.snapshot()).unwrap();
        queue.flush().await.unwrap();

        let calls = remote.calls();
        assert_eq!(calls[1].0, SyncOperation::Update);
        assert_eq!(calls[1].2, Some(1));
        assert_eq!(store.remote_version(edited.id).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_entry_blocks_later_entries_of_its_note() {
        let (store, queue, remote) = setup();
        let a = create(&store, &queue, "a");
        let a = store.put(Note { title: "a2".into(), ..a }).unwrap();
        store.delete(a.id).unwrap();
        let tombstone = store.get_including_deleted(a.id).unwrap().unwrap();
        queue.enqueue(SyncOperation::Delete, &tombstone.snapshot()).unwrap();
        let b = create(&store, &queue, "b");

        remote.push(Script::Fail);
        let result = queue.flush().await.unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.confirmed, 1);

        let sent: Vec<Uuid> = remote.calls().into_iter().map(|c| c.1.id).collect();
        assert_eq!(sent, vec![a.id, b.id]);

        let entries = queue.entries_for_note(a.id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].attempts, 1);
        assert_eq!(entries[1].attempts, 0);
        // The tombstone survives until the delete is confirmed
        assert!(store.get_including_deleted(a.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_first_retry_scheduled_within_jitter_window() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "a");

        remote.push(Script::Fail);
        queue.flush().await.unwrap();

        let entry = &queue.entries_for_note(note.id).unwrap()[0];
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.status, EntryStatus::Pending);
        assert!(entry.last_error.as_deref().unwrap().contains("connection reset"));

        let last = entry.last_attempt_at.unwrap();
        let next = entry.next_attempt_at.unwrap();
        let delay = (next - last).num_milliseconds();
        assert!((1000..1200).contains(&delay), "delay {} ms", delay);

        // Not due yet, so the next flush leaves it alone
        let result = queue.flush().await.unwrap();
        assert_eq!(result.sent, 0);
        assert_eq!(result.skipped, 1);
    }

    #[tokio::test]
    async fn test_attempt_ceiling_marks_error_without_removal() {
        let (store, queue, remote) =
            setup_with(Database::new_in_memory().unwrap().into_shared(), &no_backoff(2));
        let note = create(&store, &queue, "a");

        remote.push(Script::Fail);
        remote.push(Script::Fail);
        assert_eq!(queue.flush().await.unwrap().failed, 1);
        let result = queue.flush().await.unwrap();
        assert_eq!(result.errored, 1);

        let errored = queue.errored_entries().unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].note_id, note.id);
        assert_eq!(errored[0].attempts, 2);
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert!(queue.has_unsynced_changes().unwrap());

        // Errored entries are not retried automatically
        let result = queue.flush().await.unwrap();
        assert_eq!(result.sent, 0);
        assert_eq!(result.skipped, 1);

        assert_eq!(queue.retry_errored().unwrap(), 1);
        let result = queue.flush().await.unwrap();
        assert_eq!(result.confirmed, 1);
        assert!(queue.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_delete_purges_tombstone() {
        let (store, queue, remote) = setup();
        let kept = create(&store, &queue, "kept");
        let gone = create(&store, &queue, "gone");
        queue.flush().await.unwrap();

        for note in [&kept, &gone] {
            store.delete(note.id).unwrap();
            let tombstone = store.get_including_deleted(note.id).unwrap().unwrap();
            queue.enqueue(SyncOperation::Delete, &tombstone.snapshot()).unwrap();
        }

        remote.push(Script::Accept);
        remote.push(Script::Gone);
        let result = queue.flush().await.unwrap();
        assert_eq!(result.confirmed, 2);

        assert!(store.get_including_deleted(kept.id).unwrap().is_none());
        assert!(store.get_including_deleted(gone.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_remote_wins() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "local");
        let local = store.get(note.id).unwrap();

        let mut newer = local.snapshot();
        newer.title = "remote".to_string();
        newer.version = local.version + 2;
        newer.updated_at += 5_000;
        remote.push(Script::Conflict(newer.clone()));

        let result = queue.flush().await.unwrap();
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.sent, 1);
        assert!(queue.entries().unwrap().is_empty());

        let stored = store.get(note.id).unwrap();
        assert_eq!(stored.title, "remote");
        assert_eq!(stored.version, newer.version);
        assert_eq!(store.remote_version(note.id).unwrap(), Some(newer.version));

        let log = ConflictLog::new(queue.db.clone());
        let records = log.list(false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].winner, Winner::Remote);
        assert_eq!(records[0].loser().title, "local");
    }

    #[tokio::test]
    async fn test_conflict_local_wins_and_resends() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "local");

        let mut older = note.snapshot();
        older.title = "remote".to_string();
        older.version = 4;
        older.updated_at -= 5_000;
        remote.push(Script::Conflict(older));
        remote.push(Script::Accept);

        let result = queue.flush().await.unwrap();
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.sent, 2);
        assert_eq!(result.confirmed, 1);

        let calls = remote.calls();
        assert_eq!(calls[1].2, Some(4));
        assert_eq!(store.get(note.id).unwrap().title, "local");
        assert_eq!(store.remote_version(note.id).unwrap(), Some(5));

        let log = ConflictLog::new(queue.db.clone());
        assert_eq!(log.list(false).unwrap()[0].winner, Winner::Local);
    }

    #[tokio::test]
    async fn test_second_conflict_counts_as_failure() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "local");

        let mut older = note.snapshot();
        older.updated_at -= 5_000;
        older.version = 4;
        remote.push(Script::Conflict(older.clone()));
        remote.push(Script::Conflict(older));

        let result = queue.flush().await.unwrap();
        assert_eq!(result.conflicts, 2);
        assert_eq!(result.failed, 1);

        let entry = &queue.entries_for_note(note.id).unwrap()[0];
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_error.as_deref().unwrap().starts_with("Conflict"));
    }

    #[tokio::test]
    async fn test_rejected_entry_errors_without_retries() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "a");

        remote.push(Script::Reject);
        let result = queue.flush().await.unwrap();
        assert_eq!(result.failed, 0);
        assert_eq!(result.errored, 1);

        let errored = queue.errored_entries().unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].note_id, note.id);
        assert_eq!(errored[0].attempts, 1);
        assert_eq!(errored[0].next_attempt_at, None);

        queue.retry_errored().unwrap();
        assert_eq!(queue.flush().await.unwrap().confirmed, 1);
    }

    #[tokio::test]
    async fn test_unappliable_remote_copy_does_not_stall_other_notes() {
        let (store, queue, remote) = setup();
        let a = create(&store, &queue, "a");
        let b = create(&store, &queue, "b");

        let mut invalid = a.snapshot();
        invalid.color = "Red".to_string();
        invalid.version = 3;
        invalid.updated_at += 5_000;
        remote.push(Script::Conflict(invalid));

        let result = queue.flush().await.unwrap();
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.errored, 1);
        assert_eq!(result.confirmed, 1);

        let sent: Vec<Uuid> = remote.calls().into_iter().map(|c| c.1.id).collect();
        assert_eq!(sent, vec![a.id, b.id]);

        let errored = queue.errored_entries().unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].note_id, a.id);
        assert!(errored[0].last_error.as_deref().unwrap().contains("color"));
        assert_eq!(store.get(a.id).unwrap().color, a.color);
        assert!(ConflictLog::new(queue.db.clone()).list(true).unwrap().is_empty());

        // Surfaced, not resent on every flush
        let result = queue.flush().await.unwrap();
        assert_eq!(result.sent, 0);
        assert_eq!(result.skipped, 1);
    }

    #[tokio::test]
    async fn test_remote_win_drops_older_queued_entries() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "local");
        store.delete(note.id).unwrap();
        let tombstone = store.get_including_deleted(note.id).unwrap().unwrap().snapshot();
        queue.enqueue(SyncOperation::Delete, &tombstone).unwrap();

        let mut newer = note.snapshot();
        newer.title = "remote".to_string();
        newer.version = 5;
        newer.updated_at = tombstone.updated_at + 60_000;
        remote.push(Script::Conflict(newer));

        let result = queue.flush().await.unwrap();
        assert_eq!(result.conflicts, 1);
        assert_eq!(remote.calls().len(), 1);
        assert!(queue.entries().unwrap().is_empty());

        let stored = store.get(note.id).unwrap();
        assert_eq!(stored.title, "remote");
        assert_eq!(stored.version, 5);
        assert_eq!(store.remote_version(note.id).unwrap(), Some(5));

        let records = ConflictLog::new(queue.db.clone()).list(false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].winner, Winner::Remote);
        assert!(records[0].loser().deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_newer_queued_entry_survives_remote_win() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "local");
        store.delete(note.id).unwrap();
        let mut tombstone = store.get_including_deleted(note.id).unwrap().unwrap().snapshot();
        tombstone.updated_at = note.snapshot().updated_at + 10_000;
        queue.enqueue(SyncOperation::Delete, &tombstone).unwrap();

        let mut between = note.snapshot();
        between.title = "remote".to_string();
        between.version = 3;
        between.updated_at += 5_000;
        remote.push(Script::Conflict(between));

        let result = queue.flush().await.unwrap();
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.confirmed, 1);

        let calls = remote.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, SyncOperation::Delete);
        assert_eq!(calls[1].2, Some(3));
        assert!(queue.entries().unwrap().is_empty());
        assert!(store.get_including_deleted(note.id).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_counts_as_failed_attempt() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "slow");

        remote.push(Script::Hang);
        let result = queue.flush().await.unwrap();
        assert_eq!(result.failed, 1);

        let entry = &queue.entries_for_note(note.id).unwrap()[0];
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("Timed out after 10000 ms"));
    }

    #[tokio::test]
    async fn test_concurrent_flush_shares_result() {
        let (store, queue, remote) = setup();
        create(&store, &queue, "a");
        remote.push(Script::Hold);

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        remote.started.notified().await;

        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        remote.release.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.confirmed, 1);
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_during_flush_is_not_coalesced_into_in_flight_entry() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "v1");
        remote.push(Script::Hold);

        let flush = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        remote.started.notified().await;

        let edited = store
            .put(Note {
                title: "v2".to_string(),
                ..note.clone()
            })
            .unwrap();
        queue.enqueue(SyncOperation::Update, &edited.snapshot()).unwrap();
        remote.release.notify_one();
        flush.await.unwrap().unwrap();

        let entries = queue.entries_for_note(note.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, SyncOperation::Update);
        assert_eq!(entries[0].payload.title, "v2");
        assert_eq!(remote.calls()[0].1.title, "v1");
    }

    #[tokio::test]
    async fn test_cancelled_flush_leaves_entries_pending() {
        let (store, queue, remote) = setup();
        let note = create(&store, &queue, "a");
        remote.push(Script::Hang);

        let flush = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        remote.started.notified().await;
        flush.abort();
        assert!(flush.await.unwrap_err().is_cancelled());

        let entry = &queue.entries_for_note(note.id).unwrap()[0];
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.status, EntryStatus::Pending);

        // A fresh flush runs instead of waiting on the dropped one
        let result = queue.flush().await.unwrap();
        assert_eq!(result.confirmed, 1);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notes.db");

        let note_id = {
            let db = Database::new(&path).unwrap().into_shared();
            let (store, queue, _) = setup_with(db, &SyncConfig::default());
            create(&store, &queue, "durable").id
        };

        let db = Database::new(&path).unwrap().into_shared();
        let (store, queue, _) = setup_with(db, &SyncConfig::default());
        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].note_id, note_id);
        assert_eq!(entries[0].payload.title, "durable");
        assert_eq!(store.get(note_id).unwrap().title, "durable");
    }
}
