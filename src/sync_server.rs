//! Reference implementation of the remote notes API using Axum.
//!
//! Keeps notes in memory and enforces optimistic concurrency on the base
//! version sent by clients:
//! - POST /notes - create a note
//! - PUT /notes/:id - update a note
//! - DELETE /notes/:id - delete a note (tombstoned, unknown ids answer 404)
//! - GET /notes/:id - fetch a note
//! - GET /notes/status - health check
//!
//! A request whose base version differs from the stored one is answered with
//! `409 Conflict` and the stored note.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{NoteError, NoteResult};
use crate::models::{now_millis, NoteSnapshot};
use crate::sync_client::{StatusResponse, SyncRequest};
use crate::validation::validate_note_id;

/// In-memory note map served by the router
#[derive(Clone, Default)]
pub struct RemoteNotes {
    notes: Arc<Mutex<HashMap<Uuid, NoteSnapshot>>>,
}

impl RemoteNotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<NoteSnapshot> {
        self.notes.lock().ok()?.get(&id).cloned()
    }

    /// Store a note as-is, bypassing version checks (seeding and tests)
    pub fn insert(&self, note: NoteSnapshot) {
        if let Ok(mut notes) = self.notes.lock() {
            notes.insert(note.id, note);
        }
    }

    /// Number of live (not deleted) notes
    pub fn live_count(&self) -> usize {
        self.notes
            .lock()
            .map(|notes| notes.values().filter(|n| n.deleted_at.is_none()).count())
            .unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn parse_id(note_id: &str) -> Result<Uuid, Response> {
    validate_note_id(note_id).map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

// Route handlers

async fn create_note(
    State(state): State<RemoteNotes>,
    Json(request): Json<SyncRequest>,
) -> Response {
    let Ok(mut notes) = state.notes.lock() else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "state poisoned");
    };

    let id = request.note.id;
    if let Some(current) = notes.get(&id) {
        // A retried create whose first attempt already landed
        if same_content(current, &request.note) {
            return (StatusCode::OK, Json(current.clone())).into_response();
        }
        if request.version != Some(current.version) {
            tracing::debug!(note_id = %id.simple(), "Create conflicts with existing note");
            return (StatusCode::CONFLICT, Json(current.clone())).into_response();
        }
    }

    let version = notes.get(&id).map_or(1, |n| n.version + 1);
    let stored = NoteSnapshot {
        version,
        ..request.note
    };
    notes.insert(id, stored.clone());
    tracing::debug!(note_id = %id.simple(), version, "Created note");

    (StatusCode::CREATED, Json(stored)).into_response()
}

async fn update_note(
    State(state): State<RemoteNotes>,
    Path(note_id): Path<String>,
    Json(request): Json<SyncRequest>,
) -> Response {
    let id = match parse_id(&note_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if request.note.id != id {
        return error_response(StatusCode::BAD_REQUEST, "note id does not match path");
    }

    let Ok(mut notes) = state.notes.lock() else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "state poisoned");
    };
    let Some(current) = notes.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, "note not found");
    };
    if request.version != Some(current.version) {
        return (StatusCode::CONFLICT, Json(current.clone())).into_response();
    }

    let stored = NoteSnapshot {
        version: current.version + 1,
        ..request.note
    };
    notes.insert(id, stored.clone());
    tracing::debug!(note_id = %id.simple(), version = stored.version, "Updated note");

    (StatusCode::OK, Json(stored)).into_response()
}

async fn delete_note(
    State(state): State<RemoteNotes>,
    Path(note_id): Path<String>,
    Json(request): Json<SyncRequest>,
) -> Response {
    let id = match parse_id(&note_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let Ok(mut notes) = state.notes.lock() else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "state poisoned");
    };
    let current = match notes.get(&id) {
        Some(current) if current.deleted_at.is_none() => current.clone(),
        _ => return error_response(StatusCode::NOT_FOUND, "note not found"),
    };
    if request.version != Some(current.version) {
        return (StatusCode::CONFLICT, Json(current)).into_response();
    }

    let deleted_at = request
        .note
        .deleted_at
        .unwrap_or_else(|| now_millis().timestamp_millis());
    let tombstone = NoteSnapshot {
        version: current.version + 1,
        updated_at: current.updated_at.max(deleted_at),
        deleted_at: Some(deleted_at),
        ..current
    };
    notes.insert(id, tombstone.clone());
    tracing::debug!(note_id = %id.simple(), version = tombstone.version, "Deleted note");

    (StatusCode::OK, Json(tombstone)).into_response()
}

async fn get_note(State(state): State<RemoteNotes>, Path(note_id): Path<String>) -> Response {
    let id = match parse_id(&note_id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.get(id) {
        Some(note) => Json(note).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "note not found"),
    }
}

async fn status(State(state): State<RemoteNotes>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "ok".to_string(),
        notes: state.live_count(),
    })
}

fn same_content(a: &NoteSnapshot, b: &NoteSnapshot) -> bool {
    NoteSnapshot {
        version: 0,
        ..a.clone()
    } == NoteSnapshot {
        version: 0,
        ..b.clone()
    }
}

/// Create the notes API router
pub fn create_router(notes: RemoteNotes) -> Router {
    Router::new()
        .route("/notes", post(create_note))
        .route("/notes/status", get(status))
        .route(
            "/notes/:id",
            get(get_note).put(update_note).delete(delete_note),
        )
        .with_state(notes)
}

/// A running server
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<NoteResult<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting requests and wait for the server to finish
    pub async fn shutdown(mut self) -> NoteResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|e| NoteError::Other(format!("server task failed: {}", e)))?
    }
}

/// Start the server on `addr` (port 0 picks a free port)
pub async fn start_server(notes: RemoteNotes, addr: SocketAddr) -> NoteResult<ServerHandle> {
    let router = create_router(notes);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| NoteError::Network(e.to_string()))?;
    let addr = listener.local_addr()?;

    let (tx, rx) = oneshot::channel::<()>();
    tracing::info!(%addr, "Starting notes server");

    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
            .map_err(|e| NoteError::Network(e.to_string()))
    });

    Ok(ServerHandle {
        addr,
        shutdown: Some(tx),
        task,
    })
}
