//! Client for the remote notes API.
//!
//! The remote is the source of truth. Each mutation is sent with the last
//! version this device saw confirmed by the remote:
//! - `POST /notes` creates a note
//! - `PUT /notes/{id}` updates a note
//! - `DELETE /notes/{id}` deletes a note
//!
//! The remote answers with the authoritative note (carrying a server-assigned
//! version), or `409 Conflict` with its current state when the base version is
//! stale.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NoteError, NoteResult};
use crate::models::{NoteSnapshot, SyncOperation};

/// Body of every mutation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub note: NoteSnapshot,
    /// Last version confirmed by the remote (None for a note never synced)
    pub version: Option<i64>,
}

/// Status endpoint response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub notes: usize,
}

/// How the remote answered a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Applied; carries the authoritative note
    Accepted(NoteSnapshot),
    /// Rejected for a stale version; carries the current remote note
    Conflict(NoteSnapshot),
    /// Delete of a note the remote does not know about
    Gone,
}

/// The remote sync API as seen by the sync queue.
pub trait RemoteApi: Send + Sync + 'static {
    /// Send one mutation.
    fn send(
        &self,
        operation: SyncOperation,
        note: &NoteSnapshot,
        base_version: Option<i64>,
    ) -> impl Future<Output = NoteResult<RemoteOutcome>> + Send;

    /// Whether the remote is reachable right now
    fn ping(&self) -> impl Future<Output = bool> + Send;
}

/// HTTP implementation of [`RemoteApi`]
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> NoteResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NoteError::network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the remote copy of a note, if any
    pub async fn fetch(&self, id: Uuid) -> NoteResult<Option<NoteSnapshot>> {
        let response = self
            .client
            .get(format!("{}/notes/{}", self.base_url, id.simple()))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(NoteError::network(format!("Fetch failed with status {}", status))),
        }
    }

    /// Query the status endpoint
    pub async fn status(&self) -> NoteResult<StatusResponse> {
        let response = self
            .client
            .get(format!("{}/notes/status", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NoteError::network(format!(
                "Status check failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

impl RemoteApi for HttpRemote {
    async fn send(
        &self,
        operation: SyncOperation,
        note: &NoteSnapshot,
        base_version: Option<i64>,
    ) -> NoteResult<RemoteOutcome> {
        let body = SyncRequest {
            note: note.clone(),
            version: base_version,
        };
        let note_url = format!("{}/notes/{}", self.base_url, note.id.simple());

        let request = match operation {
            SyncOperation::Create => self.client.post(format!("{}/notes", self.base_url)),
            SyncOperation::Update => self.client.put(&note_url),
            SyncOperation::Delete => self.client.delete(&note_url),
        };

        let response = request.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                NoteError::Timeout(self.timeout.as_millis() as u64)
            } else {
                NoteError::network(e.to_string())
            }
        })?;

        let status = response.status();
        tracing::debug!(
            operation = operation.as_str(),
            note_id = %note.id.simple(),
            status = %status,
            "Remote answered"
        );

        match status {
            StatusCode::CONFLICT => Ok(RemoteOutcome::Conflict(
                response
                    .json()
                    .await
                    .map_err(|e| NoteError::network(format!("Failed to parse conflict: {}", e)))?,
            )),
            StatusCode::NOT_FOUND if operation == SyncOperation::Delete => Ok(RemoteOutcome::Gone),
            StatusCode::NOT_FOUND => Err(NoteError::not_found(format!(
                "remote note {}",
                note.id.simple()
            ))),
            status if status.is_success() => Ok(RemoteOutcome::Accepted(
                response
                    .json()
                    .await
                    .map_err(|e| NoteError::network(format!("Failed to parse note: {}", e)))?,
            )),
            status => Err(NoteError::network(format!(
                "{} failed with status {}",
                operation.as_str(),
                status
            ))),
        }
    }

    async fn ping(&self) -> bool {
        self.status().await.is_ok()
    }
}
