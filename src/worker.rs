//! Lifecycle of the background update worker.
//!
//! ```text
//! Unregistered -> Registering -> Registered -> UpdateAvailable -> (confirm) -> Registered
//!                      |              |               ^
//!                      v              v               |
//!                    Error       OfflineReady --------+
//! ```
//!
//! Becoming registered starts a flush of the sync queue, and so does every
//! debounced reconnect while the worker is active. A failed registration leaves
//! the app usable offline with sync disabled until the registration is retried.
//! A staged update is never applied without an explicit confirmation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::connectivity::ReconnectHook;
use crate::error::{NoteError, NoteResult};
use crate::models::WorkerState;
use crate::sync_client::RemoteApi;
use crate::sync_queue::{FlushResult, SyncQueue};

/// Platform side of the worker: installation and update activation.
pub trait WorkerPlatform: Send + Sync + 'static {
    /// Install the worker
    fn register(&self) -> impl Future<Output = NoteResult<()>> + Send;

    /// Make the staged version the active one
    fn activate_update(&self) -> impl Future<Output = NoteResult<()>> + Send;

    /// Reload the app onto the active version
    fn reload(&self) -> impl Future<Output = NoteResult<()>> + Send;
}

/// User-facing notifications raised by the lifecycle
pub trait Notifier: Send + Sync {
    fn on_update_available(&self);
    fn on_offline_ready(&self);
}

/// Notifier that drops every notification
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn on_update_available(&self) {}
    fn on_offline_ready(&self) {}
}

pub struct WorkerLifecycle<R: RemoteApi, P: WorkerPlatform> {
    platform: Arc<P>,
    queue: SyncQueue<R>,
    notifier: Arc<dyn Notifier>,
    notifications_granted: Arc<AtomicBool>,
    sync_enabled: Arc<AtomicBool>,
    state: Arc<watch::Sender<WorkerState>>,
}

impl<R: RemoteApi, P: WorkerPlatform> Clone for WorkerLifecycle<R, P> {
    fn clone(&self) -> Self {
        Self {
            platform: self.platform.clone(),
            queue: self.queue.clone(),
            notifier: self.notifier.clone(),
            notifications_granted: self.notifications_granted.clone(),
            sync_enabled: self.sync_enabled.clone(),
            state: self.state.clone(),
        }
    }
}

impl<R: RemoteApi, P: WorkerPlatform> WorkerLifecycle<R, P> {
    pub fn new(
        platform: Arc<P>,
        queue: SyncQueue<R>,
        notifier: Arc<dyn Notifier>,
        notifications_granted: bool,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Unregistered);
        Self {
            platform,
            queue,
            notifier,
            notifications_granted: Arc::new(AtomicBool::new(notifications_granted)),
            sync_enabled: Arc::new(AtomicBool::new(false)),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Whether reconciliation may run (false until registered, and after a failed registration)
    pub fn is_sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    pub fn set_notifications_granted(&self, granted: bool) {
        self.notifications_granted.store(granted, Ordering::SeqCst);
    }

    /// Register the worker. On success the sync queue is flushed.
    pub async fn register(&self) -> NoteResult<()> {
        self.transition(
            |s| matches!(s, WorkerState::Unregistered | WorkerState::Error),
            WorkerState::Registering,
        )?;

        if let Err(e) = self.platform.register().await {
            self.sync_enabled.store(false, Ordering::SeqCst);
            self.state.send_replace(WorkerState::Error);
            tracing::warn!(error = %e, "Worker registration failed, sync disabled");
            return Err(NoteError::Registration(e.to_string()));
        }

        self.sync_enabled.store(true, Ordering::SeqCst);
        self.transition(|s| s == WorkerState::Registering, WorkerState::Registered)?;
        self.sync_now().await;
        Ok(())
    }

    /// Manual retry after a failed registration
    pub async fn retry_registration(&self) -> NoteResult<()> {
        if self.state() != WorkerState::Error {
            return Err(NoteError::InvalidTransition(format!(
                "retry_registration from {}",
                self.state().as_str()
            )));
        }
        tracing::info!("Retrying worker registration");
        self.register().await
    }

    /// A new version has been staged. It stays inactive until confirmed.
    pub fn update_staged(&self) -> NoteResult<()> {
        let from = self.transition(
            |s| {
                matches!(
                    s,
                    WorkerState::Registered | WorkerState::OfflineReady | WorkerState::UpdateAvailable
                )
            },
            WorkerState::UpdateAvailable,
        )?;
        if from != WorkerState::UpdateAvailable {
            self.notify(|n| n.on_update_available());
        }
        Ok(())
    }

    /// Activate the staged version and reload onto it. Back in `Registered`,
    /// the queue is flushed as after a first registration.
    pub async fn confirm_update(&self) -> NoteResult<()> {
        if self.state() != WorkerState::UpdateAvailable {
            return Err(NoteError::InvalidTransition(format!(
                "confirm_update from {}",
                self.state().as_str()
            )));
        }

        self.platform.activate_update().await?;
        self.platform.reload().await?;
        self.transition(|s| s == WorkerState::UpdateAvailable, WorkerState::Registered)?;
        self.sync_now().await;
        Ok(())
    }

    /// All assets are cached and the app works offline
    pub fn offline_ready(&self) -> NoteResult<()> {
        self.transition(|s| s == WorkerState::Registered, WorkerState::OfflineReady)?;
        self.notify(|n| n.on_offline_ready());
        Ok(())
    }

    /// Flush the sync queue if the worker is active and sync is enabled.
    ///
    /// Flush errors are logged, the queue keeps the entries for the next attempt.
    pub async fn sync_now(&self) -> Option<FlushResult> {
        if !self.state().is_active() || !self.is_sync_enabled() {
            tracing::debug!(state = self.state().as_str(), "Sync skipped, worker not active");
            return None;
        }

        match self.queue.flush().await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(error = %e, "Flush failed");
                None
            }
        }
    }

    /// Move to `to` if the current state satisfies `allowed`; returns the previous state.
    fn transition(
        &self,
        allowed: impl Fn(WorkerState) -> bool,
        to: WorkerState,
    ) -> NoteResult<WorkerState> {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if !allowed(*state) {
                return false;
            }
            from = Some(*state);
            let changed = *state != to;
            *state = to;
            changed
        });

        match from {
            Some(from) => {
                if from != to {
                    tracing::info!(from = from.as_str(), to = to.as_str(), "Worker state changed");
                }
                Ok(from)
            }
            None => Err(NoteError::InvalidTransition(format!(
                "{} -> {}",
                self.state().as_str(),
                to.as_str()
            ))),
        }
    }

    fn notify(&self, f: impl FnOnce(&dyn Notifier)) {
        if self.notifications_granted.load(Ordering::SeqCst) {
            f(self.notifier.as_ref());
        } else {
            tracing::debug!("Notification suppressed, permission not granted");
        }
    }
}

impl<R: RemoteApi, P: WorkerPlatform> ReconnectHook for WorkerLifecycle<R, P> {
    async fn on_reconnect(&self) {
        if let Some(result) = self.sync_now().await {
            tracing::info!(confirmed = result.confirmed, "Reconnect flush finished");
        }
    }
}
