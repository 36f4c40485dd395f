//! Online/offline tracking.
//!
//! The platform reports connectivity through [`ConnectivityMonitor::report`];
//! subscribers only see actual transitions. The reconnect watcher turns a
//! transition to online that holds for the debounce window into exactly one
//! call of its hook, so a flapping network does not trigger a flush per flap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::models::{now_millis, ConnectivityState};
use crate::sync_client::RemoteApi;

/// Called once connectivity has been back for the debounce window.
pub trait ReconnectHook: Send + Sync + 'static {
    fn on_reconnect(&self) -> impl Future<Output = ()> + Send;
}

/// Owner of the connectivity state
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<ConnectivityState>>,
    debounce: Duration,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, debounce: Duration) -> Self {
        let (state, _) = watch::channel(ConnectivityState {
            is_online: initially_online,
            last_changed_at: now_millis(),
        });
        Self {
            state: Arc::new(state),
            debounce,
        }
    }

    pub fn from_config(config: &SyncConfig, initially_online: bool) -> Self {
        Self::new(initially_online, config.debounce())
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Record the platform's view of connectivity.
    ///
    /// Returns true if this was a transition.
    pub fn report(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_online == online {
                return false;
            }
            *state = ConnectivityState {
                is_online: online,
                last_changed_at: now_millis(),
            };
            true
        });

        if changed {
            tracing::info!(online, "Connectivity changed");
        }
        changed
    }

    /// Receive every transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Spawn the task that calls `hook` once per debounced transition to online.
    ///
    /// The state at spawn time never triggers the hook, only later transitions.
    pub fn spawn_reconnect_watcher<H: ReconnectHook>(&self, hook: Arc<H>) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        receiver.borrow_and_update();
        let debounce = self.debounce;

        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                if !receiver.borrow_and_update().is_online {
                    continue;
                }

                // Online: wait for the state to hold for the whole window
                loop {
                    match tokio::time::timeout(debounce, receiver.changed()).await {
                        Err(_) => {
                            tracing::debug!("Connectivity stable, running reconnect hook");
                            hook.on_reconnect().await;
                            break;
                        }
                        Ok(Err(_)) => return,
                        Ok(Ok(())) => {
                            if !receiver.borrow_and_update().is_online {
                                break;
                            }
                            // Went offline and back between polls: restart the window
                        }
                    }
                }
            }
        })
    }

    /// Spawn a task that pings `remote` every `interval` and reports the result.
    ///
    /// For platforms without a native connectivity signal.
    pub fn spawn_probe<R: RemoteApi>(&self, remote: Arc<R>, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = remote.ping().await;
                monitor.report(online);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NoteError, NoteResult};
    use crate::models::{NoteSnapshot, SyncOperation};
    use crate::sync_client::RemoteOutcome;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[derive(Default)]
    struct CountingHook {
        calls: AtomicUsize,
    }

    impl ReconnectHook for CountingHook {
        async fn on_reconnect(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SwitchRemote {
        reachable: AtomicBool,
    }

    impl RemoteApi for SwitchRemote {
        async fn send(
            &self,
            _operation: SyncOperation,
            _note: &NoteSnapshot,
            _base_version: Option<i64>,
        ) -> NoteResult<RemoteOutcome> {
            Err(NoteError::network("not used"))
        }

        async fn ping(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_report_publishes_transitions_only() {
        let monitor = ConnectivityMonitor::new(false, ms(2000));
        let mut receiver = monitor.subscribe();

        assert!(!monitor.report(false));
        assert!(!receiver.has_changed().unwrap());

        let before = monitor.state().last_changed_at;
        assert!(monitor.report(true));
        assert!(receiver.has_changed().unwrap());
        assert!(receiver.borrow_and_update().is_online);
        assert!(monitor.state().last_changed_at >= before);

        assert!(!monitor.report(true));
        assert!(!receiver.has_changed().unwrap());
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_never_triggers() {
        let monitor = ConnectivityMonitor::new(false, ms(2000));
        let hook = Arc::new(CountingHook::default());
        let watcher = monitor.spawn_reconnect_watcher(hook.clone());

        for _ in 0..5 {
            monitor.report(true);
            sleep(ms(500)).await;
            monitor.report(false);
            sleep(ms(500)).await;
        }
        sleep(ms(10_000)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);

        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_reconnect_triggers_once() {
        let monitor = ConnectivityMonitor::new(false, ms(2000));
        let hook = Arc::new(CountingHook::default());
        let watcher = monitor.spawn_reconnect_watcher(hook.clone());

        // Flap, then settle online
        monitor.report(true);
        sleep(ms(300)).await;
        monitor.report(false);
        sleep(ms(300)).await;
        monitor.report(true);

        sleep(ms(1900)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
        sleep(ms(200)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        sleep(ms(10_000)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        // A later outage and stable recovery triggers again
        monitor.report(false);
        sleep(ms(100)).await;
        monitor.report(true);
        sleep(ms(2500)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);

        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_online_state_does_not_trigger() {
        let monitor = ConnectivityMonitor::new(true, ms(2000));
        let hook = Arc::new(CountingHook::default());
        let watcher = monitor.spawn_reconnect_watcher(hook.clone());

        sleep(ms(5000)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);

        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_reports_reachability() {
        let monitor = ConnectivityMonitor::new(false, ms(2000));
        let remote = Arc::new(SwitchRemote {
            reachable: AtomicBool::new(true),
        });
        let probe = monitor.spawn_probe(remote.clone(), ms(1000));

        sleep(ms(10)).await;
        assert!(monitor.is_online());

        remote.reachable.store(false, Ordering::SeqCst);
        sleep(ms(1000)).await;
        assert!(!monitor.is_online());

        probe.abort();
    }
}
