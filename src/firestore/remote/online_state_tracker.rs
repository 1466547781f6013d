use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::firestore::core::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::util::async_queue::{box_queue_future, AsyncQueue, DelayedOperation, TimerId};

/// Failed connection attempts tolerated before going offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    /// Avoids logging the offline warning more than once per session.
    should_warn_client_is_offline: bool,
}

/// Derives the client's [`OnlineState`] from the health of the watch
/// stream.
///
/// Starts `Unknown`. The first failed connection attempt, or no success
/// within the online-state timeout, moves it to `Offline` so listeners can
/// be served from cache instead of waiting. A successful message moves it
/// to `Online`.
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    timeout: Duration,
    handler: OnlineStateHandler,
    inner: Arc<Mutex<TrackerState>>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, timeout: Duration, handler: OnlineStateHandler) -> Self {
        Self {
            queue,
            timeout,
            handler,
            inner: Arc::new(Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                online_state_timer: None,
                should_warn_client_is_offline: true,
            })),
        }
    }

    pub fn state(&self) -> OnlineState {
        lock(&self.inner).state
    }

    /// Called when the watch stream starts. Until an attempt fails, every
    /// start reverts to `Unknown` and arms the timeout.
    pub fn handle_watch_stream_start(&self) {
        let notify = {
            let mut inner = lock(&self.inner);
            if inner.watch_stream_failures != 0 {
                return;
            }
            let notify = transition(&mut inner, OnlineState::Unknown);
            if inner.online_state_timer.is_none() {
                inner.online_state_timer = Some(self.schedule_timeout());
            }
            notify
        };
        self.notify(notify);
    }

    fn schedule_timeout(&self) -> DelayedOperation {
        let tracker = Arc::clone(&self.inner);
        let handler = Arc::clone(&self.handler);
        let timeout = self.timeout;
        self.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            timeout,
            box_queue_future(async move {
                let notify = {
                    let mut inner = lock(&tracker);
                    inner.online_state_timer = None;
                    if inner.state != OnlineState::Unknown {
                        None
                    } else {
                        log_offline(
                            &mut inner,
                            &format!("Backend didn't respond within {} seconds", timeout.as_secs()),
                        );
                        transition(&mut inner, OnlineState::Offline)
                    }
                };
                if let Some(state) = notify {
                    handler(state);
                }
                Ok(())
            }),
        )
    }

    /// Called when the watch stream closes while it is still needed.
    pub fn handle_watch_stream_failure(&self, error: Option<&FirestoreError>) {
        let notify = {
            let mut inner = lock(&self.inner);
            if inner.state == OnlineState::Online {
                transition(&mut inner, OnlineState::Unknown)
            } else {
                inner.watch_stream_failures += 1;
                if inner.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                    clear_timer(&mut inner);
                    let reason = match error {
                        Some(error) => format!(
                            "Connection failed {} times. Most recent error: {error}",
                            inner.watch_stream_failures
                        ),
                        None => format!("Connection failed {} times", inner.watch_stream_failures),
                    };
                    log_offline(&mut inner, &reason);
                    transition(&mut inner, OnlineState::Offline)
                } else {
                    None
                }
            }
        };
        self.notify(notify);
    }

    /// Explicit transitions, e.g. `Online` after a watch message or
    /// `Offline` when the network is disabled. Resets the failure count.
    pub fn set(&self, state: OnlineState) {
        let notify = {
            let mut inner = lock(&self.inner);
            clear_timer(&mut inner);
            inner.watch_stream_failures = 0;
            if state == OnlineState::Online {
                inner.should_warn_client_is_offline = false;
            }
            transition(&mut inner, state)
        };
        self.notify(notify);
    }

    fn notify(&self, state: Option<OnlineState>) {
        if let Some(state) = state {
            (self.handler)(state);
        }
    }
}

fn transition(inner: &mut TrackerState, state: OnlineState) -> Option<OnlineState> {
    if inner.state == state {
        return None;
    }
    inner.state = state;
    Some(state)
}

fn clear_timer(inner: &mut TrackerState) {
    if let Some(timer) = inner.online_state_timer.take() {
        timer.cancel();
    }
}

fn log_offline(inner: &mut TrackerState, reason: &str) {
    let message = format!(
        "Could not reach the backend. {reason}. The client will operate in offline mode until it is able to connect."
    );
    if inner.should_warn_client_is_offline {
        log::warn!("{message}");
        inner.should_warn_client_is_offline = false;
    } else {
        log::debug!("{message}");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn tracker() -> (OnlineStateTracker, AsyncQueue, Arc<Mutex<Vec<OnlineState>>>) {
        let queue = AsyncQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let tracker = OnlineStateTracker::new(
            queue.clone(),
            Duration::from_secs(10),
            Arc::new(move |state| recorded.lock().unwrap().push(state)),
        );
        (tracker, queue, seen)
    }

    #[tokio::test]
    async fn first_failure_goes_offline() {
        let (tracker, _queue, seen) = tracker();
        tracker.handle_watch_stream_start();
        tracker.handle_watch_stream_failure(Some(&unavailable("down")));
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn timeout_goes_offline_and_restarts_rearm_it() {
        let (tracker, queue, seen) = tracker();
        tracker.handle_watch_stream_start();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        queue
            .run_delayed_operations_until(Some(TimerId::OnlineStateTimeout))
            .await
            .unwrap();
        assert_eq!(tracker.state(), OnlineState::Offline);

        tracker.set(OnlineState::Online);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        tracker.handle_watch_stream_start();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![OnlineState::Offline, OnlineState::Online, OnlineState::Unknown]
        );
    }

    #[tokio::test]
    async fn failure_while_online_reverts_to_unknown() {
        let (tracker, _queue, _seen) = tracker();
        tracker.set(OnlineState::Online);
        tracker.handle_watch_stream_failure(None);
        assert_eq!(tracker.state(), OnlineState::Unknown);
    }
}
