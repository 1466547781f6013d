use std::sync::{Arc, Mutex, MutexGuard};

/// Network reachability as reported by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    Available,
    Unavailable,
}

pub type ConnectivityCallback = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

/// Source of network reachability changes.
pub trait ConnectivityMonitor: Send + Sync + 'static {
    fn add_callback(&self, callback: ConnectivityCallback);

    fn shutdown(&self);
}

pub type ConnectivityMonitorArc = Arc<dyn ConnectivityMonitor>;

/// Monitor driven by the embedder, which reports changes through
/// [`set_status`](Self::set_status).
#[derive(Default)]
pub struct ManualConnectivityMonitor {
    inner: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    callbacks: Vec<ConnectivityCallback>,
    last_status: Option<NetworkStatus>,
    shut_down: bool,
}

impl ManualConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifies the callbacks when `status` differs from the last report.
    pub fn set_status(&self, status: NetworkStatus) {
        let callbacks = {
            let mut inner = self.lock();
            if inner.shut_down || inner.last_status == Some(status) {
                return;
            }
            inner.last_status = Some(status);
            inner.callbacks.clone()
        };
        log::debug!("connectivity monitor: network {status:?}");
        for callback in callbacks {
            callback(status);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConnectivityMonitor for ManualConnectivityMonitor {
    fn add_callback(&self, callback: ConnectivityCallback) {
        self.lock().callbacks.push(callback);
    }

    fn shutdown(&self) {
        let mut inner = self.lock();
        inner.shut_down = true;
        inner.callbacks.clear();
    }
}

/// Monitor for platforms without reachability information.
#[derive(Default)]
pub struct NoopConnectivityMonitor;

impl ConnectivityMonitor for NoopConnectivityMonitor {
    fn add_callback(&self, _callback: ConnectivityCallback) {}

    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_statuses_are_reported_once() {
        let monitor = ManualConnectivityMonitor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        monitor.add_callback(Arc::new(move |status| recorded.lock().unwrap().push(status)));

        monitor.set_status(NetworkStatus::Unavailable);
        monitor.set_status(NetworkStatus::Unavailable);
        monitor.set_status(NetworkStatus::Available);
        monitor.shutdown();
        monitor.set_status(NetworkStatus::Unavailable);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![NetworkStatus::Unavailable, NetworkStatus::Available]
        );
    }
}
