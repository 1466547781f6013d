use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::FutureExt;

use crate::firestore::error::{
    failed_precondition, internal_error, FirestoreErrorCode, FirestoreError, FirestoreResult,
};
use crate::platform::runtime;
use crate::util::backoff::ExponentialBackoff;

#[cfg(target_arch = "wasm32")]
pub type QueueFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type QueueFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_queue_future<'a, F, T>(future: F) -> QueueFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_queue_future<'a, F, T>(future: F) -> QueueFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Builds a fresh attempt of an operation enqueued with
/// [`AsyncQueue::enqueue_retryable`].
pub type RetryableOperation = Arc<dyn Fn() -> QueueFuture<'static, FirestoreResult<()>> + Send + Sync>;

/// Identifies the kind of a delayed operation so tests can fast-forward
/// specific timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    LruGarbageCollection,
    AsyncQueueRetry,
}

impl Display for TimerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TimerId::ListenStreamIdle => "listen_stream_idle",
            TimerId::ListenStreamConnectionBackoff => "listen_stream_connection_backoff",
            TimerId::WriteStreamIdle => "write_stream_idle",
            TimerId::WriteStreamConnectionBackoff => "write_stream_connection_backoff",
            TimerId::OnlineStateTimeout => "online_state_timeout",
            TimerId::LruGarbageCollection => "lru_garbage_collection",
            TimerId::AsyncQueueRetry => "async_queue_retry",
        };
        f.write_str(label)
    }
}

/// Errors worth retrying later instead of surfacing to the caller.
pub fn is_retryable_error(error: &FirestoreError) -> bool {
    matches!(
        error.code,
        FirestoreErrorCode::Unavailable | FirestoreErrorCode::Aborted
    )
}

type QueueTask = QueueFuture<'static, ()>;

/// FIFO executor that every component of the client funnels its work
/// through. Tasks run one at a time and each one runs to completion before
/// the next starts, so component state is never observed half-updated.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    sender: Sender<QueueTask>,
    state: Mutex<QueueState>,
}

struct QueueState {
    restricted: bool,
    next_delayed_id: u64,
    delayed: Vec<Arc<DelayedEntry>>,
    retryable: VecDeque<RetryableOperation>,
    retry_backoff: ExponentialBackoff,
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time_ms: i64,
    operation: Mutex<Option<QueueFuture<'static, FirestoreResult<()>>>>,
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    entry: Arc<DelayedEntry>,
    queue: Weak<QueueInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.entry.timer_id
    }

    /// Cancels the operation if it has not started yet.
    pub fn cancel(&self) {
        let removed = lock(&self.entry.operation).take();
        if removed.is_some() {
            log::debug!("cancelled delayed operation {}", self.entry.timer_id);
        }
        if let Some(queue) = self.queue.upgrade() {
            lock(&queue.state)
                .delayed
                .retain(|entry| entry.id != self.entry.id);
        }
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let inner = Arc::new(QueueInner {
            sender,
            state: Mutex::new(QueueState {
                restricted: false,
                next_delayed_id: 0,
                delayed: Vec::new(),
                retryable: VecDeque::new(),
                retry_backoff: ExponentialBackoff::default(),
            }),
        });
        Self::start_worker(receiver);
        Self { inner }
    }

    fn start_worker(receiver: Receiver<QueueTask>) {
        runtime::spawn_detached(async move {
            while let Ok(task) = receiver.recv().await {
                task.await;
            }
            log::debug!("async queue worker stopped");
        });
    }

    /// True once shutdown has started; only shutdown work is accepted.
    pub fn is_shutting_down(&self) -> bool {
        lock(&self.inner.state).restricted
    }

    /// Runs `operation` after every task enqueued before it and returns its
    /// result.
    pub async fn enqueue<T>(
        &self,
        operation: QueueFuture<'static, FirestoreResult<T>>,
    ) -> FirestoreResult<T>
    where
        T: Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(failed_precondition(
                "The client has already been terminated.",
            ));
        }
        self.run(operation).await
    }

    /// Like [`enqueue`](Self::enqueue) but also accepted after shutdown has
    /// started.
    pub async fn enqueue_even_while_restricted<T>(
        &self,
        operation: QueueFuture<'static, FirestoreResult<T>>,
    ) -> FirestoreResult<T>
    where
        T: Send + 'static,
    {
        self.run(operation).await
    }

    /// Enqueues `operation` without waiting for it. Failures are logged.
    pub fn enqueue_and_forget(&self, operation: QueueFuture<'static, FirestoreResult<()>>) {
        if self.is_shutting_down() {
            log::debug!("dropping operation enqueued after shutdown");
            return;
        }
        self.push(box_queue_future(async move {
            if let Err(err) = operation.await {
                log::error!("async queue operation failed: {err}");
            }
        }));
    }

    /// Enters restricted mode and runs `operation` as the last regular task.
    /// Later calls are no-ops.
    pub async fn enqueue_and_initiate_shutdown(
        &self,
        operation: QueueFuture<'static, FirestoreResult<()>>,
    ) -> FirestoreResult<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.restricted {
                return Ok(());
            }
            state.restricted = true;
            for entry in state.delayed.drain(..) {
                lock(&entry.operation).take();
            }
            state.retryable.clear();
        }
        self.run(operation).await
    }

    /// Runs operations that must eventually succeed, e.g. persisting a
    /// remote event. An attempt failing with a retryable error is retried
    /// after a backoff, behind every task enqueued in the meantime.
    pub fn enqueue_retryable(&self, operation: RetryableOperation) {
        lock(&self.inner.state).retryable.push_back(operation);
        let queue = self.clone();
        self.enqueue_and_forget(box_queue_future(async move {
            queue.retry_next_operation().await;
            Ok(())
        }));
    }

    /// Runs the oldest retryable operation once. Returns a boxed future
    /// because a retry schedules the next attempt of itself.
    fn retry_next_operation(&self) -> QueueFuture<'static, ()> {
        let queue = self.clone();
        box_queue_future(async move {
            let next = lock(&queue.inner.state).retryable.front().cloned();
            let Some(operation) = next else {
                return;
            };
            match operation().await {
                Ok(()) => {
                    let mut state = lock(&queue.inner.state);
                    state.retryable.pop_front();
                    state.retry_backoff.reset();
                }
                Err(err) if is_retryable_error(&err) => {
                    log::debug!("operation failed with retryable error: {err}");
                }
                Err(err) => {
                    log::error!("retryable operation failed permanently: {err}");
                    lock(&queue.inner.state).retryable.pop_front();
                }
            }

            let delay = {
                let mut state = lock(&queue.inner.state);
                if state.retryable.is_empty() {
                    return;
                }
                state.retry_backoff.next_delay()
            };
            let next_attempt = queue.clone();
            queue.enqueue_after_delay(
                TimerId::AsyncQueueRetry,
                delay,
                box_queue_future(async move {
                    next_attempt.retry_next_operation().await;
                    Ok(())
                }),
            );
        })
    }

    /// Schedules `operation` to be enqueued once `delay` has elapsed.
    pub fn enqueue_after_delay(
        &self,
        timer_id: TimerId,
        delay: Duration,
        operation: QueueFuture<'static, FirestoreResult<()>>,
    ) -> DelayedOperation {
        let target_time_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let entry = {
            let mut state = lock(&self.inner.state);
            state.next_delayed_id += 1;
            let entry = Arc::new(DelayedEntry {
                id: state.next_delayed_id,
                timer_id,
                target_time_ms,
                operation: Mutex::new(Some(operation)),
            });
            state.delayed.push(Arc::clone(&entry));
            entry
        };

        let queue = Arc::downgrade(&self.inner);
        let scheduled = Arc::clone(&entry);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(inner) = queue.upgrade() {
                AsyncQueue { inner }.fire_delayed(&scheduled);
            }
        });

        DelayedOperation {
            entry,
            queue: Arc::downgrade(&self.inner),
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        lock(&self.inner.state)
            .delayed
            .iter()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Runs every pending delayed operation in target-time order, stopping
    /// after the first one with `last_timer_id` (or after all of them).
    pub async fn run_delayed_operations_until(
        &self,
        last_timer_id: Option<TimerId>,
    ) -> FirestoreResult<()> {
        self.drain().await?;
        let mut pending = lock(&self.inner.state).delayed.clone();
        pending.sort_by_key(|entry| (entry.target_time_ms, entry.id));
        for entry in pending {
            self.fire_delayed(&entry);
            if Some(entry.timer_id) == last_timer_id {
                break;
            }
        }
        self.drain().await
    }

    /// Resolves once every task enqueued so far has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.run(box_queue_future(async { Ok(()) })).await
    }

    fn fire_delayed(&self, entry: &Arc<DelayedEntry>) {
        lock(&self.inner.state)
            .delayed
            .retain(|pending| pending.id != entry.id);
        let operation = lock(&entry.operation).take();
        if let Some(operation) = operation {
            self.enqueue_and_forget(operation);
        }
    }

    async fn run<T>(&self, operation: QueueFuture<'static, FirestoreResult<T>>) -> FirestoreResult<T>
    where
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.push(box_queue_future(async move {
            let result = operation.await;
            let _ = sender.send(result);
        }));
        receiver
            .await
            .map_err(|_| internal_error("async queue dropped an operation before it completed"))?
    }

    fn push(&self, task: QueueTask) {
        if let Err(err) = self.inner.sender.try_send(task) {
            log::error!("async queue is closed, dropping task: {err}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(
        log: &Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
    ) -> QueueFuture<'static, FirestoreResult<()>> {
        let log = Arc::clone(log);
        box_queue_future(async move {
            log.lock().unwrap().push(label);
            Ok(())
        })
    }

    #[tokio::test]
    async fn runs_tasks_in_fifo_order() {
        let queue = AsyncQueue::new();
        let log = recorder();
        queue.enqueue_and_forget(record(&log, "a"));
        queue.enqueue_and_forget(record(&log, "b"));
        queue.enqueue(record(&log, "c")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn each_task_runs_to_completion() {
        let queue = AsyncQueue::new();
        let log = recorder();
        let slow_log = Arc::clone(&log);
        queue.enqueue_and_forget(box_queue_future(async move {
            slow_log.lock().unwrap().push("slow-start");
            runtime::sleep(Duration::from_millis(20)).await;
            slow_log.lock().unwrap().push("slow-end");
            Ok(())
        }));
        queue.enqueue(record(&log, "fast")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["slow-start", "slow-end", "fast"]);
    }

    #[tokio::test]
    async fn enqueue_returns_operation_result() {
        let queue = AsyncQueue::new();
        let value = queue
            .enqueue(box_queue_future(async { Ok(41 + 1) }))
            .await
            .unwrap();
        assert_eq!(value, 42);
        let err = queue
            .enqueue::<()>(box_queue_future(async { Err(internal_error("boom")) }))
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Internal);
    }

    #[tokio::test]
    async fn rejects_work_after_shutdown() {
        let queue = AsyncQueue::new();
        let log = recorder();
        queue
            .enqueue_and_initiate_shutdown(record(&log, "shutdown"))
            .await
            .unwrap();
        let err = queue.enqueue(record(&log, "late")).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        queue
            .enqueue_even_while_restricted(record(&log, "cleanup"))
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["shutdown", "cleanup"]);
    }

    #[tokio::test]
    async fn delayed_operations_can_be_skipped_or_cancelled() {
        let queue = AsyncQueue::new();
        let log = recorder();
        let cancelled = queue.enqueue_after_delay(
            TimerId::ListenStreamIdle,
            Duration::from_secs(60),
            record(&log, "idle"),
        );
        queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            Duration::from_secs(30),
            record(&log, "timeout"),
        );
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        cancelled.cancel();
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));

        queue.run_delayed_operations_until(None).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["timeout"]);
    }

    #[tokio::test]
    async fn retryable_operation_goes_back_to_the_tail() {
        let queue = AsyncQueue::new();
        let log = recorder();
        let attempts = Arc::new(AtomicUsize::new(0));

        let op_log = Arc::clone(&log);
        let op_attempts = Arc::clone(&attempts);
        queue.enqueue_retryable(Arc::new(move || {
            let log = Arc::clone(&op_log);
            let attempts = Arc::clone(&op_attempts);
            box_queue_future(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    log.lock().unwrap().push("retry-failed");
                    Err(crate::firestore::error::unavailable("disk busy"))
                } else {
                    log.lock().unwrap().push("retry-ok");
                    Ok(())
                }
            })
        }));
        queue.enqueue(record(&log, "other")).await.unwrap();
        queue
            .run_delayed_operations_until(Some(TimerId::AsyncQueueRetry))
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["retry-failed", "other", "retry-ok"]
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_keep_rescheduling_until_success() {
        fn assert_send<T: Send>(_: &T) {}

        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let op_attempts = Arc::clone(&attempts);
        queue.enqueue_retryable(Arc::new(move || {
            let attempts = Arc::clone(&op_attempts);
            box_queue_future(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(crate::firestore::error::unavailable("disk busy"))
                } else {
                    Ok(())
                }
            })
        }));
        queue.drain().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        for expected in [2, 3] {
            assert!(queue.contains_delayed_operation(TimerId::AsyncQueueRetry));
            queue
                .run_delayed_operations_until(Some(TimerId::AsyncQueueRetry))
                .await
                .unwrap();
            assert_eq!(attempts.load(Ordering::SeqCst), expected);
        }
        assert!(!queue.contains_delayed_operation(TimerId::AsyncQueueRetry));

        let attempt = queue.retry_next_operation();
        assert_send(&attempt);
        attempt.await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
