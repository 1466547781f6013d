pub mod assert;
pub mod async_queue;
pub mod backoff;

pub use assert::{assertion_error, fail, hard_assert};
pub use async_queue::{
    box_queue_future, is_retryable_error, AsyncQueue, DelayedOperation, QueueFuture,
    RetryableOperation, TimerId,
};
pub use backoff::{jittered_delay, ExponentialBackoff, RANDOM_FACTOR};
