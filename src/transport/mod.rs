//! 网络传输：指数退避 + Retry-After 的重试原语

pub mod backoff;
pub mod client;

pub use backoff::{parse_retry_after, sleep_or_cancel, RetryNotice, RetryPolicy};
pub use client::{BackoffTransport, RequestSpec, RetryObserver, TransportError};
