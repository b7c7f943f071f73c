//! 带退避重试的 HTTP 发送原语
//!
//! 可重试状态码（默认 429/500/502/503）按 RetryPolicy 退避后重发；其余状态码首次即返回。
//! 每次尝试独立超时；超时可重试，次数用尽时报告 Timeout（含尝试次数）。
//! 命中 NON_RETRYABLE_MARKERS 的请求错误立即失败。

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::RETRY_AFTER;
use reqwest::{Method, Response};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::error::NON_RETRYABLE_MARKERS;
use crate::transport::backoff::{parse_retry_after, sleep_or_cancel, RetryNotice, RetryPolicy};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request timed out after {attempts} attempt(s) ({elapsed_ms} ms total)")]
    Timeout { attempts: u32, elapsed_ms: u64 },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request failed (not retryable): {0}")]
    NonRetryable(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// 退避观察者：每次睡眠前回调
pub type RetryObserver = Arc<dyn Fn(&RetryNotice) + Send + Sync>;

/// 请求描述：每次尝试都会据此重新构造 reqwest 请求
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl Default for RequestSpec {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RequestSpec {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post_json(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// 退避传输层：持有 reqwest Client、可选观察者与取消 token
#[derive(Clone)]
pub struct BackoffTransport {
    client: reqwest::Client,
    observer: Option<RetryObserver>,
    cancel: CancellationToken,
}

impl Default for BackoffTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl BackoffTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// 绑定任务的取消 token：每次尝试前检查，退避睡眠可被打断
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn send(
        &self,
        url: &str,
        spec: &RequestSpec,
        policy: &RetryPolicy,
    ) -> Result<Response, TransportError> {
        let max_attempts = policy.max_attempts.max(1);
        let started = Instant::now();

        for attempt in 0..max_attempts {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let last = attempt + 1 >= max_attempts;
            let request = self.build_request(url, spec);

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                r = tokio::time::timeout(spec.timeout, request.send()) => r,
            };

            let (status, retry_after) = match result {
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    if !policy.is_retryable_status(status) || last {
                        return Ok(response);
                    }
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| parse_retry_after(v, chrono::Utc::now()));
                    (Some(status), retry_after)
                }
                Ok(Err(err)) => {
                    let message = error_chain(&err);
                    if is_non_retryable(&message) {
                        return Err(TransportError::NonRetryable(message));
                    }
                    if last {
                        return Err(TransportError::Request(message));
                    }
                    tracing::debug!(url, attempt = attempt + 1, error = %message, "request error, will retry");
                    (None, None)
                }
                Err(_) => {
                    if last {
                        return Err(TransportError::Timeout {
                            attempts: attempt + 1,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    tracing::debug!(url, attempt = attempt + 1, "request attempt timed out, will retry");
                    (None, None)
                }
            };

            let delay = policy.delay_for(attempt, retry_after);
            let notice = RetryNotice {
                attempt: attempt + 1,
                max_retries: max_attempts - 1,
                status,
                delay_ms: delay.as_millis() as u64,
                retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            };
            tracing::info!(
                url,
                attempt = notice.attempt,
                max_retries = notice.max_retries,
                status = ?notice.status,
                delay_ms = notice.delay_ms,
                "backing off before retry"
            );
            if let Some(observer) = &self.observer {
                observer(&notice);
            }
            if !sleep_or_cancel(delay, &self.cancel).await {
                return Err(TransportError::Cancelled);
            }
        }

        Err(TransportError::Request(format!(
            "no response after {max_attempts} attempt(s)"
        )))
    }

    fn build_request(&self, url: &str, spec: &RequestSpec) -> reqwest::RequestBuilder {
        let mut request = self.client.request(spec.method.clone(), url);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }
        request
    }
}

fn is_non_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    NON_RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// reqwest 错误的 Display 不含底层原因，这里把 source 链拼起来
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
