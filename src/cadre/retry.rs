//! Retry decorator for provider clients.
//!
//! [`RetryProvider`] wraps any [`ProviderClient`] and retries transient
//! upstream failures with capped exponential backoff and proportional jitter.
//! Cancellation is checked before every sleep and races every in-flight call,
//! so a cancelled run never waits out a backoff window.
//!
//! Streaming gets special treatment: the *first* attempt forwards deltas to
//! the caller's handler in real time, while every retry attempt buffers its
//! events and flushes them only on success.  This prevents duplicated partial
//! output on the retry path while keeping the common path truly incremental.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::cadre::error::CadreError;
use crate::cadre::provider::{
    CompletionRequest, CompletionResponse, ProviderClient, StreamEvent, StreamHandler,
};

/// Backoff and retry-count knobs for [`RetryProvider`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles every attempt.
    pub initial_backoff: Duration,
    /// Cap applied to the computed backoff.
    pub max_backoff: Duration,
    /// Proportional jitter: each sleep is scaled by a random factor in
    /// `[1 - jitter_fraction, 1 + jitter_fraction]`.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter_fraction: 0.2,
        }
    }
}

/// Wraps a provider with transparent retries.
///
/// Error classification comes from [`CadreError::is_retryable`]: network
/// failures and the 429/500/502/503/529 API statuses retry, everything else
/// (including cancellation) surfaces immediately.
pub struct RetryProvider {
    inner: Arc<dyn ProviderClient>,
    config: RetryConfig,
}

impl RetryProvider {
    /// Wrap `inner` with the default [`RetryConfig`].
    pub fn new(inner: Arc<dyn ProviderClient>) -> Self {
        Self::with_config(inner, RetryConfig::default())
    }

    /// Wrap `inner` with an explicit configuration.
    pub fn with_config(inner: Arc<dyn ProviderClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Model identifier of the wrapped provider.
    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    /// Unwrap the decorator, returning the inner client.
    pub fn into_inner(self) -> Arc<dyn ProviderClient> {
        self.inner
    }

    /// Compute the backoff for a given attempt: `initial × 2^attempt`, capped,
    /// with proportional jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = base.min(self.config.max_backoff.as_secs_f64());
        let jitter = self.config.jitter_fraction.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    /// Sleep out a backoff window, returning [`CadreError::Cancelled`] if the
    /// token fires first.
    async fn backoff_sleep(
        &self,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<(), CadreError> {
        if cancel.is_cancelled() {
            return Err(CadreError::Cancelled);
        }
        let delay = self.backoff_delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(CadreError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Request/response completion with retries.
    pub async fn complete(
        &self,
        cancel: &CancellationToken,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CadreError> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(CadreError::Cancelled);
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(CadreError::Cancelled),
                r = self.inner.complete(request.clone()) => r,
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    log::warn!(
                        "provider call failed (attempt {}/{}): {}; backing off",
                        attempt + 1,
                        self.config.max_retries + 1,
                        err
                    );
                    self.backoff_sleep(cancel, attempt).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Streaming completion with retries.
    ///
    /// The first attempt streams to `handler` live.  Retry attempts buffer
    /// every event and flush the buffer only once the attempt succeeds, so the
    /// caller never sees a partial reply twice.
    pub async fn stream(
        &self,
        cancel: &CancellationToken,
        request: CompletionRequest,
        handler: StreamHandler<'_>,
    ) -> Result<CompletionResponse, CadreError> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(CadreError::Cancelled);
            }
            let result = if attempt == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => Err(CadreError::Cancelled),
                    r = self.inner.stream(request.clone(), handler) => r,
                }
            } else {
                let buffer: Mutex<Vec<StreamEvent>> = Mutex::new(Vec::new());
                let buffering = |event: StreamEvent| {
                    buffer.lock().unwrap().push(event);
                };
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(CadreError::Cancelled),
                    r = self.inner.stream(request.clone(), &buffering) => r,
                };
                if result.is_ok() {
                    for event in buffer.lock().unwrap().drain(..) {
                        handler(event);
                    }
                }
                result
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    log::warn!(
                        "provider stream failed (attempt {}/{}): {}; backing off",
                        attempt + 1,
                        self.config.max_retries + 1,
                        err
                    );
                    self.backoff_sleep(cancel, attempt).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadre::provider::StopReason;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with the given errors in sequence, then succeeds forever.
    struct FlakyClient {
        calls: AtomicUsize,
        failures: Vec<CadreError>,
    }

    impl FlakyClient {
        fn new(failures: Vec<CadreError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl ProviderClient for FlakyClient {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, CadreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.get(call) {
                Some(err) => Err(err.clone()),
                None => Ok(CompletionResponse::text("recovered", StopReason::EndTurn)),
            }
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter_fraction: 0.0,
        }
    }

    fn status(code: u16) -> CadreError {
        CadreError::Api {
            status: code,
            message: "upstream".into(),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let client = Arc::new(FlakyClient::new(vec![status(500), status(500)]));
        let provider = RetryProvider::with_config(client.clone(), fast_config());
        let cancel = CancellationToken::new();

        let response = provider
            .complete(&cancel, CompletionRequest::default())
            .await
            .unwrap();
        assert_eq!(response.content, "recovered");
        // exactly three provider calls: two failures, one success
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_after_one_attempt() {
        let client = Arc::new(FlakyClient::new(vec![status(401)]));
        let provider = RetryProvider::with_config(client.clone(), fast_config());
        let cancel = CancellationToken::new();

        let err = provider
            .complete(&cancel, CompletionRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "api");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_last_error() {
        let client = Arc::new(FlakyClient::new(vec![
            status(503),
            status(503),
            status(503),
            status(503),
        ]));
        let provider = RetryProvider::with_config(client.clone(), fast_config());
        let cancel = CancellationToken::new();

        let err = provider
            .complete(&cancel, CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        // max_retries = 3 means four attempts total
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_any_call() {
        let client = Arc::new(FlakyClient::new(vec![]));
        let provider = RetryProvider::with_config(client.clone(), fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = provider
            .complete(&cancel, CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_stream_attempt_passes_deltas_through_live() {
        let client = Arc::new(FlakyClient::new(vec![]));
        let provider = RetryProvider::with_config(client, fast_config());
        let cancel = CancellationToken::new();

        let deltas = Mutex::new(Vec::new());
        let handler = |event: StreamEvent| {
            let StreamEvent::ContentDelta(text) = event;
            deltas.lock().unwrap().push(text);
        };
        provider
            .stream(&cancel, CompletionRequest::default(), &handler)
            .await
            .unwrap();
        // exactly one delivery per upstream event
        assert_eq!(*deltas.lock().unwrap(), vec!["recovered".to_string()]);
    }

    #[tokio::test]
    async fn retried_stream_flushes_buffered_events_once() {
        let client = Arc::new(FlakyClient::new(vec![status(529)]));
        let provider = RetryProvider::with_config(client.clone(), fast_config());
        let cancel = CancellationToken::new();

        let deltas = Mutex::new(Vec::new());
        let handler = |event: StreamEvent| {
            let StreamEvent::ContentDelta(text) = event;
            deltas.lock().unwrap().push(text);
        };
        let response = provider
            .stream(&cancel, CompletionRequest::default(), &handler)
            .await
            .unwrap();
        assert_eq!(response.content, "recovered");
        // the failed attempt produced no deltas; the retry flushed exactly once
        assert_eq!(*deltas.lock().unwrap(), vec!["recovered".to_string()]);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let provider = RetryProvider::with_config(
            Arc::new(FlakyClient::new(vec![])),
            RetryConfig {
                max_retries: 5,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(5),
                jitter_fraction: 0.0,
            },
        );
        assert_eq!(provider.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(provider.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(provider.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(provider.backoff_delay(3), Duration::from_secs(5));
        assert_eq!(provider.backoff_delay(10), Duration::from_secs(5));
    }
}
