//! Long-running consume loop.
//!
//! One [`ConsumerLoop`] per process drives `Broker::consume` until it is told
//! to stop, reaches its message limit, or (optionally) sees an empty poll.
//! Calls never overlap; the shutdown flag is checked after each one so an
//! in-flight batch always finishes. The broker is disconnected on every exit
//! path, which flushes buffered output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::bus::{Broker, BrokerError};
use crate::config::ConsumerSettings;
use crate::utils::retry::RetryConfig;

/// Cooperative stop flag shared between the loop and whoever stops it.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownState>,
}

#[derive(Default)]
struct ShutdownState {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger` has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    MaxMessages,
    /// A poll returned nothing and `stop_when_empty` was set.
    Empty,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerReport {
    pub consumed: u64,
    /// `consume` calls made, failed ones included.
    pub iterations: u64,
    pub reason: StopReason,
}

/// Loop settings.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub max_messages: Option<u64>,
    pub stop_when_empty: bool,
    /// Re-attempts while the broker is unavailable.
    pub retry: RetryConfig,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::from(&ConsumerSettings::default())
    }
}

impl From<&ConsumerSettings> for ConsumerOptions {
    fn from(settings: &ConsumerSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            poll_timeout: settings.poll_timeout,
            max_messages: settings.max_messages,
            stop_when_empty: settings.stop_when_empty,
            retry: settings.retry.clone(),
        }
    }
}

impl ConsumerOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_messages(mut self, max: u64) -> Self {
        self.max_messages = Some(max);
        self
    }

    pub fn with_stop_when_empty(mut self, stop: bool) -> Self {
        self.stop_when_empty = stop;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Drives a broker's delivery pipeline.
pub struct ConsumerLoop {
    broker: Arc<dyn Broker>,
    options: ConsumerOptions,
    shutdown: ShutdownSignal,
}

impl ConsumerLoop {
    pub fn new(broker: Arc<dyn Broker>, options: ConsumerOptions) -> Self {
        Self {
            broker,
            options,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Stop on an externally owned signal.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run until stopped, then disconnect the broker.
    ///
    /// Fails when the broker stays unavailable past the retry budget or
    /// reports a non-retryable error.
    pub async fn run(&self) -> Result<ConsumerReport, BrokerError> {
        info!(
            driver = %self.broker.kind(),
            batch_size = self.options.batch_size,
            poll_timeout_ms = self.options.poll_timeout.as_millis() as u64,
            "Consumer loop starting"
        );

        let result = self.drive().await;

        if let Err(e) = self.broker.disconnect().await {
            warn!(error = %e, "Broker disconnect failed");
        }

        match &result {
            Ok(report) => info!(
                consumed = report.consumed,
                iterations = report.iterations,
                reason = ?report.reason,
                "Consumer loop stopped"
            ),
            Err(e) => error!(error = %e, "Consumer loop failed"),
        }
        result
    }

    async fn drive(&self) -> Result<ConsumerReport, BrokerError> {
        let batch_size = self.options.batch_size.max(1);
        let mut consumed = 0u64;
        let mut iterations = 0u64;
        let mut failures = 0u32;

        let report = |consumed, iterations, reason| ConsumerReport {
            consumed,
            iterations,
            reason,
        };

        loop {
            if self.shutdown.is_triggered() {
                return Ok(report(consumed, iterations, StopReason::Shutdown));
            }

            let batch = match self.options.max_messages {
                Some(max) => {
                    let remaining = max.saturating_sub(consumed);
                    if remaining == 0 {
                        return Ok(report(consumed, iterations, StopReason::MaxMessages));
                    }
                    batch_size.min(usize::try_from(remaining).unwrap_or(usize::MAX))
                }
                None => batch_size,
            };

            iterations += 1;
            match self.broker.consume(self.options.poll_timeout, batch).await {
                Ok(count) => {
                    failures = 0;
                    consumed += count as u64;
                    debug!(count, consumed, "Consumed batch");

                    if self.options.max_messages.is_some_and(|max| consumed >= max) {
                        return Ok(report(consumed, iterations, StopReason::MaxMessages));
                    }
                    if count == 0 && self.options.stop_when_empty {
                        return Ok(report(consumed, iterations, StopReason::Empty));
                    }
                }
                Err(e) if e.is_retryable() && self.options.retry.should_retry(failures) => {
                    let delay = self.options.retry.delay_for_attempt(failures);
                    failures += 1;
                    warn!(
                        error = %e,
                        attempt = failures,
                        max_retries = self.options.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Broker unavailable, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.wait() => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
