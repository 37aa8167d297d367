//! Process startup helpers for fanout binaries.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

/// Install the global tracing subscriber.
///
/// The filter is read from `FANOUT_LOG` (e.g. `fanout=debug,info`) and
/// falls back to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Backoff between startup connection attempts: 100ms doubling up to 5s.
fn connection_backoff(max_attempts: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_attempts.max(1) as usize - 1)
        .with_jitter()
}

/// Connect to a backend, retrying with exponential backoff while
/// `retryable` accepts the error.
///
/// At least one attempt is made. Returns the last error once `max_attempts`
/// attempts have failed, or the first error `retryable` rejects.
pub async fn connect_with_retry<T, E, F, Fut, R>(
    service_name: &str,
    max_attempts: u32,
    connect: F,
    retryable: R,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let result = connect
        .retry(connection_backoff(max_attempts))
        .when(retryable)
        .notify(|err: &E, delay: Duration| {
            warn!(service = %service_name, error = %err, delay = ?delay, "Connection failed, retrying");
        })
        .await;

    match &result {
        Ok(_) => info!(service = %service_name, "Connected"),
        Err(e) => error!(service = %service_name, error = %e, "Giving up connecting"),
    }
    result
}
