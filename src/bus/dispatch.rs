//! Handler dispatch utilities.
//!
//! Shared by every backend: decode a delivered payload, route it to the
//! channel's handler, retry transient handler failures in place, and report
//! what happened so the backend can settle the delivery.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::{HandlerError, MessageHandler};
use crate::message::{Message, MessageError};
use crate::utils::retry::RetryConfig;

/// Per-channel handler table.
///
/// One handler per channel: registering again replaces the previous handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn MessageHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace. Returns true if the channel was not registered.
    pub async fn register(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> bool {
        self.handlers
            .write()
            .await
            .insert(channel.to_string(), handler)
            .is_none()
    }

    /// Returns true if a registration was removed.
    pub async fn remove(&self, channel: &str) -> bool {
        self.handlers.write().await.remove(channel).is_some()
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().await.get(channel).cloned()
    }

    pub async fn contains(&self, channel: &str) -> bool {
        self.handlers.read().await.contains_key(channel)
    }

    pub async fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}

/// Result of invoking a handler, after in-place retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Handled { attempts: u32 },
    Failed { error: HandlerError, attempts: u32 },
}

/// Invoke a handler, retrying transient failures per `retry`.
///
/// Unrecoverable failures return immediately.
pub async fn invoke_with_retry(
    handler: &Arc<dyn MessageHandler>,
    message: &Arc<Message>,
    retry: &RetryConfig,
) -> HandlerOutcome {
    let mut attempt = 0u32;

    loop {
        match handler.handle(Arc::clone(message)).await {
            Ok(()) => {
                return HandlerOutcome::Handled {
                    attempts: attempt + 1,
                }
            }
            Err(HandlerError::Transient(reason)) if retry.should_retry(attempt) => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    message_id = %message.id(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Transient handler failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                error!(
                    message_id = %message.id(),
                    attempts = attempt + 1,
                    error = %error,
                    "Handler failed"
                );
                return HandlerOutcome::Failed {
                    error,
                    attempts: attempt + 1,
                };
            }
        }
    }
}

/// Result of processing a raw delivery.
#[derive(Debug)]
pub enum ProcessResult {
    /// Handler succeeded.
    Handled,
    /// No handler registered for the message's channel.
    Unrouted,
    /// Payload could not be decoded; no retry will help.
    Undecodable(MessageError),
    /// Handler gave up on the message.
    Failed {
        message: Arc<Message>,
        error: HandlerError,
        attempts: u32,
    },
}

impl ProcessResult {
    /// Returns true if the delivery belongs on the dead-letter destination.
    pub fn should_dead_letter(&self) -> bool {
        matches!(self, Self::Undecodable(_) | Self::Failed { .. })
    }
}

/// Process a delivered payload through the registered handlers.
///
/// Handles the complete decode → route → invoke cycle. The message's own
/// channel wins; `fallback_channel` (routing key, pub/sub channel) is used
/// only for messages that carry none.
pub async fn process_payload(
    payload: &[u8],
    fallback_channel: Option<&str>,
    handlers: &HandlerRegistry,
    retry: &RetryConfig,
) -> ProcessResult {
    let message = match Message::decode(payload) {
        Ok(message) => Arc::new(message),
        Err(e) => {
            error!(error = %e, "Failed to decode message");
            return ProcessResult::Undecodable(e);
        }
    };

    let Some(channel) = message.channel().or(fallback_channel) else {
        debug!(message_id = %message.id(), "Message carries no channel, skipping");
        return ProcessResult::Unrouted;
    };

    let Some(handler) = handlers.get(channel).await else {
        debug!(channel = %channel, message_id = %message.id(), "No handler for channel");
        return ProcessResult::Unrouted;
    };

    match invoke_with_retry(&handler, &message, retry).await {
        HandlerOutcome::Handled { .. } => ProcessResult::Handled,
        HandlerOutcome::Failed { error, attempts } => ProcessResult::Failed {
            message,
            error,
            attempts,
        },
    }
}
