//! Message broker abstraction for live span updates.
//!
//! This module provides:
//!
//! - [`MessageBroker`]: Trait for publishing and pattern-subscribing
//! - [`Subscription`]: A live subscription with synchronous teardown
//! - [`InMemoryBroker`]: In-process broker for tests and single-node runs
//!
//! ## Channel Naming
//!
//! Span updates publish to `events:{trace_id}:{span_id}`; trace subscribers
//! register the pattern `events:{trace_id}:*`. Payloads are ISO-8601
//! timestamps marking when the state change landed. Subscribers may receive
//! the same channel more than once; notifications signal "re-query", not
//! state deltas.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use strand_core::{SpanId, TraceId};

use crate::error::Result;

pub use memory::InMemoryBroker;

/// Returns the publish channel for a `(trace, span)` pair.
#[must_use]
pub fn span_channel(trace_id: &TraceId, span_id: &SpanId) -> String {
    format!("events:{trace_id}:{span_id}")
}

/// Returns the subscription pattern matching every span of a trace.
#[must_use]
pub fn trace_pattern(trace_id: &TraceId) -> String {
    format!("events:{trace_id}:*")
}

/// Glob-style channel matching: segments are `:`-separated and `*` matches
/// exactly one segment.
#[must_use]
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    let mut pattern_segments = pattern.split(':');
    let mut channel_segments = channel.split(':');
    loop {
        match (pattern_segments.next(), channel_segments.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(c)) if p == c => {}
            _ => return false,
        }
    }
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// The concrete channel the message was published to.
    pub channel: String,
    /// The message payload.
    pub payload: Bytes,
}

/// A live pattern subscription.
///
/// Dropping the subscription (or calling [`unsubscribe`](Self::unsubscribe))
/// removes the pattern registration synchronously; no further messages are
/// delivered after either returns.
pub struct Subscription {
    pattern: String,
    receiver: mpsc::UnboundedReceiver<BrokerMessage>,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a subscription from its parts. Broker implementations call
    /// this; consumers receive it from [`MessageBroker::subscribe`].
    #[must_use]
    pub fn new(
        pattern: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<BrokerMessage>,
        closer: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            receiver,
            closer: Some(closer),
        }
    }

    /// The pattern this subscription was registered with.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receives the next message, or `None` once the subscription closes.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.receiver.recv().await
    }

    /// Receives a message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BrokerMessage> {
        self.receiver.try_recv().ok()
    }

    /// Tears the subscription down synchronously.
    pub fn unsubscribe(mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Publish/subscribe broker for span update notifications.
///
/// Implementations may target Redis pub/sub or similar; the in-memory
/// implementation serves tests and single-process deployments. Publishes are
/// fire-and-forget with respect to subscribers: a publish succeeds even when
/// nothing is listening.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes a payload to a concrete channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Registers a pattern subscription.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;
}
