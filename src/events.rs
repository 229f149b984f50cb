//! Observer streams (spec §9): the source's reactive subjects are modeled as
//! `tokio::sync::broadcast` channels here. Each subscriber gets its own
//! receiver and can drop it at any time without affecting other listeners;
//! the bus itself is dropped along with its owning `Socket`/`Channel`, so no
//! listener is ever retained past that lifetime.

use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 256;

/// Socket-level lifecycle events (`socket-opened`, `socket-closed`,
/// `socket-errored`, `socket-received-message`).
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Opened,
    Closed,
    Errored(String),
    MessageReceived { topic: String, event: String },
}

/// Per-channel events: inbound broadcasts and lifecycle notifications that
/// are not private to a single [`crate::Push`].
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A non-reply, non-lifecycle message broadcast on this channel's topic.
    Message { event: String, payload: Value },
    /// The channel errored (`phx_error`, or a socket-level error while
    /// joined/joining).
    Error,
    /// The channel transitioned to `closed`.
    Closed,
}

#[derive(Clone)]
pub(crate) struct EventBus<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Broadcasts are best-effort: if nobody is listening, the send simply
    /// fails and is ignored (matches "fire and forget" observer semantics).
    pub(crate) fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }
}

/// Describes why a push completed, used internally to correlate a reply
/// with its `ref` before handing it to the waiting [`crate::Push`].
#[derive(Debug, Clone)]
pub(crate) enum ReplyOutcome {
    Ok(Value),
    Error(Value),
}
