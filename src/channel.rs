//! Per-topic multiplex endpoint and its join/leave/rejoin state machine
//! (spec §4.2).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::events::{ChannelEvent, EventBus, ReplyOutcome};
use crate::message::{event, Message, Ref};
use crate::push::Push;
use crate::socket::{Socket, SocketShared};
use crate::timer::BackoffFn;

/// The channel FSM (spec §4.2).
///
/// ```text
/// closed   --join-->  joining
/// joining  --ok-->    joined
/// joining  --error--> errored
/// joining  --timeout->errored
/// joined   --error--> errored
/// joined   --leave--> leaving
/// leaving  --ok|close|timeout--> closed
/// errored  --rejoin--> joining
/// any      --phx_close--> closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
    Errored,
    Leaving,
}

struct BufferedPush {
    event: String,
    payload: Value,
    tx: oneshot::Sender<ReplyOutcome>,
}

struct ChannelInner {
    fsm: ChannelState,
    joined_once: bool,
    params: Value,
    /// The `ref` of the channel's current join push; becomes the `join_ref`
    /// stamped on every outbound non-lifecycle frame (spec §3, invariant c).
    join_ref: Option<Ref>,
    push_buffer: VecDeque<BufferedPush>,
    pending_replies: std::collections::HashMap<Ref, oneshot::Sender<ReplyOutcome>>,
    rejoin_tries: u32,
    /// Bumped on every reset/leave/close so a sleeping rejoin task can tell
    /// it has gone stale without needing a pinned, shared timer (spec §8,
    /// timer hygiene).
    rejoin_epoch: u64,
}

/// A topic-scoped, cloneable handle. Cloning a `Channel` is cheap (it's a
/// handful of `Arc`s); all clones observe the same underlying state.
#[derive(Clone)]
pub struct Channel {
    topic: String,
    inner: Arc<Mutex<ChannelInner>>,
    events: EventBus<ChannelEvent>,
    socket: Weak<SocketShared>,
    default_timeout: Duration,
    rejoin_after: BackoffFn,
}

impl Channel {
    pub(crate) fn new(
        topic: String,
        params: Value,
        socket: Weak<SocketShared>,
        default_timeout: Duration,
        rejoin_after: BackoffFn,
    ) -> Self {
        Self {
            topic,
            inner: Arc::new(Mutex::new(ChannelInner {
                fsm: ChannelState::Closed,
                joined_once: false,
                params,
                join_ref: None,
                push_buffer: VecDeque::new(),
                pending_replies: std::collections::HashMap::new(),
                rejoin_tries: 0,
                rejoin_epoch: 0,
            })),
            events: EventBus::new(),
            socket,
            default_timeout,
            rejoin_after,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().unwrap().fsm
    }

    /// The `ref` of this channel's current join push, if it has ever joined.
    pub fn current_join_ref(&self) -> Option<Ref> {
        self.inner.lock().unwrap().join_ref
    }

    /// Replaces the params mirrored into every future join/rejoin payload.
    pub fn set_params(&self, params: Value) {
        self.inner.lock().unwrap().params = params;
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Joins the topic. May only be called once per `Channel` instance
    /// (spec §3, invariant a) — a second call is a programmer error.
    pub fn join(&self, timeout: Option<Duration>) -> Push {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            !inner.joined_once,
            "join() called more than once on channel {:?}",
            self.topic
        );
        inner.joined_once = true;
        inner.fsm = ChannelState::Joining;
        let timeout = timeout.unwrap_or(self.default_timeout);
        self.send_join_locked(&mut inner, timeout)
    }

    /// Leaves the topic, waiting for the server's acknowledgement (or its
    /// timeout) before completing. If the channel cannot currently be
    /// pushed to, completion is synthesized locally instead of waiting out
    /// the full timeout for nothing (spec §4.2).
    pub async fn leave(&self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(self.default_timeout);

        let already_closed = {
            let mut inner = self.inner.lock().unwrap();
            inner.rejoin_epoch = inner.rejoin_epoch.wrapping_add(1); // cancel any scheduled rejoin
            let already_closed = inner.fsm == ChannelState::Closed;
            if !already_closed {
                inner.fsm = ChannelState::Leaving;
            }
            already_closed
        };
        if already_closed {
            return;
        }

        let pushable = {
            let inner = self.inner.lock().unwrap();
            self.can_push_locked(&inner) && self.socket_is_connected()
        };

        if pushable {
            let push = self.dispatch_push(event::LEAVE, Value::Object(Default::default()), timeout);
            let _ = push.await; // ok or timeout both converge on a local close
        }

        self.finish_close();
    }

    /// Sends `event`/`payload` on this channel. Sent immediately if joined;
    /// buffered until the next successful join otherwise. Calling this
    /// before the first `join()` is a programmer error (spec §7).
    pub fn push(
        &self,
        event: impl Into<String>,
        payload: impl Into<Value>,
        timeout: Option<Duration>,
    ) -> Push {
        {
            let inner = self.inner.lock().unwrap();
            assert!(
                inner.joined_once,
                "push() called before join() on channel {:?}",
                self.topic
            );
        }
        self.dispatch_push(event, payload.into(), timeout.unwrap_or(self.default_timeout))
    }

    /// Re-enters `joining` after an error or a socket reconnect. No-op if
    /// currently leaving.
    pub async fn rejoin(&self, timeout: Option<Duration>) {
        {
            let inner = self.inner.lock().unwrap();
            if inner.fsm == ChannelState::Leaving {
                return;
            }
        }

        if let Some(socket) = self.socket() {
            socket.evict_duplicate_topics(&self.topic, self).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.fsm == ChannelState::Leaving {
            return;
        }
        inner.fsm = ChannelState::Joining;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let _ = self.send_join_locked(&mut inner, timeout);
    }

    /// Returns whether `msg` belongs to this channel (spec §4.2's
    /// `isMember`). Drops stale lifecycle events from a prior incarnation.
    pub(crate) fn is_member(&self, msg: &Message) -> bool {
        if msg.topic != self.topic {
            return false;
        }

        if let Some(join_ref) = msg.join_ref {
            let current = self.current_join_ref();
            if Some(join_ref) != current && event::is_lifecycle(&msg.event) {
                tracing::debug!(
                    topic = %self.topic,
                    %join_ref,
                    current = ?current,
                    event = %msg.event,
                    "dropping stale lifecycle event from a prior incarnation"
                );
                return false;
            }
        }

        true
    }

    pub(crate) fn handle_frame(&self, msg: &Message) {
        match msg.event.as_str() {
            event::REPLY => self.handle_reply(msg),
            event::ERROR => self.handle_phx_error(),
            event::CLOSE => self.finish_close(),
            _ => {
                self.events.emit(ChannelEvent::Message {
                    event: msg.event.clone(),
                    payload: msg.payload.clone(),
                });
            }
        }
    }

    /// Called by the socket when the transport itself closes or errors.
    /// Transitions to `errored` unless already errored/leaving/closed.
    pub(crate) fn handle_socket_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(
            inner.fsm,
            ChannelState::Errored | ChannelState::Leaving | ChannelState::Closed
        ) {
            return;
        }
        inner.fsm = ChannelState::Errored;
        inner.pending_replies.clear();
        drop(inner);
        self.events.emit(ChannelEvent::Error);
    }

    /// Called by the socket once a new transport is open. Rejoins if this
    /// channel was mid-join or errored when the connection dropped.
    pub(crate) async fn handle_socket_reopened(&self) {
        let needs_rejoin = matches!(
            self.inner.lock().unwrap().fsm,
            ChannelState::Errored | ChannelState::Joining
        );
        if needs_rejoin {
            self.rejoin(None).await;
        }
    }

    fn handle_reply(&self, msg: &Message) {
        let Some(ref_) = msg.ref_ else {
            tracing::warn!(topic = %self.topic, "discarding reply with no ref");
            return;
        };
        let Some(reply) = msg.as_reply() else {
            tracing::warn!(topic = %self.topic, "discarding malformed reply payload");
            return;
        };
        let outcome = if reply.is_ok() {
            ReplyOutcome::Ok(reply.response)
        } else {
            ReplyOutcome::Error(reply.response)
        };

        let (waiter, join_failed) = {
            let mut inner = self.inner.lock().unwrap();
            let waiter = inner.pending_replies.remove(&ref_);
            let mut join_failed = false;

            if inner.fsm == ChannelState::Joining && inner.join_ref == Some(ref_) {
                match &outcome {
                    ReplyOutcome::Ok(_) => self.transition_to_joined(&mut inner),
                    ReplyOutcome::Error(_) => {
                        inner.fsm = ChannelState::Errored;
                        self.maybe_schedule_rejoin(&mut inner);
                        join_failed = true;
                    }
                }
            }

            (waiter, join_failed)
        };

        if join_failed {
            self.events.emit(ChannelEvent::Error);
        }

        if let Some(tx) = waiter {
            let _ = tx.send(outcome);
        }
    }

    fn handle_phx_error(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.fsm {
            ChannelState::Joining => {
                if let (Some(join_ref), Some(socket)) = (inner.join_ref.take(), self.socket()) {
                    socket.forget_buffered(join_ref);
                }
                inner.fsm = ChannelState::Errored;
                inner.pending_replies.clear();
                self.maybe_schedule_rejoin(&mut inner);
            }
            ChannelState::Joined => {
                inner.fsm = ChannelState::Errored;
                inner.pending_replies.clear();
                self.maybe_schedule_rejoin(&mut inner);
            }
            _ => return,
        }
        drop(inner);
        self.events.emit(ChannelEvent::Error);
    }

    fn finish_close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.fsm = ChannelState::Closed;
            inner.pending_replies.clear();
            inner.push_buffer.clear();
            inner.rejoin_epoch = inner.rejoin_epoch.wrapping_add(1);
        }
        tracing::info!(topic = %self.topic, "channel closed");
        if let Some(socket) = self.socket() {
            socket.remove(self);
        }
        self.events.emit(ChannelEvent::Closed);
    }

    fn transition_to_joined(&self, inner: &mut ChannelInner) {
        inner.fsm = ChannelState::Joined;
        inner.rejoin_tries = 0;
        inner.rejoin_epoch = inner.rejoin_epoch.wrapping_add(1);
        tracing::info!(topic = %self.topic, "joined channel");

        let Some(socket) = self.socket() else {
            return;
        };
        let join_ref = inner.join_ref;
        while let Some(buffered) = inner.push_buffer.pop_front() {
            let ref_ = socket.make_ref();
            inner.pending_replies.insert(ref_, buffered.tx);
            socket.send(Message::new(
                join_ref,
                Some(ref_),
                self.topic.clone(),
                buffered.event,
                buffered.payload,
            ));
        }
    }

    fn maybe_schedule_rejoin(&self, inner: &mut ChannelInner) {
        if !self.socket_is_connected() {
            return; // stay silent; handle_socket_reopened() will rejoin later
        }

        inner.rejoin_tries += 1;
        let tries = inner.rejoin_tries;
        let epoch = inner.rejoin_epoch;
        let duration = (self.rejoin_after)(tries);

        let channel = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            channel.fire_rejoin_if_current(epoch).await;
        });
    }

    async fn fire_rejoin_if_current(&self, epoch: u64) {
        let should_fire = {
            let inner = self.inner.lock().unwrap();
            inner.rejoin_epoch == epoch && inner.fsm == ChannelState::Errored
        };
        if should_fire && self.socket_is_connected() {
            self.rejoin(None).await;
        }
    }

    fn send_join_locked(&self, inner: &mut ChannelInner, timeout: Duration) -> Push {
        let params = inner.params.clone();
        let Some(socket) = self.socket() else {
            return Push::already_failed(event::JOIN.to_owned(), params);
        };

        let ref_ = socket.make_ref();
        inner.join_ref = Some(ref_);

        let (tx, rx) = oneshot::channel();
        inner.pending_replies.insert(ref_, tx);

        let mut push = Push::pending(event::JOIN.to_owned(), params.clone(), timeout, rx);
        push.assign_ref(ref_);

        socket.send(Message::new(
            Some(ref_),
            Some(ref_),
            self.topic.clone(),
            event::JOIN,
            params,
        ));

        push
    }

    fn dispatch_push(&self, event: impl Into<String>, payload: Value, timeout: Duration) -> Push {
        let event = event.into();
        let mut inner = self.inner.lock().unwrap();

        let Some(socket) = self.socket() else {
            return Push::already_failed(event, payload);
        };

        let (tx, rx) = oneshot::channel();
        let mut push = Push::pending(event.clone(), payload.clone(), timeout, rx);

        if self.can_push_locked(&inner) && socket.is_connected() {
            let ref_ = socket.make_ref();
            push.assign_ref(ref_);
            inner.pending_replies.insert(ref_, tx);
            let join_ref = inner.join_ref;
            socket.send(Message::new(
                join_ref,
                Some(ref_),
                self.topic.clone(),
                event,
                payload,
            ));
        } else {
            inner.push_buffer.push_back(BufferedPush { event, payload, tx });
        }

        push
    }

    fn can_push_locked(&self, inner: &ChannelInner) -> bool {
        inner.fsm == ChannelState::Joined
    }

    fn socket(&self) -> Option<Socket> {
        self.socket.upgrade().map(Socket::from_shared)
    }

    fn socket_is_connected(&self) -> bool {
        self.socket().map(|s| s.is_connected()).unwrap_or(false)
    }
}
