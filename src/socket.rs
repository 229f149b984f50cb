//! The connection-owning multiplexer (spec §4.1).
//!
//! `Socket` owns the one transport, the one heartbeat, the one reconnect
//! loop, and the registry of [`Channel`]s riding on top of it. Shared state
//! is a plain `std::sync::Mutex`-guarded struct with short critical
//! sections, not an actor — matching spec §5's "pick one pattern, not both".
//! The background work (connect, reconnect back-off, heartbeat, inbound
//! dispatch) lives in a single driver task spawned by [`Socket::connect`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tracing::Instrument;
use uuid::Uuid;

use crate::channel::{Channel, ChannelState};
use crate::codec::{default_codec, Codec};
use crate::endpoint::{static_params, Endpoint, ParamsProvider};
use crate::error::{Error, TransportError};
use crate::events::{EventBus, SocketEvent};
use crate::message::{Message, Ref, HEARTBEAT_TOPIC};
use crate::timer::{default_reconnect_backoff, default_rejoin_backoff, BackoffFn, HeartbeatTimer};
use crate::transport::{default_transport_factory, Frame, Transport, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The close-status FSM (spec §4.1): tracks *why* the transport most
/// recently went away, so the driver can tell a clean/temporary close
/// (don't reconnect) apart from an unknown/abnormal one (do).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseStatus {
    Unknown,
    Clean,
    Abnormal,
    Temporary,
}

impl CloseStatus {
    fn should_reconnect(self) -> bool {
        matches!(self, CloseStatus::Unknown | CloseStatus::Abnormal)
    }

    /// Applies a transport-reported close code. An `abnormal` status set by
    /// the client itself (heartbeat timeout) cannot be overridden by the
    /// close code that follows.
    fn observe_close_code(self, code: Option<u16>) -> Self {
        if self == CloseStatus::Abnormal {
            return self;
        }
        match code {
            Some(1000) => CloseStatus::Clean,
            Some(1001) => CloseStatus::Temporary,
            _ => CloseStatus::Abnormal,
        }
    }
}

struct SocketConfig {
    endpoint: Endpoint,
    params: ParamsProvider,
    vsn: String,
    heartbeat_interval: Duration,
    channel_timeout: Duration,
    reconnect_after: BackoffFn,
    rejoin_after: BackoffFn,
    transport_factory: TransportFactory,
    codec: Arc<dyn Codec>,
    user_agent: String,
    max_reconnect_attempts: Option<u32>,
    skip_heartbeat: bool,
    /// Stamped onto every log line the driver emits, so multiple sockets in
    /// the same process can be told apart in aggregated logs.
    instance_id: Uuid,
}

struct SocketState {
    channels: Vec<Channel>,
    send_buffer: VecDeque<Message>,
    next_ref: Ref,
    connection: ConnectionState,
    pending_heartbeat_ref: Option<Ref>,
    close_status: CloseStatus,
}

pub(crate) struct SocketShared {
    config: SocketConfig,
    state: Mutex<SocketState>,
    events: EventBus<SocketEvent>,
    notify: Notify,
    shutdown: AtomicBool,
    running: AtomicBool,
}

impl SocketShared {
    pub(crate) fn make_ref(&self) -> Ref {
        let mut state = self.state.lock().unwrap();
        let ref_ = state.next_ref;
        state.next_ref = state.next_ref.wrapping_next();
        ref_
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connection == ConnectionState::Connected
    }

    fn close_status(&self) -> CloseStatus {
        self.state.lock().unwrap().close_status
    }

    fn set_close_status(&self, status: CloseStatus) {
        self.state.lock().unwrap().close_status = status;
    }

    pub(crate) fn send(&self, message: Message) {
        self.state.lock().unwrap().send_buffer.push_back(message);
        self.notify.notify_one();
    }

    /// Removes a buffered (not-yet-sent) frame by `ref`, used to drop a
    /// join push that errored before it ever reached the wire (spec §4.2).
    pub(crate) fn forget_buffered(&self, ref_: Ref) {
        self.state
            .lock()
            .unwrap()
            .send_buffer
            .retain(|m| m.ref_ != Some(ref_));
    }

    pub(crate) fn remove(&self, channel: &Channel) {
        self.state.lock().unwrap().channels.retain(|c| !c.ptr_eq(channel));
    }

    /// Leaves every other channel on `topic` that is still joining or
    /// joined (spec §4.2's duplicate-topic eviction, run before a rejoin).
    pub(crate) async fn evict_duplicate_topics(&self, topic: &str, except: &Channel) {
        let duplicates: Vec<Channel> = {
            let state = self.state.lock().unwrap();
            state
                .channels
                .iter()
                .filter(|c| {
                    c.topic() == topic
                        && !c.ptr_eq(except)
                        && matches!(c.state(), ChannelState::Joining | ChannelState::Joined)
                })
                .cloned()
                .collect()
        };

        for duplicate in duplicates {
            duplicate.leave(None).await;
        }
    }

    fn snapshot_channels(&self) -> Vec<Channel> {
        self.state.lock().unwrap().channels.clone()
    }

    fn set_connection(&self, connection: ConnectionState) {
        self.state.lock().unwrap().connection = connection;
    }

    async fn on_open(self: &Arc<Self>) {
        for channel in self.snapshot_channels() {
            channel.handle_socket_reopened().await;
        }
    }

    fn on_close(&self) {
        self.state.lock().unwrap().pending_heartbeat_ref = None;
        for channel in self.snapshot_channels() {
            channel.handle_socket_closed();
        }
    }

    async fn write_frame(&self, transport: &mut dyn Transport, msg: &Message) -> Result<(), TransportError> {
        let text = self
            .config
            .codec
            .encode(msg)
            .map_err(|e| TransportError::Tungstenite(e.to_string()))?;
        transport.send(text).await
    }

    /// Attempts each queued frame in order. A send failure mid-drain leaves
    /// the remainder queued for the next connection (the frame that failed
    /// is lost, same as any in-flight frame on a dropped TCP connection); an
    /// encode failure is logged and swallowed so one malformed payload does
    /// not block everything behind it (spec §4.1's onOpen).
    async fn flush_send_buffer(&self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        loop {
            let next = self.state.lock().unwrap().send_buffer.pop_front();
            let Some(msg) = next else { return Ok(()) };

            let text = match self.config.codec.encode(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping frame that failed to encode");
                    continue;
                }
            };
            transport.send(text).await?;
        }
    }

    async fn handle_inbound(&self, text: String) {
        let msg = match self.config.codec.decode(&text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "discarding undecodable frame");
                return;
            }
        };

        if msg.topic == HEARTBEAT_TOPIC && msg.is_reply() {
            let mut state = self.state.lock().unwrap();
            if state.pending_heartbeat_ref == msg.ref_ {
                state.pending_heartbeat_ref = None;
            }
            return;
        }

        self.events.emit(SocketEvent::MessageReceived {
            topic: msg.topic.clone(),
            event: msg.event.clone(),
        });

        for channel in self.snapshot_channels() {
            if channel.is_member(&msg) {
                channel.handle_frame(&msg);
            }
        }
    }
}

/// Builds a [`Socket`]. Every setter is optional; [`SocketBuilder::new`]
/// alone is enough to get a working client using the JSON codec and a
/// `tokio-tungstenite` transport.
pub struct SocketBuilder {
    endpoint: Endpoint,
    params: ParamsProvider,
    vsn: String,
    heartbeat_interval: Duration,
    channel_timeout: Duration,
    reconnect_after: BackoffFn,
    rejoin_after: BackoffFn,
    transport_factory: TransportFactory,
    codec: Arc<dyn Codec>,
    user_agent: String,
    max_reconnect_attempts: Option<u32>,
    skip_heartbeat: bool,
}

impl SocketBuilder {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            params: static_params(BTreeMap::new()),
            vsn: "2.0.0".to_owned(),
            heartbeat_interval: Duration::from_secs(30),
            channel_timeout: Duration::from_secs(10),
            reconnect_after: default_reconnect_backoff(),
            rejoin_after: default_rejoin_backoff(),
            transport_factory: default_transport_factory(),
            codec: default_codec(),
            user_agent: concat!("phoenix-channel/", env!("CARGO_PKG_VERSION")).to_owned(),
            max_reconnect_attempts: None,
            skip_heartbeat: false,
        }
    }

    pub fn params(mut self, params: ParamsProvider) -> Self {
        self.params = params;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = timeout;
        self
    }

    pub fn reconnect_after(mut self, f: BackoffFn) -> Self {
        self.reconnect_after = f;
        self
    }

    pub fn rejoin_after(mut self, f: BackoffFn) -> Self {
        self.rejoin_after = f;
        self
    }

    pub fn transport_factory(mut self, f: TransportFactory) -> Self {
        self.transport_factory = f;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Gives up (emitting [`Error::MaxRetriesReached`]) after this many
    /// failed reconnect attempts, instead of retrying forever.
    pub fn max_reconnect_attempts(mut self, n: u32) -> Self {
        self.max_reconnect_attempts = Some(n);
        self
    }

    /// Disables heartbeats entirely: no ticks sent, no missed-heartbeat
    /// disconnects.
    pub fn skip_heartbeat(mut self, skip: bool) -> Self {
        self.skip_heartbeat = skip;
        self
    }

    pub fn build(self) -> Socket {
        let shared = Arc::new(SocketShared {
            config: SocketConfig {
                endpoint: self.endpoint,
                params: self.params,
                vsn: self.vsn,
                heartbeat_interval: self.heartbeat_interval,
                channel_timeout: self.channel_timeout,
                reconnect_after: self.reconnect_after,
                rejoin_after: self.rejoin_after,
                transport_factory: self.transport_factory,
                codec: self.codec,
                user_agent: self.user_agent,
                max_reconnect_attempts: self.max_reconnect_attempts,
                skip_heartbeat: self.skip_heartbeat,
                instance_id: Uuid::new_v4(),
            },
            state: Mutex::new(SocketState {
                channels: Vec::new(),
                send_buffer: VecDeque::new(),
                next_ref: Ref::ZERO,
                connection: ConnectionState::Disconnected,
                pending_heartbeat_ref: None,
                close_status: CloseStatus::Unknown,
            }),
            events: EventBus::new(),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            running: AtomicBool::new(false),
        });

        Socket(shared)
    }
}

/// A cloneable handle to a socket connection. All clones share the same
/// connection, channel registry, and background driver task.
#[derive(Clone)]
pub struct Socket(Arc<SocketShared>);

impl Socket {
    pub(crate) fn from_shared(inner: Arc<SocketShared>) -> Self {
        Socket(inner)
    }

    /// Starts the background driver task. A no-op while the driver is
    /// already running, but safe to call again after [`Socket::disconnect`]
    /// (or after the close-status FSM itself stopped reconnecting) — the
    /// driver resets its own `running` flag on exit (spec §3's `connect()`:
    /// "no-op if already open", not "no-op forever after the first call").
    pub fn connect(&self) {
        if self.0.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.shutdown.store(false, Ordering::SeqCst);
        let shared = self.0.clone();
        let span = tracing::info_span!("phoenix_socket", instance_id = %shared.config.instance_id);
        tokio::spawn(async move { run(shared).await }.instrument(span));
    }

    /// Requests a graceful shutdown: the driver closes the transport (if
    /// any) and exits instead of reconnecting. Registered channels are
    /// notified via `handle_socket_closed` as usual. A later call to
    /// [`Socket::connect`] starts a fresh driver task.
    pub fn disconnect(&self) {
        self.0.shutdown.store(true, Ordering::SeqCst);
        self.0.set_close_status(CloseStatus::Clean);
        self.0.notify.notify_one();
    }

    pub fn is_connected(&self) -> bool {
        self.0.is_connected()
    }

    /// Registers a new channel for `topic`. The channel starts `closed`;
    /// call [`Channel::join`] to actually join it.
    pub fn channel(&self, topic: impl Into<String>, params: Value) -> Channel {
        let channel = Channel::new(
            topic.into(),
            params,
            Arc::downgrade(&self.0),
            self.0.config.channel_timeout,
            self.0.config.rejoin_after.clone(),
        );
        self.0.state.lock().unwrap().channels.push(channel.clone());
        channel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.0.events.subscribe()
    }

    pub(crate) fn make_ref(&self) -> Ref {
        self.0.make_ref()
    }

    pub(crate) fn send(&self, message: Message) {
        self.0.send(message)
    }

    pub(crate) fn remove(&self, channel: &Channel) {
        self.0.remove(channel)
    }

    pub(crate) fn forget_buffered(&self, ref_: Ref) {
        self.0.forget_buffered(ref_)
    }

    pub(crate) async fn evict_duplicate_topics(&self, topic: &str, except: &Channel) {
        self.0.evict_duplicate_topics(topic, except).await
    }
}

async fn run(shared: Arc<SocketShared>) {
    let mut reconnect_tries: u32 = 0;
    shared.set_close_status(CloseStatus::Unknown);

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        shared.set_connection(ConnectionState::Connecting);
        let params = (shared.config.params)();
        let url = shared.config.endpoint.build(&shared.config.vsn, &params);

        match (shared.config.transport_factory)(url, shared.config.user_agent.clone()).await {
            Ok(mut transport) => {
                reconnect_tries = 0;
                shared.set_close_status(CloseStatus::Unknown); // onOpen: clear close_status
                shared.set_connection(ConnectionState::Connected);
                tracing::info!(host = %shared.config.endpoint.host(), "socket connected");
                shared.events.emit(SocketEvent::Opened);
                shared.on_open().await;

                run_session(&shared, transport.as_mut()).await;

                shared.set_connection(ConnectionState::Disconnected);
                shared.events.emit(SocketEvent::Closed);
                shared.on_close();
            }
            Err(err) => {
                if let Some(status) = err.client_error_status() {
                    tracing::error!(status, "portal rejected the connection, giving up");
                    shared
                        .events
                        .emit(SocketEvent::Errored(Error::Client(status).to_string()));
                    shared.set_connection(ConnectionState::Disconnected);
                    shared.on_close();
                    break;
                }

                tracing::warn!(error = %err, "failed to connect");
                shared.events.emit(SocketEvent::Errored(err.to_string()));
                shared.set_connection(ConnectionState::Disconnected);
                shared.on_close();
            }
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        if !shared.close_status().should_reconnect() {
            tracing::info!(
                close_status = ?shared.close_status(),
                "not reconnecting: close status does not call for it"
            );
            break;
        }

        reconnect_tries += 1;
        if let Some(max) = shared.config.max_reconnect_attempts {
            if reconnect_tries > max {
                tracing::error!("exceeded the configured maximum reconnect attempts");
                shared
                    .events
                    .emit(SocketEvent::Errored(Error::MaxRetriesReached.to_string()));
                break;
            }
        }

        let delay = (shared.config.reconnect_after)(reconnect_tries);
        tracing::debug!(?delay, tries = reconnect_tries, "scheduling reconnect");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.notify.notified() => {}
        }
    }

    shared.set_connection(ConnectionState::Disconnected);
    shared.running.store(false, Ordering::SeqCst);
}

/// Drives one live connection until the transport closes, errors, or a
/// shutdown is requested.
async fn run_session(shared: &Arc<SocketShared>, transport: &mut dyn Transport) {
    let mut heartbeat = HeartbeatTimer::new(shared.config.heartbeat_interval);
    if !shared.config.skip_heartbeat {
        heartbeat.start();
    }

    // Anything buffered while disconnected (or left over from a dropped
    // connection) goes out before we wait on anything else.
    if let Err(e) = shared.flush_send_buffer(transport).await {
        tracing::warn!(error = %e, "failed to flush send buffer on connect");
        return;
    }

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            transport.close(1000, "going away").await;
            return;
        }

        tokio::select! {
            _ = shared.notify.notified() => {}

            () = heartbeat.tick() => {
                let missed = shared.state.lock().unwrap().pending_heartbeat_ref.take();
                if let Some(missed_ref) = missed {
                    tracing::warn!(%missed_ref, "missed heartbeat reply, disconnecting");
                    // Set directly, not via `observe_close_code`: this is the
                    // abnormal status's origin, and it must survive whatever
                    // close code the transport reports for this same close
                    // (spec §4.1, "cannot be overridden").
                    shared.set_close_status(CloseStatus::Abnormal);
                    transport.close(1000, "heartbeat timeout").await;
                    return;
                }

                let ref_ = shared.make_ref();
                shared.state.lock().unwrap().pending_heartbeat_ref = Some(ref_);
                let msg = Message::heartbeat(ref_);
                if let Err(e) = shared.write_frame(transport, &msg).await {
                    tracing::warn!(error = %e, "heartbeat send failed");
                    return;
                }
            }

            result = transport.recv() => {
                match result {
                    Ok(Frame::Text(text)) => shared.handle_inbound(text).await,
                    Ok(Frame::Closed(code)) => {
                        tracing::info!(?code, "transport closed by peer");
                        let status = shared.close_status().observe_close_code(code);
                        shared.set_close_status(status);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "transport error");
                        let status = shared.close_status().observe_close_code(None);
                        shared.set_close_status(status);
                        return;
                    }
                }
            }
        }

        if let Err(e) = shared.flush_send_buffer(transport).await {
            tracing::warn!(error = %e, "failed to flush send buffer");
            return;
        }
    }
}
