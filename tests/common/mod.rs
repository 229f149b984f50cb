//! A fake transport standing in for a real WebSocket (spec §8's "virtual
//! clock + fake transport" harness): each connection attempt is handed a
//! pre-wired pair of `tokio::sync::mpsc` channels, and the test drives the
//! "server" side directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use phoenix_channel::{Frame, ReadyState, Transport, TransportError, TransportFactory};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

pub struct FakeTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Tungstenite("test server dropped".into()))
    }

    async fn recv(&mut self) -> Result<Frame, TransportError> {
        match self.inbound.recv().await {
            Some(text) => Ok(Frame::Text(text)),
            None => Ok(Frame::Closed(None)),
        }
    }

    async fn close(&mut self, _code: u16, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ready_state(&self) -> ReadyState {
        if self.closed.load(Ordering::SeqCst) {
            ReadyState::Closed
        } else {
            ReadyState::Open
        }
    }
}

/// The test's view of one connection's `FakeTransport`: send frames the
/// client under test will receive, and observe frames it sends.
pub struct FakeServer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl FakeServer {
    pub fn send(&self, frame: Value) {
        self.to_client.send(frame.to_string()).expect("client dropped the transport");
    }

    pub async fn recv(&mut self) -> Value {
        let text = self.from_client.recv().await.expect("client disconnected");
        serde_json::from_str(&text).expect("client sent non-JSON text")
    }

    /// `true` if the client has at least one frame buffered without
    /// blocking the caller.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.from_client
            .try_recv()
            .ok()
            .map(|text| serde_json::from_str(&text).expect("client sent non-JSON text"))
    }
}

/// A [`TransportFactory`] that hands out `n` pre-wired `FakeTransport`s in
/// order, one per connect attempt, then fails every attempt after — enough
/// to drive both no-reconnect and bounded-reconnect scenarios.
pub fn sequential_transports(n: usize) -> (TransportFactory, Vec<FakeServer>) {
    let mut servers = Vec::with_capacity(n);
    let mut transports = VecDeque::with_capacity(n);

    for _ in 0..n {
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();

        servers.push(FakeServer {
            to_client: to_client_tx,
            from_client: from_client_rx,
        });
        transports.push_back(FakeTransport {
            inbound: to_client_rx,
            outbound: from_client_tx,
            closed: Arc::new(AtomicBool::new(false)),
        });
    }

    let transports = Arc::new(Mutex::new(transports));
    let factory: TransportFactory = Arc::new(move |_url: Url, _user_agent: String| {
        let transports = transports.clone();
        Box::pin(async move {
            transports
                .lock()
                .unwrap()
                .pop_front()
                .map(|t| Box::new(t) as Box<dyn Transport>)
                .ok_or(TransportError::Dns)
        })
    });

    (factory, servers)
}

pub fn single_transport() -> (TransportFactory, FakeServer) {
    let (factory, mut servers) = sequential_transports(1);
    (factory, servers.remove(0))
}
