//! The `Transport` contract `Socket` consumes (spec §4.5).
//!
//! An external WebSocket implementation upgrades `http`/`https` to
//! `ws`/`wss`, handles TLS, and speaks RFC 6455 framing; `Socket` only ever
//! sees text frames in and text frames out. This module also ships a
//! production implementation over `tokio-tungstenite`, grounded in the
//! teacher's `connect_websocket`/`make_socket` functions.

use std::net::SocketAddr;

use async_trait::async_trait;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{client_async_tls, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::TransportError;

/// The subset of RFC 6455 ready-states `Socket` needs to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What [`Transport::recv`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An inbound text frame.
    Text(String),
    /// The peer closed the connection, with its close code if the transport
    /// knows it (spec §4.1's close-status FSM keys off this code).
    Closed(Option<u16>),
}

/// An open, bidirectional text-frame connection.
///
/// Implementations are driven exclusively by `Socket`; channels never touch
/// a `Transport` directly (spec §5, "shared resources").
#[async_trait]
pub trait Transport: Send {
    /// Sends one text frame. Errors are treated as transient and drive a
    /// reconnect.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Waits for the next inbound text frame or the peer's close.
    ///
    /// Binary frames are logged and skipped by the caller rather than
    /// surfaced here.
    async fn recv(&mut self) -> Result<Frame, TransportError>;

    /// Best-effort graceful close; errors are ignored by the caller.
    async fn close(&mut self, code: u16, reason: &str);

    fn ready_state(&self) -> ReadyState;
}

/// Upgrades `http -> ws` and `https -> wss`; leaves `ws`/`wss` and any
/// unrecognized scheme untouched (spec §4.5).
pub fn upgrade_scheme(url: &mut Url) {
    match url.scheme() {
        "http" => {
            let _ = url.set_scheme("ws");
        }
        "https" => {
            let _ = url.set_scheme("wss");
        }
        _ => {}
    }
}

/// Factory used by `Socket` to obtain a fresh [`Transport`] on every
/// (re)connect attempt.
pub type TransportFactory = std::sync::Arc<
    dyn Fn(
            Url,
            String,
        ) -> futures::future::BoxFuture<'static, Result<Box<dyn Transport>, TransportError>>
        + Send
        + Sync,
>;

/// Builds the default [`TransportFactory`], backed by `tokio-tungstenite`.
pub fn default_transport_factory() -> TransportFactory {
    std::sync::Arc::new(|url, user_agent| {
        Box::pin(async move { TungsteniteTransport::connect(&url, &user_agent).await })
    })
}

/// Production [`Transport`] over a TLS-capable TCP socket, matching the
/// teacher's `connect_websocket`/`make_socket` helpers.
pub struct TungsteniteTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    state: ReadyState,
}

impl TungsteniteTransport {
    pub async fn connect(url: &Url, user_agent: &str) -> Result<Box<dyn Transport>, TransportError> {
        let socket = make_socket(url).await?;
        let request = make_request(url, user_agent)?;

        let (stream, _response) = client_async_tls(request, socket)
            .await
            .map_err(handshake_error)?;

        Ok(Box::new(Self {
            stream,
            state: ReadyState::Open,
        }))
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        use futures::SinkExt;

        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Tungstenite(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Frame, TransportError> {
        use futures::StreamExt;

        loop {
            return match self.stream.next().await {
                None => Ok(Frame::Closed(None)),
                Some(Ok(WsMessage::Text(text))) => Ok(Frame::Text(text)),
                Some(Ok(WsMessage::Close(frame))) => {
                    Ok(Frame::Closed(frame.map(|f| f.code.into())))
                }
                Some(Ok(_non_text)) => {
                    tracing::warn!("discarding non-text websocket frame");
                    continue;
                }
                Some(Err(e)) => Err(TransportError::Tungstenite(e.to_string())),
            };
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        use futures::SinkExt;

        let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code: code.into(),
            reason: reason.to_owned().into(),
        };
        let _ = self.stream.send(WsMessage::Close(Some(frame))).await;
        let _ = self.stream.close(None).await;
        self.state = ReadyState::Closed;
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }
}

/// Pulls the real HTTP status out of a handshake rejection so
/// `TransportError::client_error_status` can tell a 401/403 from the portal
/// apart from an ordinary transient connect failure (spec §4.1's "portal
/// rejected the connection" split).
fn handshake_error(e: WsError) -> TransportError {
    match e {
        WsError::Http(response) => {
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            TransportError::Handshake {
                status: response.status().as_u16(),
                body,
            }
        }
        other => TransportError::Tungstenite(other.to_string()),
    }
}

async fn make_socket(url: &Url) -> Result<TcpStream, TransportError> {
    let port = url.port_or_known_default().ok_or(TransportError::Dns)?;
    let addrs: Vec<SocketAddr> = match url.host() {
        Some(url::Host::Domain(domain)) => tokio::net::lookup_host((domain, port))
            .await
            .map_err(TransportError::Io)?
            .collect(),
        Some(url::Host::Ipv4(ip)) => vec![(ip, port).into()],
        Some(url::Host::Ipv6(ip)) => vec![(ip, port).into()],
        None => return Err(TransportError::Dns),
    };

    let mut last_error = None;
    for addr in addrs {
        let socket = match addr {
            SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4(),
            SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6(),
        }
        .map_err(TransportError::Io)?;

        match socket.connect(addr).await {
            Ok(stream) => {
                enable_tcp_keepalive(&stream);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.map(TransportError::Io).unwrap_or(TransportError::Dns))
}

/// Belt-and-suspenders alongside the application-level heartbeat: lets a
/// half-open connection (cable pulled, peer box powered off) get reaped by
/// the kernel instead of sitting silent until the next heartbeat timeout.
fn enable_tcp_keepalive(stream: &TcpStream) {
    let keepalive = socket2::TcpKeepalive::new().with_time(std::time::Duration::from_secs(60));
    if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "failed to enable TCP keepalive");
    }
}

fn make_request(url: &Url, user_agent: &str) -> Result<Request, TransportError> {
    let mut key_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut key_bytes);
    let key = base64::engine::general_purpose::STANDARD.encode(key_bytes);

    let uri: Uri = url
        .as_str()
        .parse()
        .map_err(|_| TransportError::Handshake {
            status: 0,
            body: "invalid uri".to_owned(),
        })?;

    Request::builder()
        .method("GET")
        .header("Host", url.host_str().unwrap_or_default())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", key)
        .header("User-Agent", user_agent)
        .uri(uri)
        .body(())
        .map_err(|e| TransportError::Handshake {
            status: 0,
            body: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_http_schemes_only() {
        let mut url = Url::parse("http://example.com/socket").unwrap();
        upgrade_scheme(&mut url);
        assert_eq!(url.scheme(), "ws");

        let mut url = Url::parse("https://example.com/socket").unwrap();
        upgrade_scheme(&mut url);
        assert_eq!(url.scheme(), "wss");

        let mut url = Url::parse("ws://example.com/socket").unwrap();
        upgrade_scheme(&mut url);
        assert_eq!(url.scheme(), "ws");

        let mut url = Url::parse("ftp://example.com/socket").unwrap();
        upgrade_scheme(&mut url);
        assert_eq!(url.scheme(), "ftp");
    }
}
