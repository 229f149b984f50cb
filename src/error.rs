use serde_json::Value;

/// Errors surfaced to applications through the socket event bus.
///
/// Mirrors the teacher's `Error`/`InternalError` split: recoverable,
/// transport-level problems never reach here (they drive the reconnect
/// loop internally); this enum is for outcomes the application must react
/// to.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("the configured endpoint could not be parsed as a URL")]
    MalformedUrl,

    #[error("the portal rejected the connection with a client error: {0}")]
    Client(u16),

    #[error("exceeded the configured maximum number of reconnect attempts")]
    MaxRetriesReached,

    #[error("the websocket handshake or connection failed: {0}")]
    Transport(String),
}

/// The failure taxonomy for a single [`crate::Push`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PushError {
    /// No reply arrived within the push's timeout.
    #[error("push of {event:?} timed out waiting for a reply")]
    Timeout { event: String, payload: Value },

    /// The transport (or the owning channel) went away before a reply
    /// arrived.
    #[error("the socket or channel was dropped before a reply arrived")]
    PushFailed,

    /// The server replied with `status: "error"`.
    #[error("server replied with an error: {0}")]
    Error(Value),
}

/// A [`crate::Transport`] implementation's failure mode. Public because
/// `Transport` itself is a trait applications can implement (e.g. a fake for
/// tests), so its method signatures must be fully nameable outside the
/// crate.
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Handshake { status: u16, body: String },
    Tungstenite(String),
    Dns,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "io error: {e}"),
            TransportError::Handshake { status, body } => {
                write!(f, "http error during handshake: {status} - {body}")
            }
            TransportError::Tungstenite(e) => write!(f, "websocket error: {e}"),
            TransportError::Dns => write!(f, "failed to resolve host"),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// A 4xx/5xx during the handshake is treated as fatal (teacher's
    /// `Error::Client` behavior), not retried through the back-off.
    pub(crate) fn client_error_status(&self) -> Option<u16> {
        match self {
            TransportError::Handshake { status, .. } if (400..500).contains(status) => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// A [`crate::Codec`] implementation's failure mode. Public for the same
/// reason as [`TransportError`]: `Codec` is an implementable trait.
#[derive(Debug)]
pub enum CodecError {
    Encode(serde_json::Error),
    Decode(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "failed to encode message: {e}"),
            CodecError::Decode(e) => write!(f, "failed to decode message: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}
