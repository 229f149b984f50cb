//! A client for the Phoenix Channels realtime protocol: socket
//! multiplexing, channel join/leave/rejoin, and request/reply pushes over a
//! single WebSocket.
//!
//! ```no_run
//! use std::time::Duration;
//! use phoenix_channel::{Endpoint, SocketBuilder};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoint = Endpoint::parse("wss://example.com/socket")?;
//! let socket = SocketBuilder::new(endpoint).build();
//! socket.connect();
//!
//! let room = socket.channel("room:lobby", json!({}));
//! room.join(None).await?;
//! room.push("shout", json!({"body": "hi"}), None).await?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod codec;
mod endpoint;
mod error;
mod events;
mod message;
mod push;
mod socket;
mod timer;
mod transport;

pub use channel::{Channel, ChannelState};
pub use codec::{Codec, JsonCodec};
pub use endpoint::{static_params, Endpoint, ParamsProvider};
pub use error::{CodecError, Error, PushError, TransportError};
pub use events::{ChannelEvent, SocketEvent};
pub use message::{event, Message, Ref};
pub use push::Push;
pub use socket::{Socket, SocketBuilder};
pub use timer::{default_reconnect_backoff, default_rejoin_backoff, BackoffFn};
pub use transport::{default_transport_factory, Frame, ReadyState, Transport, TransportFactory};
