//! Many logical channels over one WebSocket connection.
//!
//! A client asks for a stream to a named backend with [`connect`] (or a
//! [`ClientPool`]); every stream to the same base endpoint shares one
//! physical connection. The server side routes each new stream to the
//! backend registered under that name in [`Backends`].

pub mod channel_id;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod server;
pub mod session;
pub mod stream;

pub use channel_id::ChannelIdGenerator;
pub use client::{Client, ClientPool, Connector, PoolKey, WsConnector};
pub use codec::Codec;
pub use config::{Config, ConfigBuilder};
pub use error::{MuxError, Result};
pub use event::{CloseEvent, ErrorEvent, ListenerId, MessageEvent, OpenEvent, ReadyState};
pub use message::{MessageKind, Payload, WireMessage};
pub use server::{Backend, Backends, Incoming, Server, StreamSender, backend_channel};
pub use session::{ConnectionEvent, Session, Transport, TransportState};
pub use stream::LogicalStream;

/// Opens a stream to the backend named by the last path segment of `url`,
/// sharing the process-wide connection to its base endpoint.
///
/// Returns immediately; the stream's open event fires once the server
/// accepts it. Must be called within a Tokio runtime.
pub fn connect(url: &str, protocol: Option<&str>) -> Result<LogicalStream> {
    ClientPool::global().open(url, protocol)
}
