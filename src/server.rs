//! Server side of the multiplexer: backend routing and the `open` reply.

use crate::{
    config::Config,
    error::Result,
    message::WireMessage,
    session::{Role, Session, Transport},
    stream::LogicalStream,
};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
};

/// Close code given to a stream nobody is left to accept.
const BACKEND_GONE: u16 = 1011;

/// Receives every new stream opened to one backend name.
pub trait Backend: Send + Sync + 'static {
    fn deliver(&self, stream: LogicalStream);
}

impl<F> Backend for F
where
    F: Fn(LogicalStream) + Send + Sync + 'static,
{
    fn deliver(&self, stream: LogicalStream) {
        self(stream)
    }
}

/// Creates an emitter-style backend: streams delivered to the sender come
/// out of [`Incoming::accept`] as connection events.
pub fn backend_channel() -> (StreamSender, Incoming) {
    let (tx, rx) = flume::unbounded();
    (StreamSender(tx), Incoming(rx))
}

#[derive(Clone)]
pub struct StreamSender(flume::Sender<LogicalStream>);

impl Backend for StreamSender {
    fn deliver(&self, stream: LogicalStream) {
        if let Err(flume::SendError(stream)) = self.0.send(stream) {
            tracing::warn!(channel = ?stream.channel_id(), "backend receiver dropped, closing stream");
            stream.close(Some(BACKEND_GONE), Some("backend unavailable".to_string()));
        }
    }
}

pub struct Incoming(flume::Receiver<LogicalStream>);

impl Incoming {
    /// Waits for the next stream; `None` once every sender is gone.
    pub async fn accept(&self) -> Option<LogicalStream> {
        self.0.recv_async().await.ok()
    }

    pub fn try_accept(&self) -> Option<LogicalStream> {
        self.0.try_recv().ok()
    }
}

/// The lookup key for a backend name: its last non-empty `/` segment.
///
/// ```
/// use chanmux::server::backend_key;
///
/// assert_eq!(backend_key("/mux/echo/"), "echo");
/// assert_eq!(backend_key("echo"), "echo");
/// ```
pub fn backend_key(name: &str) -> &str {
    name.rsplit('/').find(|segment| !segment.is_empty()).unwrap_or("")
}

/// Backend table consulted on every `connect`.
#[derive(Default)]
pub struct Backends {
    routes: HashMap<String, Arc<dyn Backend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, name: &str, backend: impl Backend) -> Self {
        let key = backend_key(name).to_string();
        if self.routes.insert(key.clone(), Arc::new(backend)).is_some() {
            tracing::warn!(backend = %key, "backend replaced");
        }
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.routes.get(backend_key(name)).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.routes.keys()).finish()
    }
}

struct ServerRole {
    backends: Arc<Backends>,
}

impl Role for ServerRole {
    fn name(&self) -> &'static str {
        "server"
    }

    fn on_connect(&self, session: &Session, reference: String, name: String) {
        let Some(backend) = self.backends.resolve(&name) else {
            tracing::warn!(session = session.id(), %reference, backend = %name, "no such backend, connect dropped");
            return;
        };

        let id = match session.unique_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(session = session.id(), %reference, "connect dropped: {}", e);
                return;
            }
        };
        // The peer must learn the id before the backend can write to it
        if let Err(e) = session.enqueue(WireMessage::open(id.clone(), reference)) {
            tracing::warn!(session = session.id(), channel = %id, "open not sent: {}", e);
            return;
        }

        let stream = LogicalStream::established(session.clone(), id.clone());
        session.register_channel(stream.clone(), &id);
        tracing::debug!(session = session.id(), channel = %id, backend = %name, "channel open");
        backend.deliver(stream);
    }
}

/// Accepts physical connections and serves the registered backends on them.
#[derive(Clone)]
pub struct Server {
    backends: Arc<Backends>,
    config: Config,
}

impl Server {
    pub fn new(backends: Backends, config: Config) -> Self {
        Self {
            backends: Arc::new(backends),
            config,
        }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Starts serving an accepted transport. Must be called within a Tokio runtime.
    pub fn accept<T: Transport>(&self, transport: T) -> Result<Session> {
        let role = ServerRole {
            backends: Arc::clone(&self.backends),
        };
        let session = Session::new(Arc::new(role), self.config.clone())?;
        session.attach(transport)?;
        tracing::info!(session = session.id(), "connection accepted");
        Ok(session)
    }

    /// Runs the WebSocket handshake for every TCP connection on `listener`
    /// and serves each one. Returns only if accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                match tokio_tungstenite::accept_hdr_async(socket, select_protocol).await {
                    Ok(transport) => {
                        if let Err(e) = server.accept(transport) {
                            tracing::error!(%peer, "failed to serve connection: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!(%peer, "websocket handshake failed: {}", e),
                }
            });
        }
    }
}

/// Accepts the first sub-protocol the client offers.
fn select_protocol(
    request: &Request,
    mut response: Response,
) -> std::result::Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty());

    if let Some(value) = offered.and_then(|protocol| HeaderValue::from_str(protocol).ok()) {
        response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(response)
}
