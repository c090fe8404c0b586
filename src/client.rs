//! Client side of the multiplexer: pooled physical connections and the
//! `connect`/`open` handshake initiator.

use crate::{
    config::Config,
    error::{MuxError, Result},
    message::WireMessage,
    session::{FinishGuard, Role, Session, Transport, TransportState},
    stream::LogicalStream,
};
use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
    },
};

/// Close code given to a stream whose assigned id is already in use.
const PROTOCOL_ERROR: u16 = 1002;

/// Produces the physical connection for a base endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    async fn connect(&self, endpoint: &str, protocol: Option<&str>) -> Result<Self::Transport>;
}

/// Connects over plain WebSocket with `tokio_tungstenite::connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn connect(&self, endpoint: &str, protocol: Option<&str>) -> Result<Self::Transport> {
        let mut request = endpoint.into_client_request()?;
        if let Some(protocol) = protocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|_| MuxError::InvalidUrl(format!("bad sub-protocol {protocol:?}")))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!(%endpoint, ?protocol, "websocket connected");
        Ok(stream)
    }
}

pub(crate) struct ClientRole;

impl Role for ClientRole {
    fn name(&self) -> &'static str {
        "client"
    }

    fn on_open(&self, session: &Session, id: String, reference: String) {
        let Some(stream) = session.take_channel(&reference) else {
            tracing::warn!(session = session.id(), %id, %reference, "open for unknown reference dropped");
            return;
        };

        if session.contains_channel(&id) {
            tracing::error!(session = session.id(), %id, "server assigned an id already in use");
            stream.close(Some(PROTOCOL_ERROR), Some("duplicate channel id".to_string()));
            return;
        }

        if !stream.assign_channel_id(id.clone()) {
            // Closed while the handshake was in flight; release the server's end
            tracing::debug!(session = session.id(), channel = %id, "open for closed stream, releasing channel");
            if let Err(e) = session.enqueue(WireMessage::close(id.clone(), None, None)) {
                tracing::debug!(session = session.id(), channel = %id, "close frame not sent: {}", e);
            }
            return;
        }

        session.register_channel(stream.clone(), &id);
        if stream.is_closed() {
            // The close saw the id but ran before registration
            session.unregister_channel(&id, &stream);
            return;
        }

        tracing::debug!(session = session.id(), channel = %id, "channel open");
        stream.emit_open();
    }
}

/// One physical connection to a base endpoint, shared by every stream
/// opened through it.
#[derive(Debug, Clone)]
pub struct Client {
    session: Session,
    endpoint: String,
    protocol: Option<String>,
}

impl Client {
    /// Starts connecting in the background and returns at once.
    ///
    /// Streams may be opened right away; their `connect` frames go out
    /// when the transport is ready. Fails only on an invalid `config`.
    /// Must be called within a Tokio runtime.
    pub fn connect<C: Connector>(
        connector: Arc<C>,
        endpoint: impl Into<String>,
        protocol: Option<String>,
        config: Config,
    ) -> Result<Self> {
        let client = Self::pending(endpoint.into(), protocol, config)?;
        client.spawn_connect(connector);
        Ok(client)
    }

    /// Wraps an already connected transport.
    pub fn from_transport<T: Transport>(
        endpoint: impl Into<String>,
        transport: T,
        config: Config,
    ) -> Result<Self> {
        let client = Self::pending(endpoint.into(), None, config)?;
        client.session.attach(transport)?;
        Ok(client)
    }

    fn pending(endpoint: String, protocol: Option<String>, config: Config) -> Result<Self> {
        Ok(Self {
            session: Session::new(Arc::new(ClientRole), config)?,
            endpoint,
            protocol,
        })
    }

    fn spawn_connect<C: Connector>(&self, connector: Arc<C>) {
        let session = self.session.clone();
        let endpoint = self.endpoint.clone();
        let protocol = self.protocol.clone();

        // A connect abandoned halfway still closes the pending streams
        let guard = FinishGuard::new(session.clone());

        tokio::spawn(async move {
            match connector.connect(&endpoint, protocol.as_deref()).await {
                Ok(transport) => {
                    let attached = session.attach(transport);
                    guard.disarm();
                    if let Err(e) = attached {
                        tracing::debug!(%endpoint, "transport not attached: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!(%endpoint, "connect failed: {}", e);
                    session.fail(&e);
                }
            }
        });
    }

    /// Requests a new stream to `backend` on this connection.
    ///
    /// The stream is returned in the connecting state; its open event fires
    /// once the server answers.
    pub fn open_stream(&self, backend: &str) -> Result<LogicalStream> {
        let reference = self.session.unique_id()?;
        let stream = LogicalStream::pending(self.session.clone(), reference.clone());
        self.session.register_channel(stream.clone(), &reference);

        if let Err(e) = self
            .session
            .enqueue(WireMessage::connect(reference.clone(), backend))
        {
            self.session.take_channel(&reference);
            return Err(e);
        }

        tracing::debug!(session = self.session.id(), %reference, %backend, "stream requested");
        Ok(stream)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn close(&self) {
        self.session.close();
    }
}

/// Pooling key: connections are shared per base endpoint and sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub endpoint: String,
    pub protocol: Option<String>,
}

/// Lazily created clients, one per [`PoolKey`].
///
/// An entry leaves the pool when its physical connection closes; the next
/// request for that key connects again.
pub struct ClientPool<C: Connector> {
    connector: Arc<C>,
    config: Config,
    clients: Arc<DashMap<PoolKey, Client>>,
}

impl<C: Connector> ClientPool<C> {
    pub fn new(connector: C, config: Config) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
            clients: Arc::new(DashMap::new()),
        }
    }

    /// Opens a stream to the backend named by the last path segment of `url`.
    pub fn open(&self, url: &str, protocol: Option<&str>) -> Result<LogicalStream> {
        let (endpoint, backend) = split_url(url)?;
        let key = PoolKey {
            endpoint: endpoint.to_string(),
            protocol: protocol.map(str::to_string),
        };

        self.client_for(key)?.open_stream(backend)
    }

    /// The live pooled client for `key`, connecting a new one if needed.
    ///
    /// A connection that is closing counts as gone: it is replaced without
    /// waiting for the peer to finish the close handshake.
    pub fn client_for(&self, key: PoolKey) -> Result<Client> {
        let (client, fresh) = match self.clients.entry(key) {
            Entry::Occupied(entry) if is_usable(entry.get()) => (entry.get().clone(), false),
            Entry::Occupied(mut entry) => {
                let client = self.new_client(entry.key())?;
                entry.insert(client.clone());
                (client, true)
            }
            Entry::Vacant(entry) => {
                let client = self.new_client(entry.key())?;
                entry.insert(client.clone());
                (client, true)
            }
        };

        // Connect outside the shard lock; the closed hook removes the entry
        if fresh {
            client.spawn_connect(Arc::clone(&self.connector));
        }
        Ok(client)
    }

    fn new_client(&self, key: &PoolKey) -> Result<Client> {
        let client = Client::pending(key.endpoint.clone(), key.protocol.clone(), self.config.clone())?;

        let clients = Arc::downgrade(&self.clients);
        let session_id = client.session().id();
        let key = key.clone();
        client.session().on_closed(move || {
            if let Some(clients) = clients.upgrade() {
                clients.remove_if(&key, |_, client| client.session().id() == session_id);
                tracing::debug!(endpoint = %key.endpoint, "pooled connection removed");
            }
        });

        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn is_usable(client: &Client) -> bool {
    matches!(
        client.session().transport_state(),
        TransportState::Connecting | TransportState::Open
    )
}

impl ClientPool<WsConnector> {
    /// The process-wide pool behind [`crate::connect`].
    pub fn global() -> &'static ClientPool<WsConnector> {
        static GLOBAL: OnceLock<ClientPool<WsConnector>> = OnceLock::new();
        GLOBAL.get_or_init(|| ClientPool::new(WsConnector, Config::default()))
    }
}

/// Splits `url` into its base endpoint and the backend name in its final
/// path segment. Query and fragment are ignored.
///
/// ```
/// use chanmux::client::split_url;
///
/// let (endpoint, backend) = split_url("ws://localhost:9000/mux/echo/").unwrap();
/// assert_eq!(endpoint, "ws://localhost:9000/mux");
/// assert_eq!(backend, "echo");
/// ```
pub fn split_url(url: &str) -> Result<(&str, &str)> {
    let invalid = || MuxError::InvalidUrl(url.to_string());

    let authority_start = url.find("://").ok_or_else(invalid)? + 3;
    let path = url
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or(url)
        .trim_end_matches('/');

    let (endpoint, backend) = path.rsplit_once('/').ok_or_else(invalid)?;
    if endpoint.len() <= authority_start || backend.is_empty() {
        return Err(invalid());
    }
    Ok((endpoint, backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{OpenEvent, ReadyState},
        session::test_support::*,
    };
    use parking_lot::Mutex;
    use tokio::io::DuplexStream;

    #[test]
    fn test_split_url() {
        assert_eq!(split_url("ws://host/echo").unwrap(), ("ws://host", "echo"));
        assert_eq!(
            split_url("wss://host:443/a/b/chat?token=1#x").unwrap(),
            ("wss://host:443/a/b", "chat")
        );
        assert_eq!(split_url("ws://host/base//").unwrap(), ("ws://host", "base"));

        for bad in ["ws://host", "ws://host/", "host/echo", "ws:///echo", ""] {
            assert!(
                matches!(split_url(bad), Err(MuxError::InvalidUrl(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_open_moves_stream_from_reference_to_id() {
        let (session, outbound) = open_session_with_role(Arc::new(ClientRole), Config::default());
        let stream = LogicalStream::pending(session.clone(), "r1".to_string());
        session.register_channel(stream.clone(), "r1");

        let opened = Arc::new(Mutex::new(Vec::new()));
        {
            let opened = Arc::clone(&opened);
            stream.on_open(move |event| opened.lock().push(event.clone()));
        }

        session.route_inbound(WireMessage::open("c1", "r1"));

        assert_eq!(stream.channel_id().as_deref(), Some("c1"));
        assert_eq!(stream.ready_state(), ReadyState::Open);
        assert!(!session.contains_channel("r1"));
        assert!(session.contains_channel("c1"));
        assert_eq!(
            *opened.lock(),
            vec![OpenEvent {
                channel_id: "c1".to_string()
            }]
        );

        stream.send("hello").unwrap();
        assert_eq!(drain(&outbound), vec![WireMessage::data("c1", "hello")]);
    }

    #[test]
    fn test_open_for_unknown_reference_is_dropped() {
        let (session, outbound) = open_session_with_role(Arc::new(ClientRole), Config::default());

        session.route_inbound(WireMessage::open("c1", "nope"));

        assert_eq!(session.channel_count(), 0);
        assert!(drain(&outbound).is_empty());
    }

    #[test]
    fn test_open_with_duplicate_id_closes_new_stream() {
        let (session, outbound) = open_session_with_role(Arc::new(ClientRole), Config::default());
        let existing = LogicalStream::established(session.clone(), "c1".to_string());
        session.register_channel(existing.clone(), "c1");
        let pending = LogicalStream::pending(session.clone(), "r1".to_string());
        session.register_channel(pending.clone(), "r1");

        session.route_inbound(WireMessage::open("c1", "r1"));

        assert!(pending.is_closed());
        assert!(!existing.is_closed());
        assert_eq!(session.channel_count(), 1);
        assert!(drain(&outbound).is_empty());
    }

    #[test]
    fn test_open_for_stream_closed_mid_handshake_releases_channel() {
        let (session, outbound) = open_session_with_role(Arc::new(ClientRole), Config::default());
        let stream = LogicalStream::pending(session.clone(), "r1".to_string());
        session.register_channel(stream.clone(), "r1");
        stream.on_open(|_| panic!("closed stream must not open"));

        // Closed after the open frame was taken off the wire but before it was handled
        stream.close(None, None);
        session.register_channel(stream.clone(), "r1");
        session.route_inbound(WireMessage::open("c1", "r1"));

        assert_eq!(stream.channel_id(), None);
        assert_eq!(session.channel_count(), 0);
        assert_eq!(drain(&outbound), vec![WireMessage::close("c1", None, None)]);
    }

    #[test]
    fn test_close_racing_open_never_leaves_channel_registered() {
        for n in 0..2_000 {
            let (session, outbound) =
                open_session_with_role(Arc::new(ClientRole), Config::default());
            let stream = LogicalStream::pending(session.clone(), "r1".to_string());
            session.register_channel(stream.clone(), "r1");
            let id = format!("c{n}");
            let barrier = std::sync::Barrier::new(2);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    stream.close(None, None);
                });
                scope.spawn(|| {
                    barrier.wait();
                    session.route_inbound(WireMessage::open(id.clone(), "r1"));
                });
            });

            assert!(stream.is_closed());
            assert_eq!(session.channel_count(), 0, "left registered in round {n}");
            let frames = drain(&outbound);
            assert!(frames.len() <= 1, "round {n}: {frames:?}");
            assert!(
                frames
                    .iter()
                    .all(|frame| *frame == WireMessage::close(id.clone(), None, None))
            );
        }
    }

    #[test]
    fn test_server_frames_are_not_accepted_by_client() {
        let (session, outbound) = open_session_with_role(Arc::new(ClientRole), Config::default());

        session.route_inbound(WireMessage::connect("r1", "echo"));

        assert_eq!(session.channel_count(), 0);
        assert!(drain(&outbound).is_empty());
    }

    /// Never finishes connecting.
    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        type Transport = WebSocketStream<DuplexStream>;

        async fn connect(&self, _endpoint: &str, _protocol: Option<&str>) -> Result<Self::Transport> {
            std::future::pending().await
        }
    }

    /// Fails every connection attempt.
    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        type Transport = WebSocketStream<DuplexStream>;

        async fn connect(&self, endpoint: &str, _protocol: Option<&str>) -> Result<Self::Transport> {
            Err(MuxError::InvalidUrl(endpoint.to_string()))
        }
    }

    /// Connects, then the peer never reads or answers anything.
    #[derive(Default)]
    struct SilentPeerConnector {
        peers: Arc<Mutex<Vec<DuplexStream>>>,
    }

    #[async_trait]
    impl Connector for SilentPeerConnector {
        type Transport = WebSocketStream<DuplexStream>;

        async fn connect(&self, _endpoint: &str, _protocol: Option<&str>) -> Result<Self::Transport> {
            use tokio_tungstenite::tungstenite::protocol::Role as WsRole;

            let (io, peer) = tokio::io::duplex(64 * 1024);
            self.peers.lock().push(peer);
            Ok(WebSocketStream::from_raw_socket(io, WsRole::Client, None).await)
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[test]
    fn test_invalid_config_is_rejected_before_connecting() {
        let config = Config {
            channel_id_len: 1,
            ..Default::default()
        };

        let pool = ClientPool::new(StalledConnector, config.clone());
        assert!(matches!(pool.open("ws://host/echo", None), Err(MuxError::Config(_))));
        assert!(pool.is_empty());

        let client = Client::connect(Arc::new(StalledConnector), "ws://host", None, config);
        assert!(matches!(client, Err(MuxError::Config(_))));
    }

    #[tokio::test]
    async fn test_open_stream_before_transport_is_ready() {
        let client =
            Client::connect(Arc::new(StalledConnector), "ws://host", None, Config::default()).unwrap();

        let stream = client.open_stream("echo").unwrap();

        assert_eq!(stream.ready_state(), ReadyState::Connecting);
        assert_eq!(stream.channel_id(), None);
        assert_eq!(client.session().channel_count(), 1);
        assert!(matches!(stream.send("early"), Err(MuxError::HandshakePending)));
    }

    #[tokio::test]
    async fn test_open_stream_rejects_empty_backend() {
        let client =
            Client::connect(Arc::new(StalledConnector), "ws://host", None, Config::default()).unwrap();

        assert!(matches!(client.open_stream(""), Err(MuxError::InvalidMessage(_))));
        assert_eq!(client.session().channel_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_pending_streams() {
        let pool = ClientPool::new(RefusingConnector, Config::default());
        let stream = pool.open("ws://host/echo", None).unwrap();

        let (tx, rx) = flume::unbounded();
        {
            let tx = tx.clone();
            stream.on_error(move |event| {
                let _ = tx.send(format!("error: {}", event.message));
            });
        }
        stream.on_close(move |event| {
            let _ = tx.send(format!("close: {:?}", event.code));
        });

        let first = rx.recv_async().await.unwrap();
        let second = rx.recv_async().await.unwrap();
        assert!(first.starts_with("error: Invalid url"));
        assert_eq!(second, "close: Some(1006)");
        assert_eq!(stream.ready_state(), ReadyState::Closed);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_pool_shares_connection_per_key() {
        let pool = ClientPool::new(StalledConnector, Config::default());

        let a = pool.open("ws://host/base/echo", None).unwrap();
        let b = pool.open("ws://host/base/chat", None).unwrap();
        let c = pool.open("ws://host/base/echo", Some("v2")).unwrap();
        let d = pool.open("ws://other/base/echo", None).unwrap();

        assert_eq!(a.session().id(), b.session().id());
        assert_ne!(a.session().id(), c.session().id());
        assert_ne!(a.session().id(), d.session().id());
        assert_eq!(pool.len(), 3);
        assert_eq!(a.session().channel_count(), 2);
    }

    #[tokio::test]
    async fn test_pool_replaces_closed_connection() {
        let pool = ClientPool::new(StalledConnector, Config::default());
        let first = pool.open("ws://host/echo", None).unwrap();

        first.session().close();
        assert!(first.is_closed());
        assert!(pool.is_empty());

        let second = pool.open("ws://host/echo", None).unwrap();
        assert_ne!(first.session().id(), second.session().id());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_replaces_closing_connection() {
        let connector = SilentPeerConnector::default();
        let peers = Arc::clone(&connector.peers);
        let pool = ClientPool::new(connector, Config::default());
        let key = PoolKey {
            endpoint: "ws://host".to_string(),
            protocol: None,
        };

        let first = pool.open("ws://host/echo", None).unwrap();
        wait_for(|| first.session().transport_state() == TransportState::Open).await;

        // The peer never answers, so the close handshake never completes
        first.session().close();
        assert_eq!(first.session().transport_state(), TransportState::Closing);

        let second = pool.open("ws://host/echo", None).unwrap();
        assert_ne!(first.session().id(), second.session().id());
        assert_eq!(pool.len(), 1);
        wait_for(|| second.session().transport_state() == TransportState::Open).await;

        // The old connection finally dies without evicting its replacement
        drop(peers.lock().remove(0));
        wait_for(|| first.session().is_closed()).await;
        assert_eq!(pool.len(), 1);
        assert_eq!(
            pool.client_for(key).unwrap().session().id(),
            second.session().id()
        );
    }
}
