use crate::{
    channel_id::ChannelIdGenerator,
    codec::Codec,
    config::Config,
    error::{MuxError, Result},
    event::{CloseEvent, ErrorEvent},
    message::{MessageKind, WireMessage},
    stream::LogicalStream,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::{
    self, Message, Utf8Bytes,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;

/// A physical, message-framed, full-duplex connection.
///
/// Implemented for every `Stream + Sink` of WebSocket messages, which
/// includes `tokio_tungstenite::WebSocketStream` over any socket.
pub trait Transport:
    Stream<Item = std::result::Result<Message, tungstenite::Error>>
    + Sink<Message, Error = tungstenite::Error>
    + Send
    + Unpin
    + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = std::result::Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + Unpin
        + 'static
{
}

/// Readiness of the physical connection underneath a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransportState::Connecting,
            1 => TransportState::Open,
            2 => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }
}

/// Connection-level events fanned out to every live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error(ErrorEvent),
    Closed(CloseEvent),
}

/// Role-specific handling of the handshake frames.
///
/// The client answers `open`, the server answers `connect`; whatever a role
/// does not expect is logged and dropped.
pub(crate) trait Role: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn on_connect(&self, _session: &Session, reference: String, name: String) {
        tracing::warn!(role = self.name(), %reference, %name, "unexpected connect frame dropped");
    }

    fn on_open(&self, _session: &Session, id: String, reference: String) {
        tracing::warn!(role = self.name(), %id, %reference, "unexpected open frame dropped");
    }
}

enum Outbound {
    Frame(Message),
    Shutdown,
}

type ClosedHook = Box<dyn FnOnce() + Send>;

/// The multiplexer engine for one physical connection.
///
/// Owns the channel registry, routes inbound frames to their channel and
/// fans connection-level events out to every channel. Client and server
/// sessions differ only in the role they were built with.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    role: Arc<dyn Role>,
    config: Arc<Config>,
    codec: Codec,
    ids: ChannelIdGenerator,
    /// Live channels by channel id, or by temporary reference while a client handshake is pending
    channels: DashMap<String, LogicalStream>,
    /// Sender for outgoing frames (to send_loop)
    frame_tx: flume::Sender<Outbound>,
    /// Taken by `attach`; frames queued before then are flushed first
    frame_rx: Mutex<Option<flume::Receiver<Outbound>>>,
    state: AtomicU8,
    shutdown: CancellationToken,
    closed_hooks: Mutex<Option<Vec<ClosedHook>>>,
}

impl Session {
    pub(crate) fn new(role: Arc<dyn Role>, config: Config) -> Result<Self> {
        static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

        config.validate()?;

        let (frame_tx, frame_rx) = flume::unbounded();
        let inner = SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            codec: Codec::new(&config),
            ids: ChannelIdGenerator::new(config.channel_id_len),
            config: Arc::new(config),
            channels: DashMap::new(),
            frame_tx,
            frame_rx: Mutex::new(Some(frame_rx)),
            state: AtomicU8::new(TransportState::Connecting as u8),
            shutdown: CancellationToken::new(),
            closed_hooks: Mutex::new(Some(Vec::new())),
        };

        Ok(Session {
            inner: Arc::new(inner),
        })
    }

    /// Process-unique identifier of this session.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn transport_state(&self) -> TransportState {
        TransportState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.transport_state() == TransportState::Closed
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn contains_channel(&self, id: &str) -> bool {
        self.inner.channels.contains_key(id)
    }

    /// Starts driving `transport`: spawns the receive and send loops.
    ///
    /// Frames queued while the session was connecting go out first, in the
    /// order they were queued. Must be called within a Tokio runtime.
    pub fn attach<T: Transport>(&self, transport: T) -> Result<()> {
        let frame_rx = self
            .inner
            .frame_rx
            .lock()
            .take()
            .ok_or(MuxError::AlreadyAttached)?;

        self.inner
            .state
            .compare_exchange(
                TransportState::Connecting as u8,
                TransportState::Open as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| MuxError::SessionClosed)?;

        tracing::debug!(session = self.id(), role = self.inner.role.name(), "transport attached");

        let (sink, stream) = transport.split();

        let recv_session = self.clone();
        let guard = FinishGuard::new(self.clone());
        tokio::spawn(async move {
            let _guard = guard;
            recv_loop(stream, recv_session).await;
        });

        let send_session = self.clone();
        tokio::spawn(async move {
            send_loop(sink, frame_rx, send_session).await;
        });

        Ok(())
    }

    /// Closes the physical connection.
    ///
    /// A live transport goes through the WebSocket close handshake and every
    /// channel is closed once it completes. A session still connecting is
    /// closed on the spot.
    pub fn close(&self) {
        let closing = self.inner.state.compare_exchange(
            TransportState::Open as u8,
            TransportState::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        match closing {
            Ok(_) => {
                if self.inner.frame_tx.send(Outbound::Shutdown).is_err() {
                    self.finish(CloseEvent::abnormal(None));
                }
            }
            Err(state) if state == TransportState::Connecting as u8 => {
                self.finish(CloseEvent::new(Some(1000), None));
            }
            Err(_) => {}
        }
    }

    /// Registers a hook run once the physical connection is gone.
    ///
    /// Runs immediately if the session is already closed.
    pub fn on_closed(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.inner.closed_hooks.lock();
        if let Some(hooks) = hooks.as_mut() {
            hooks.push(Box::new(hook));
            return;
        }
        drop(hooks);
        hook();
    }

    /// Installs `stream` under `id` in the channel registry.
    ///
    /// Returns `false`, leaving the registry untouched, if another channel
    /// already holds the id.
    pub(crate) fn register_channel(&self, stream: LogicalStream, id: &str) -> bool {
        match self.inner.channels.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::error!(session = self.id(), channel = %id, "channel id already registered");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(stream);
                true
            }
        }
    }

    /// Removes the entry for `id` if it still belongs to `stream`.
    pub(crate) fn unregister_channel(&self, id: &str, stream: &LogicalStream) {
        self.inner
            .channels
            .remove_if(id, |_, registered| registered.ptr_eq(stream));
    }

    pub(crate) fn take_channel(&self, id: &str) -> Option<LogicalStream> {
        self.inner.channels.remove(id).map(|(_, stream)| stream)
    }

    fn lookup(&self, id: &str) -> Option<LogicalStream> {
        // Clone out so no shard lock is held while the channel runs listeners
        self.inner.channels.get(id).map(|entry| entry.value().clone())
    }

    /// A fresh id not currently used by any channel on this connection.
    pub(crate) fn unique_id(&self) -> Result<String> {
        self.inner
            .ids
            .next_unused(|id| self.inner.channels.contains_key(id))
            .ok_or(MuxError::IdSpaceExhausted(ChannelIdGenerator::MAX_DRAWS))
    }

    /// Encodes `message` and queues it for the send loop.
    pub(crate) fn enqueue(&self, message: WireMessage) -> Result<()> {
        match self.transport_state() {
            TransportState::Closing | TransportState::Closed => {
                return Err(MuxError::SessionClosed);
            }
            TransportState::Connecting | TransportState::Open => {}
        }

        let frame = self.inner.codec.encode(&message)?;
        tracing::trace!(session = self.id(), kind = %message.kind(), "frame queued");
        self.inner
            .frame_tx
            .send(Outbound::Frame(frame))
            .map_err(|_| MuxError::SessionClosed)
    }

    /// Dispatches one decoded inbound frame.
    ///
    /// `data` and `close` go to the registered channel; a frame for an
    /// unknown channel is logged and dropped. Handshake frames go to the role.
    pub fn route_inbound(&self, message: WireMessage) {
        match message {
            WireMessage::Connect { reference, name } => {
                self.inner.role.on_connect(self, reference, name);
            }
            WireMessage::Open { id, reference } => {
                self.inner.role.on_open(self, id, reference);
            }
            WireMessage::Data { .. } | WireMessage::Close { .. } => {
                let kind = message.kind();
                let id = message.channel_id().unwrap_or_default().to_string();
                match self.lookup(&id) {
                    Some(stream) => stream.handle_frame(message),
                    None if kind == MessageKind::Close => {
                        // Usually the peer acknowledging a close we initiated
                        tracing::debug!(session = self.id(), channel = %id, "close for unknown channel dropped");
                    }
                    None => {
                        tracing::warn!(session = self.id(), channel = %id, "data for unknown channel dropped");
                    }
                }
            }
        }
    }

    /// Notifies every live channel of a connection-level event.
    ///
    /// A close also closes each channel and empties the registry, so no
    /// channel outlives its transport.
    pub fn propagate_connection_event(&self, event: ConnectionEvent) {
        let streams: Vec<LogicalStream> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        match event {
            ConnectionEvent::Error(error) => {
                for stream in &streams {
                    stream.emit_error(error.clone());
                }
            }
            ConnectionEvent::Closed(close) => {
                for stream in &streams {
                    stream.close(close.code, close.reason.clone());
                }
                self.inner.channels.clear();
            }
        }
    }

    /// Marks the transport as failed before it could be attached.
    pub(crate) fn fail(&self, error: &MuxError) {
        self.propagate_connection_event(ConnectionEvent::Error(ErrorEvent::new(error.to_string())));
        self.finish(CloseEvent::abnormal(Some(error.to_string())));
    }

    fn mark_closing(&self) {
        let _ = self.inner.state.compare_exchange(
            TransportState::Open as u8,
            TransportState::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    #[cfg(test)]
    fn set_state(&self, state: TransportState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    /// Final teardown; only the first call has any effect.
    fn finish(&self, event: CloseEvent) {
        let previous = self
            .inner
            .state
            .swap(TransportState::Closed as u8, Ordering::SeqCst);
        if previous == TransportState::Closed as u8 {
            return;
        }

        tracing::info!(
            session = self.id(),
            role = self.inner.role.name(),
            code = ?event.code,
            channels = self.channel_count(),
            "session closed"
        );

        self.inner.shutdown.cancel();
        self.propagate_connection_event(ConnectionEvent::Closed(event));

        let hooks = self.inner.closed_hooks.lock().take().unwrap_or_default();
        for hook in hooks {
            hook();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role.name())
            .field("state", &self.transport_state())
            .field("channels", &self.channel_count())
            .finish()
    }
}

/// Finishes the session with an abnormal close when dropped while armed.
///
/// Held by the tasks driving a session, so a task that is torn down without
/// running to completion, for instance when its runtime shuts down, still
/// closes every channel and runs the closed hooks.
pub(crate) struct FinishGuard(Option<Session>);

impl FinishGuard {
    pub(crate) fn new(session: Session) -> Self {
        Self(Some(session))
    }

    /// Hands responsibility for the session to someone else.
    pub(crate) fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            if !session.is_closed() {
                tracing::warn!(session = session.id(), "session task dropped before the connection closed");
            }
            session.finish(CloseEvent::abnormal(None));
        }
    }
}

fn close_event_from(frame: Option<CloseFrame>) -> CloseEvent {
    match frame {
        Some(frame) => {
            let reason = frame.reason.as_str();
            CloseEvent::new(
                Some(u16::from(frame.code)),
                (!reason.is_empty()).then(|| reason.to_string()),
            )
        }
        None => CloseEvent::new(Some(CloseEvent::NO_STATUS), None),
    }
}

/// Background task that reads frames from the transport and routes them
async fn recv_loop<S>(mut stream: S, session: Session)
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    let shutdown = session.inner.shutdown.clone();
    let mut close_event = None;

    loop {
        tokio::select! {
            next = stream.next() => {
                match next {
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(session = session.id(), "transport close received");
                        session.mark_closing();
                        close_event.get_or_insert_with(|| close_event_from(frame));
                    }
                    Some(Ok(message)) => match session.inner.codec.decode(message) {
                        Ok(Some(frame)) => session.route_inbound(frame),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(session = session.id(), "dropping undecodable frame: {}", e);
                        }
                    },
                    Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) | None => {
                        tracing::debug!(session = session.id(), "transport closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!(session = session.id(), "transport error: {}", e);
                        session.propagate_connection_event(ConnectionEvent::Error(
                            ErrorEvent::new(e.to_string()),
                        ));
                        close_event.get_or_insert_with(|| CloseEvent::abnormal(Some(e.to_string())));
                        break;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::debug!(session = session.id(), "recv_loop shutting down");
                break;
            }
        }
    }

    session.finish(close_event.unwrap_or_else(|| CloseEvent::abnormal(None)));
}

/// Background task that writes queued frames to the transport
async fn send_loop<S>(mut sink: S, frame_rx: flume::Receiver<Outbound>, session: Session)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let shutdown = session.inner.shutdown.clone();
    let mut keep_alive = session.config().enable_keep_alive.then(|| {
        let period = session.config().keep_alive_interval;
        tokio::time::interval_at(Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            outbound = frame_rx.recv_async() => {
                match outbound {
                    Ok(Outbound::Frame(frame)) => {
                        if let Err(e) = sink.send(frame).await {
                            tracing::error!(session = session.id(), "frame send error: {}", e);
                            session.propagate_connection_event(ConnectionEvent::Error(
                                ErrorEvent::new(e.to_string()),
                            ));
                            session.finish(CloseEvent::abnormal(Some(e.to_string())));
                            break;
                        }
                    }
                    Ok(Outbound::Shutdown) => {
                        // The recv loop finishes once the peer answers the close
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: Utf8Bytes::from_static(""),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            tracing::debug!(session = session.id(), "close handshake failed: {}", e);
                            session.finish(CloseEvent::abnormal(Some(e.to_string())));
                        }
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(session = session.id(), "frame sender closed");
                        break;
                    }
                }
            }
            _ = tick(&mut keep_alive) => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    tracing::error!(session = session.id(), "keep-alive ping failed: {}", e);
                    session.propagate_connection_event(ConnectionEvent::Error(
                        ErrorEvent::new(e.to_string()),
                    ));
                    session.finish(CloseEvent::abnormal(Some(e.to_string())));
                    break;
                }
            }
            _ = shutdown.cancelled() => {
                tracing::debug!(session = session.id(), "send_loop shutting down");
                break;
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
