use crate::{
    error::{MuxError, Result},
    event::{
        CloseEvent, ErrorEvent, ListenerId, Listeners, MessageEvent, OpenEvent, ReadyState,
    },
    message::{Payload, WireMessage},
    session::{Session, TransportState},
};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// One multiplexed channel, usable like an independent socket.
///
/// Cloning yields another handle to the same channel. Sending and closing
/// never wait on the network: frames are queued on the owning session and
/// written by its send loop.
#[derive(Clone)]
pub struct LogicalStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    session: Session,
    /// Client-side handshake placeholder, `None` on the server.
    reference: Option<String>,
    channel_id: RwLock<Option<String>>,
    closed: AtomicBool,
    on_open: Listeners<OpenEvent>,
    on_message: Listeners<MessageEvent>,
    on_close: Listeners<CloseEvent>,
    on_error: Listeners<ErrorEvent>,
    /// Messages received while no message listener was installed.
    backlog: Mutex<VecDeque<MessageEvent>>,
    /// Serialises message delivery so backlog flushes and live frames never interleave.
    delivery: ReentrantMutex<()>,
}

impl LogicalStream {
    fn new(session: Session, reference: Option<String>, channel_id: Option<String>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                session,
                reference,
                channel_id: RwLock::new(channel_id),
                closed: AtomicBool::new(false),
                on_open: Listeners::default(),
                on_message: Listeners::default(),
                on_close: Listeners::default(),
                on_error: Listeners::default(),
                backlog: Mutex::new(VecDeque::new()),
                delivery: ReentrantMutex::new(()),
            }),
        }
    }

    /// A client stream waiting for `open`, known only by its temporary reference.
    pub(crate) fn pending(session: Session, reference: String) -> Self {
        Self::new(session, Some(reference), None)
    }

    /// A server stream whose channel id is already assigned.
    pub(crate) fn established(session: Session, channel_id: String) -> Self {
        Self::new(session, None, Some(channel_id))
    }

    /// The permanent channel id, `None` until the handshake completes.
    pub fn channel_id(&self) -> Option<String> {
        self.inner.channel_id.read().clone()
    }

    pub(crate) fn reference(&self) -> Option<&str> {
        self.inner.reference.as_deref()
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn ready_state(&self) -> ReadyState {
        if self.is_closed() {
            return ReadyState::Closed;
        }

        match self.inner.session.transport_state() {
            TransportState::Closing => ReadyState::Closing,
            TransportState::Closed => ReadyState::Closed,
            TransportState::Connecting => ReadyState::Connecting,
            TransportState::Open if self.inner.channel_id.read().is_some() => ReadyState::Open,
            TransportState::Open => ReadyState::Connecting,
        }
    }

    pub fn ptr_eq(&self, other: &LogicalStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Sends `payload` to the peer's end of this channel.
    ///
    /// Fails locally, without touching the network, when the stream is
    /// closed or still waiting for its channel id.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        if self.is_closed() {
            tracing::warn!(channel = ?self.channel_id(), "send on closed channel");
            return Err(MuxError::ChannelClosed);
        }

        let Some(id) = self.channel_id() else {
            tracing::warn!(reference = ?self.reference(), "send before channel opened");
            return Err(MuxError::HandshakePending);
        };

        self.inner.session.enqueue(WireMessage::data(id, payload))
    }

    /// Closes the channel. Only the first call has any effect.
    ///
    /// An established channel on a live transport tells the peer with a
    /// `close` frame. Local close listeners run before the channel leaves
    /// the session's registry. Buffered messages nobody listened for are
    /// discarded.
    pub fn close(&self, code: Option<u16>, reason: Option<String>) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Read after the flag so an id assigned concurrently is either seen
        // here or refused by `assign_channel_id`
        let channel_id = self.inner.channel_id.read().clone();
        if let Some(id) = &channel_id {
            if self.inner.session.transport_state() == TransportState::Open {
                let frame = WireMessage::close(id.clone(), code, reason.clone());
                if let Err(e) = self.inner.session.enqueue(frame) {
                    tracing::debug!(channel = %id, "close frame not sent: {}", e);
                }
            }
        }

        tracing::debug!(channel = ?channel_id, ?code, "channel closed");
        self.inner.backlog.lock().clear();
        self.inner.on_close.emit(&CloseEvent::new(code, reason));

        // Before the handshake the stream is registered under its reference
        let key = channel_id.or_else(|| self.inner.reference.clone());
        if let Some(key) = key {
            self.inner.session.unregister_channel(&key, self);
        }
    }

    /// Handles an inbound frame routed to this channel.
    pub(crate) fn handle_frame(&self, message: WireMessage) {
        match message {
            WireMessage::Data { data, .. } => self.deliver_message(MessageEvent { data }),
            WireMessage::Close { code, reason, .. } => self.close(code, reason),
            other => {
                tracing::warn!(kind = %other.kind(), "unexpected frame routed to channel");
            }
        }
    }

    /// Records the permanent id handed out by the server.
    ///
    /// Returns `false`, leaving the stream without an id, if it has already
    /// been closed.
    pub(crate) fn assign_channel_id(&self, id: String) -> bool {
        let mut channel_id = self.inner.channel_id.write();
        if self.is_closed() {
            return false;
        }
        *channel_id = Some(id);
        true
    }

    pub(crate) fn emit_open(&self) {
        if self.is_closed() {
            return;
        }
        if let Some(channel_id) = self.channel_id() {
            self.inner.on_open.emit(&OpenEvent { channel_id });
        }
    }

    pub(crate) fn emit_error(&self, event: ErrorEvent) {
        self.inner.on_error.emit(&event);
    }

    fn deliver_message(&self, event: MessageEvent) {
        let _delivery = self.inner.delivery.lock();
        if !self.inner.on_message.is_empty() {
            self.inner.on_message.emit(&event);
            return;
        }

        let max_backlog = self.inner.session.config().max_backlog;
        let mut backlog = self.inner.backlog.lock();
        if backlog.len() >= max_backlog {
            tracing::warn!(
                channel = ?self.channel_id(),
                max_backlog,
                "no message listener and backlog full, message dropped"
            );
            return;
        }
        backlog.push_back(event);
    }

    fn flush_backlog(&self) {
        let _delivery = self.inner.delivery.lock();
        let pending: Vec<MessageEvent> = self.inner.backlog.lock().drain(..).collect();
        for event in &pending {
            self.inner.on_message.emit(event);
        }
    }

    pub fn on_open(&self, listener: impl Fn(&OpenEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.on_open.add(listener)
    }

    /// Adds a message listener. Messages buffered while the stream had no
    /// message listener are delivered to it straight away.
    pub fn on_message(
        &self,
        listener: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.on_message.add(listener);
        self.flush_backlog();
        id
    }

    pub fn on_close(&self, listener: impl Fn(&CloseEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.on_close.add(listener)
    }

    pub fn on_error(&self, listener: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.on_error.add(listener)
    }

    /// Removes a listener of any kind, returning whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.on_open.remove(id)
            || self.inner.on_message.remove(id)
            || self.inner.on_close.remove(id)
            || self.inner.on_error.remove(id)
    }

    pub fn set_on_open(&self, handler: impl Fn(&OpenEvent) + Send + Sync + 'static) {
        self.inner.on_open.set_slot(handler);
    }

    pub fn set_on_message(&self, handler: impl Fn(&MessageEvent) + Send + Sync + 'static) {
        self.inner.on_message.set_slot(handler);
        self.flush_backlog();
    }

    pub fn set_on_close(&self, handler: impl Fn(&CloseEvent) + Send + Sync + 'static) {
        self.inner.on_close.set_slot(handler);
    }

    pub fn set_on_error(&self, handler: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.inner.on_error.set_slot(handler);
    }

    /// Clears the handlers installed with the `set_on_*` methods. Listeners
    /// added with `on_*` stay in place.
    pub fn clear_handlers(&self) {
        self.inner.on_open.clear_slot();
        self.inner.on_message.clear_slot();
        self.inner.on_close.clear_slot();
        self.inner.on_error.clear_slot();
    }
}

impl fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalStream")
            .field("channel_id", &self.channel_id())
            .field("reference", &self.inner.reference)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}
