//! Event types delivered by a [`LogicalStream`](crate::LogicalStream) and the
//! listener lists that carry them.

use crate::message::Payload;
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Readiness of a logical stream, mirroring a socket's `readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEvent {
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub data: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseEvent {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl CloseEvent {
    /// WebSocket status for a close frame that carried no code.
    pub const NO_STATUS: u16 = 1005;
    /// WebSocket status for a connection lost without a close handshake.
    pub const ABNORMAL: u16 = 1006;

    pub fn new(code: Option<u16>, reason: Option<String>) -> Self {
        Self { code, reason }
    }

    pub fn abnormal(reason: Option<String>) -> Self {
        Self::new(Some(Self::ABNORMAL), reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub message: String,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Handle returned when a listener is added, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registered<E> {
    slot: Option<Callback<E>>,
    listeners: Vec<(ListenerId, Callback<E>)>,
}

/// Ordered listeners for one event kind.
///
/// The single assignable handler (`set_slot`) runs before the listeners
/// added with `add`, which run in registration order. Callbacks are invoked
/// outside the lock, so they may add listeners, send or close the stream.
pub struct Listeners<E> {
    inner: Mutex<Registered<E>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Registered {
                slot: None,
                listeners: Vec::new(),
            }),
        }
    }
}

impl<E> Listeners<E> {
    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId::next();
        self.inner.lock().listeners.push((id, Arc::new(callback)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener, _)| *listener != id);
        inner.listeners.len() != before
    }

    /// Installs the single assignable handler, replacing any previous one.
    pub fn set_slot(&self, callback: impl Fn(&E) + Send + Sync + 'static) {
        self.inner.lock().slot = Some(Arc::new(callback));
    }

    pub fn clear_slot(&self) {
        self.inner.lock().slot = None;
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.slot.is_none() && inner.listeners.is_empty()
    }

    fn snapshot(&self) -> Vec<Callback<E>> {
        let inner = self.inner.lock();
        inner
            .slot
            .iter()
            .cloned()
            .chain(inner.listeners.iter().map(|(_, callback)| Arc::clone(callback)))
            .collect()
    }

    /// Calls every current listener with `event`, returning how many ran.
    pub fn emit(&self, event: &E) -> usize {
        let callbacks = self.snapshot();
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }
}
