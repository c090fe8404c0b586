#![allow(dead_code)]

use async_trait::async_trait;
use chanmux::{
    Backends, Client, Config, Connector, LogicalStream, Payload, Result, Server, Session,
};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{io::DuplexStream, sync::mpsc};
use tokio_tungstenite::{WebSocketStream, tungstenite::protocol::Role};

/// Helper macro to add timeout to tests
macro_rules! test_with_timeout {
    ($test_name:ident, $timeout_secs:expr, $test_body:block) => {
        #[tokio::test]
        async fn $test_name() {
            common::init_tracing();
            let result = tokio::time::timeout(
                std::time::Duration::from_secs($timeout_secs),
                async move $test_body
            ).await;

            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => panic!("Test failed: {:?}", e),
                Err(_) => panic!("Test timed out after {} seconds", $timeout_secs),
            }
        }
    };
}

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two ends of an in-memory WebSocket connection.
pub async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    (client, server)
}

/// A backend that sends every message straight back on its own channel.
pub fn echo_backends() -> Backends {
    Backends::new().route("echo", |stream: LogicalStream| {
        let replies = stream.clone();
        stream.on_message(move |event| {
            if let Err(e) = replies.send(event.data.clone()) {
                tracing::warn!("echo failed: {}", e);
            }
        });
    })
}

/// A client and the server session on the other end of one connection.
pub async fn connected(backends: Backends) -> (Client, Session) {
    let (client_ws, server_ws) = ws_pair().await;
    let server = Server::new(backends, Config::default());
    let server_session = server.accept(server_ws).unwrap();
    let client = Client::from_transport("ws://test/mux", client_ws, Config::default()).unwrap();
    (client, server_session)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Open(String),
    Message(Payload),
    Close(Option<u16>, Option<String>),
    Error(String),
}

/// Collects every event a stream emits, in order.
pub struct Recorder {
    rx: mpsc::UnboundedReceiver<Seen>,
}

impl Recorder {
    pub fn attach(stream: &LogicalStream) -> Self {
        let (recorder, tx) = Self::without_messages(stream);
        stream.on_message(move |event| {
            let _ = tx.send(Seen::Message(event.data.clone()));
        });
        recorder
    }

    /// Records open, close and error only; the sender is returned so a
    /// message listener can be added later.
    pub fn without_messages(stream: &LogicalStream) -> (Self, mpsc::UnboundedSender<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        stream.on_open(move |event| {
            let _ = open_tx.send(Seen::Open(event.channel_id.clone()));
        });
        let close_tx = tx.clone();
        stream.on_close(move |event| {
            let _ = close_tx.send(Seen::Close(event.code, event.reason.clone()));
        });
        let error_tx = tx.clone();
        stream.on_error(move |event| {
            let _ = error_tx.send(Seen::Error(event.message.clone()));
        });

        (Self { rx }, tx)
    }

    pub async fn next(&mut self) -> Seen {
        tokio::time::timeout(EVENT_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("stream event sender dropped")
    }

    pub async fn expect_open(&mut self) -> String {
        match self.next().await {
            Seen::Open(id) => id,
            other => panic!("expected open, got {other:?}"),
        }
    }

    pub async fn expect_message(&mut self) -> Payload {
        match self.next().await {
            Seen::Message(data) => data,
            other => panic!("expected message, got {other:?}"),
        }
    }

    pub async fn expect_close(&mut self) -> (Option<u16>, Option<String>) {
        match self.next().await {
            Seen::Close(code, reason) => (code, reason),
            other => panic!("expected close, got {other:?}"),
        }
    }

    /// Skips error events and returns the close that follows them.
    pub async fn until_close(&mut self) -> (Option<u16>, Vec<String>) {
        let mut errors = Vec::new();
        loop {
            match self.next().await {
                Seen::Error(message) => errors.push(message),
                Seen::Close(code, _) => return (code, errors),
                other => panic!("expected error or close, got {other:?}"),
            }
        }
    }

    /// Asserts nothing arrives for `period`.
    pub async fn assert_quiet(&mut self, period: Duration) {
        if let Ok(event) = tokio::time::timeout(period, self.rx.recv()).await {
            panic!("expected no events, got {event:?}");
        }
    }
}

/// Polls `condition` until it holds or [`EVENT_TIMEOUT`] passes.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Connects clients to an in-process server over in-memory pairs.
pub struct PairConnector {
    server: Server,
    delay: Duration,
    pub connects: Arc<AtomicUsize>,
    pub sessions: Arc<Mutex<Vec<Session>>>,
}

impl PairConnector {
    pub fn new(server: Server, delay: Duration) -> Self {
        Self {
            server,
            delay,
            connects: Arc::new(AtomicUsize::new(0)),
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Connector for PairConnector {
    type Transport = WebSocketStream<DuplexStream>;

    async fn connect(&self, _endpoint: &str, _protocol: Option<&str>) -> Result<Self::Transport> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let (client, server) = ws_pair().await;
        let session = self.server.accept(server)?;
        self.sessions.lock().push(session);
        Ok(client)
    }
}
