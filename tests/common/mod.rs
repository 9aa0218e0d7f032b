#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use resilient_ws::error::{Error, Kind};
use resilient_ws::transport::{ConnectRequest, Socket, Transport};
use resilient_ws::{CloseReason, EventHandler, Frame, WsError};
use secrecy::ExposeSecret as _;
use tokio::sync::{mpsc, watch};

/// Let every ready task run. Under paused time this never advances the clock past pending
/// timers that are further than a millisecond away.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Server side of one in-memory connection.
pub struct MockPeer {
    pub token: Option<String>,
    /// Frames the client wrote
    received: fmpsc::UnboundedReceiver<Frame>,
    /// Frames for the client to read
    outgoing: fmpsc::UnboundedSender<resilient_ws::Result<Frame>>,
}

impl MockPeer {
    pub fn send(&self, frame: Frame) {
        self.outgoing.unbounded_send(Ok(frame)).unwrap();
    }

    pub fn send_text(&self, text: &str) {
        self.send(Frame::Text(text.to_owned()));
    }

    /// Close from the server side with a close frame.
    pub fn close(&self, reason: CloseReason) {
        self.send(Frame::Close(Some(reason)));
    }

    /// Drop the connection without a close frame.
    pub fn drop_connection(self) {
        drop(self);
    }

    /// Everything the client wrote so far.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(Some(frame)) = self.received.next().now_or_never() {
            frames.push(frame);
        }
        frames
    }

    /// Text payloads the client wrote so far.
    pub fn texts(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
struct MockState {
    failures: usize,
}

/// In-memory [`Transport`]: every successful connect hands its server side to the test.
pub struct MockTransport {
    connects: AtomicUsize,
    state: Mutex<MockState>,
    /// Connects wait until this is `true`
    gate: watch::Receiver<bool>,
    gate_tx: watch::Sender<bool>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockTransport {
    /// Connections open as soon as they are requested.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        Self::with_gate(true)
    }

    /// Connections stay pending until [`MockTransport::open_gate`].
    pub fn gated() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (gate_tx, gate) = watch::channel(open);
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            connects: AtomicUsize::new(0),
            state: Mutex::new(MockState::default()),
            gate,
            gate_tx,
            peers,
        });
        (transport, peers_rx)
    }

    pub fn open_gate(&self) {
        self.gate_tx.send_replace(true);
    }

    /// The next `count` connects fail.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().failures = count;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, request: &ConnectRequest) -> resilient_ws::Result<Socket> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate.clone();
        loop {
            let open = *gate.borrow_and_update();
            if open {
                break;
            }
            gate.changed().await.unwrap();
        }

        {
            let mut state = self.state.lock();
            if state.failures > 0 {
                state.failures -= 1;
                return Err(Error::with_source(
                    Kind::WebSocket,
                    WsError::Connection("connection refused".into()),
                ));
            }
        }

        let (client_tx, received) = fmpsc::unbounded();
        let (outgoing, client_rx) = fmpsc::unbounded();
        let sink = client_tx.sink_map_err(|e| {
            Error::with_source(Kind::WebSocket, WsError::Connection(Box::new(e)))
        });

        _ = self.peers.send(MockPeer {
            token: request
                .token
                .as_ref()
                .map(|token| token.expose_secret().to_owned()),
            received,
            outgoing,
        });

        Ok(Socket::new(sink, client_rx))
    }
}

/// Everything an [`EventHandler`] observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<M> {
    Open,
    Message(M),
    Close(CloseReason),
    Error(String),
}

/// Forwards every callback to a channel.
pub struct Recorder<M> {
    events: mpsc::UnboundedSender<Event<M>>,
}

impl<M> Recorder<M> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event<M>>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

impl<M: Send + 'static> EventHandler<M> for Recorder<M> {
    fn on_open(&mut self) {
        _ = self.events.send(Event::Open);
    }

    fn on_message(&mut self, message: M) {
        _ = self.events.send(Event::Message(message));
    }

    fn on_close(&mut self, reason: &CloseReason) {
        _ = self.events.send(Event::Close(reason.clone()));
    }

    fn on_error(&mut self, error: &Error) {
        _ = self.events.send(Event::Error(error.to_string()));
    }
}

/// Events recorded so far, without waiting.
pub fn drain<M>(events: &mut mpsc::UnboundedReceiver<Event<M>>) -> Vec<Event<M>> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
