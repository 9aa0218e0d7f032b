//! One physical connection, shared by every manager attached to the same identity.
//!
//! The socket lives on its own task. Managers talk to it through an unbounded command channel
//! and observe it through a `watch` of its [`ChannelState`] plus a `broadcast` of
//! [`ChannelEvent`]s, so a late subscriber can always reconstruct what it missed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::error::Error;
use crate::frame::{CloseReason, Frame, Payload};
use crate::registry::Identity;
use crate::transport::{ConnectRequest, Socket, Transport};

/// Broadcast channel capacity for channel events.
const BROADCAST_CAPACITY: usize = 1024;

/// How long a closing channel waits for its close frame to be written.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Readiness of the underlying socket.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    /// `Closing` or `Closed`: the channel will never carry traffic again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ChannelEvent {
    Opened,
    /// Inbound data or control frame (never `Close`)
    Frame(Frame),
    Errored(Arc<Error>),
    Closed(CloseReason),
}

#[derive(Debug)]
pub struct Channel {
    id: u64,
    identity: Identity,
    outbound: mpsc::UnboundedSender<Frame>,
    closer: Mutex<Option<oneshot::Sender<CloseReason>>>,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Receiver<ChannelState>,
    close_reason: Arc<OnceLock<CloseReason>>,
    /// Managers currently attached, mutated only under the registry entry lock
    attached: AtomicUsize,
}

impl Channel {
    /// Start connecting on a new task and return the handle right away.
    pub(crate) fn spawn(
        id: u64,
        identity: Identity,
        transport: Arc<dyn Transport>,
        request: ConnectRequest,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let close_reason = Arc::new(OnceLock::new());

        let task = ChannelTask {
            id,
            transport,
            request,
            outbound: outbound_rx,
            closer: close_rx,
            events: events_tx.clone(),
            state: state_tx,
            close_reason: Arc::clone(&close_reason),
        };
        tokio::spawn(task.run());

        Arc::new(Self {
            id,
            identity,
            outbound: outbound_tx,
            closer: Mutex::new(Some(close_tx)),
            events: events_tx,
            state: state_rx,
            close_reason,
            attached: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Why the channel closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().cloned()
    }

    /// Number of managers currently sharing this channel.
    #[must_use]
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Subscribe before reading [`Channel::state`] so no transition falls between the two.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub(crate) fn is_writable(&self) -> bool {
        self.state() == ChannelState::Open && !self.outbound.is_closed()
    }

    /// Hand a payload to the socket task, or give it back when the channel is not open.
    pub(crate) fn try_send(&self, payload: Payload) -> Result<(), Payload> {
        if !self.is_writable() {
            return Err(payload);
        }
        // Accepted frames are in flight: if the socket dies before writing them they are lost.
        _ = self.outbound.send(payload.into());
        Ok(())
    }

    /// Send a heartbeat probe. Returns `false` when the channel is not open.
    pub(crate) fn send_probe(&self, frame: Frame) -> bool {
        self.is_writable() && self.outbound.send(frame).is_ok()
    }

    /// Close the socket with `reason`. Only the first call has an effect.
    pub(crate) fn close(&self, reason: CloseReason) {
        if let Some(closer) = self.closer.lock().take() {
            _ = closer.send(reason);
        }
    }

    pub(crate) fn attach(&self) -> usize {
        self.attached.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    /// Returns how many managers remain attached.
    pub(crate) fn detach(&self) -> usize {
        self.attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_or(0, |previous| previous.saturating_sub(1))
    }
}

struct ChannelTask {
    #[cfg_attr(
        not(feature = "tracing"),
        expect(dead_code, reason = "Only read by log statements")
    )]
    id: u64,
    transport: Arc<dyn Transport>,
    request: ConnectRequest,
    outbound: mpsc::UnboundedReceiver<Frame>,
    closer: oneshot::Receiver<CloseReason>,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    close_reason: Arc<OnceLock<CloseReason>>,
}

impl ChannelTask {
    async fn run(mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(channel = self.id, url = %self.request.url, "Connecting");

        let transport = Arc::clone(&self.transport);
        let connected = tokio::select! {
            result = transport.connect(&self.request) => result,
            reason = &mut self.closer => {
                // Closed before the handshake finished
                self.finish(reason.unwrap_or_else(|_dropped| CloseReason::normal()));
                return;
            }
        };

        let socket = match connected {
            Ok(socket) => socket,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(channel = self.id, error = %e, "Unable to connect");
                _ = self.events.send(ChannelEvent::Errored(Arc::new(e)));
                self.finish(CloseReason::abnormal("connection failed"));
                return;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::info!(channel = self.id, "Channel open");
        self.state.send_replace(ChannelState::Open);
        _ = self.events.send(ChannelEvent::Opened);

        let reason = self.pump(socket).await;
        self.finish(reason);
    }

    /// Move frames both ways until either side closes.
    async fn pump(&mut self, socket: Socket) -> CloseReason {
        let Socket {
            mut sink,
            mut stream,
        } = socket;

        loop {
            tokio::select! {
                biased;

                reason = &mut self.closer => {
                    let reason = reason.unwrap_or_else(|_dropped| CloseReason::normal());
                    self.state.send_replace(ChannelState::Closing);

                    let wire = reason.is_sendable().then(|| reason.clone());
                    if timeout(CLOSE_TIMEOUT, sink.send(Frame::Close(wire))).await.is_err() {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(channel = self.id, "Close frame not written in time");
                    }
                    return reason;
                }

                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        // Every handle is gone
                        _ = timeout(CLOSE_TIMEOUT, sink.send(Frame::Close(Some(CloseReason::normal())))).await;
                        return CloseReason::normal();
                    };

                    if let Err(e) = sink.send(frame).await {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(channel = self.id, error = %e, "Send failed");
                        _ = self.events.send(ChannelEvent::Errored(Arc::new(e)));
                        return CloseReason::abnormal("send failed");
                    }
                }

                inbound = stream.next() => match inbound {
                    Some(Ok(Frame::Close(reason))) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(channel = self.id, ?reason, "Peer closed the channel");
                        return reason.unwrap_or_else(|| CloseReason::new(1005, ""));
                    }
                    Some(Ok(frame)) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(channel = self.id, ?frame, "Received frame");
                        _ = self.events.send(ChannelEvent::Frame(frame));
                    }
                    Some(Err(e)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(channel = self.id, error = %e, "Transport error");
                        _ = self.events.send(ChannelEvent::Errored(Arc::new(e)));
                        return CloseReason::abnormal("transport error");
                    }
                    None => return CloseReason::abnormal("connection dropped"),
                }
            }
        }
    }

    /// The reason is stored before the state flips so late subscribers can read it back.
    fn finish(&self, reason: CloseReason) {
        #[cfg(feature = "tracing")]
        tracing::info!(channel = self.id, %reason, "Channel closed");

        _ = self.close_reason.set(reason.clone());
        self.state.send_replace(ChannelState::Closed);
        _ = self.events.send(ChannelEvent::Closed(reason));
    }
}
