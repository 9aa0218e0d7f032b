#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::ReentrantMutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::channel::{Channel, ChannelEvent, ChannelState};
use crate::config::{Config, HeartbeatProbe};
use crate::error::{Error, WsError};
use crate::frame::{CloseReason, Frame, Payload, Visibility};
use crate::heartbeat::{Watchdog, WatchdogAction};
use crate::queue::{Enqueued, OutboundQueue};
use crate::reconnect::{OpenWaiters, ReadyCallback, ReconnectScheduler};
use crate::registry::{Acquire, Registry};
use crate::traits::{EventHandler, MessageParser};

/// Lifecycle state of a [`ConnectionManager`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and nothing scheduled
    Idle,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: std::time::Instant,
    },
    /// Waiting for the next reconnection attempt
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// Closed by [`ConnectionManager::close`]; terminal
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Work submitted by a handle to its driver task.
enum Command {
    Connect(Option<ReadyCallback>),
    Send(Payload),
    Visibility(Visibility),
}

/// State shared between every handle and the driver task.
///
/// Every callback and every state change runs under `gate`. [`Shared::close`] takes the same
/// lock, so once it returns no callback is running and none will start. The lock is reentrant
/// so a callback can close its own manager.
struct Shared {
    gate: ReentrantMutex<()>,
    shutdown: CancellationToken,
    state: watch::Sender<ConnectionState>,
    queued: AtomicUsize,
    binary_mode: bool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn close(&self) {
        let _gate = self.gate.lock();
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.state.send_replace(ConnectionState::Closed);
    }

    fn publish(&self, state: ConnectionState) {
        let _gate = self.gate.lock();
        if !self.is_closed() {
            self.state.send_replace(state);
        }
    }

    fn dispatch<F: FnOnce()>(&self, callback: F) {
        let _gate = self.gate.lock();
        if !self.is_closed() {
            callback();
        }
    }
}

/// Closes the manager when the last handle is dropped.
struct CloseOnDrop(Arc<Shared>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Keeps one logical connection alive across drops, sleeps and credential changes.
///
/// The manager owns a driver task that attaches to a shared [`Channel`] from the [`Registry`],
/// runs the heartbeat watchdog, schedules reconnects with backoff and buffers payloads sent
/// while disconnected. All callbacks of the [`EventHandler`] run on that task.
///
/// Handles are cheap to clone. Dropping the last one is equivalent to
/// [`ConnectionManager::close`].
///
/// # Type Parameters
///
/// - `M`: Message type produced by the [`MessageParser`] and consumed by the [`EventHandler`]
pub struct ConnectionManager<M> {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    guard: Arc<CloseOnDrop>,
    _message: PhantomData<fn() -> M>,
}

impl<M: Send + 'static> ConnectionManager<M> {
    /// Validate `config` and start the driver task.
    ///
    /// Must be called from within a Tokio runtime. Unless `connect_on_create` is disabled a
    /// connection attempt starts right away.
    pub fn new<P, H>(config: Config, parser: P, handler: H, registry: Arc<Registry>) -> Result<Self>
    where
        P: MessageParser<M>,
        H: EventHandler<M>,
    {
        let url = config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let shared = Arc::new(Shared {
            gate: ReentrantMutex::new(()),
            shutdown: CancellationToken::new(),
            state: state_tx,
            queued: AtomicUsize::new(0),
            binary_mode: config.binary_mode,
        });

        let connect_on_create = config.connect_on_create;
        let driver = Driver {
            url,
            probe: config.heartbeat.probe.clone(),
            watchdog: Watchdog::new(&config.heartbeat),
            scheduler: ReconnectScheduler::new(&config.reconnect),
            queue: OutboundQueue::new(config.queue),
            config,
            registry,
            parser,
            handler,
            shared: Arc::clone(&shared),
            commands: commands_rx,
            state: ConnectionState::Idle,
            attachment: None,
            waiters: OpenWaiters::default(),
            credential_retry: None,
            _message: PhantomData,
        };
        tokio::spawn(driver.run());

        let manager = Self {
            guard: Arc::new(CloseOnDrop(Arc::clone(&shared))),
            shared,
            commands: commands_tx,
            state_rx,
            _message: PhantomData,
        };

        if connect_on_create {
            manager.connect(None)?;
        }

        Ok(manager)
    }

    /// Start connecting if idle.
    ///
    /// `on_ready` runs once the connection is open, right away if it already is. While a
    /// connection or a scheduled reconnect is pending this only registers `on_ready`.
    pub fn connect(&self, on_ready: Option<ReadyCallback>) -> Result<()> {
        self.submit(Command::Connect(on_ready))
    }

    /// Connect if needed and wait until the connection is open.
    ///
    /// Fails with [`WsError::ConnectionClosed`] if the manager is closed before that.
    pub async fn ready(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.connect(Some(Box::new(move || {
            _ = tx.send(());
        })))?;

        rx.await.map_err(|_e| WsError::ConnectionClosed.into())
    }

    /// Send a payload now, or queue it until the next open.
    pub fn send<T: Into<Payload>>(&self, payload: T) -> Result<()> {
        self.submit(Command::Send(payload.into()))
    }

    /// Serialize `message` as JSON and [`ConnectionManager::send`] it, as a binary frame in
    /// binary mode.
    pub fn send_json<T: Serialize>(&self, message: &T) -> Result<()> {
        let payload = if self.shared.binary_mode {
            Payload::Binary(serde_json::to_vec(message)?)
        } else {
            Payload::Text(serde_json::to_string(message)?)
        };

        self.send(payload)
    }

    /// Tell the manager whether the embedding app is visible.
    ///
    /// Becoming visible reconnects right away instead of waiting for the backoff.
    pub fn notify_visibility(&self, visibility: Visibility) -> Result<()> {
        self.submit(Command::Visibility(visibility))
    }

    /// Stop for good: no callback runs once this returns, and later calls to `send` and
    /// `connect` fail with [`WsError::ConnectionClosed`]. Safe to call from a callback.
    pub fn close(&self) {
        self.shared.close();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Payloads waiting for the next open.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    fn submit(&self, command: Command) -> Result<()> {
        if self.shared.is_closed() {
            return Err(WsError::ConnectionClosed.into());
        }

        self.commands
            .send(command)
            .map_err(|_e| WsError::ConnectionClosed.into())
    }
}

impl<M> Clone for ConnectionManager<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            commands: self.commands.clone(),
            state_rx: self.state_rx.clone(),
            guard: Arc::clone(&self.guard),
            _message: PhantomData,
        }
    }
}

impl<M> std::fmt::Debug for ConnectionManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.state_rx.borrow())
            .field("queued", &self.shared.queued.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// The channel a driver is currently attached to.
struct Attachment {
    channel: Arc<Channel>,
    events: broadcast::Receiver<ChannelEvent>,
    /// An error event was already reported for this channel
    errored: bool,
}

/// Owns all mutable state of one manager; runs on its own task.
struct Driver<M, P, H> {
    config: Config,
    url: Url,
    probe: HeartbeatProbe,
    registry: Arc<Registry>,
    parser: P,
    handler: H,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: ConnectionState,
    attachment: Option<Attachment>,
    watchdog: Watchdog,
    scheduler: ReconnectScheduler,
    waiters: OpenWaiters,
    queue: OutboundQueue,
    credential_retry: Option<Instant>,
    _message: PhantomData<fn() -> M>,
}

impl<M, P, H> Driver<M, P, H>
where
    M: Send + 'static,
    P: MessageParser<M>,
    H: EventHandler<M>,
{
    async fn run(mut self) {
        loop {
            let heartbeat_at = self.watchdog.deadline();
            let retry_at = self.scheduler.deadline();
            let credentials_at = self.credential_retry;

            tokio::select! {
                biased;

                () = self.shared.shutdown.cancelled() => break,

                Some(command) = self.commands.recv() => self.on_command(command),

                event = next_event(self.attachment.as_mut()) => self.on_channel_event(event),

                () = sleep_until_some(heartbeat_at) => self.on_heartbeat(),

                () = sleep_until_some(retry_at) => self.on_retry_due(),

                () = sleep_until_some(credentials_at) => {
                    self.credential_retry = None;
                    if self.state == ConnectionState::Connecting && self.attachment.is_none() {
                        self.acquire();
                    }
                }
            }
        }

        self.teardown();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(on_ready) => match self.state {
                ConnectionState::Connected { .. } => {
                    if let Some(on_ready) = on_ready {
                        self.shared.dispatch(on_ready);
                    }
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                    if let Some(on_ready) = on_ready {
                        self.waiters.push(on_ready);
                    }
                }
                ConnectionState::Idle | ConnectionState::Closed => {
                    if let Some(on_ready) = on_ready {
                        self.waiters.push(on_ready);
                    }
                    self.begin_connect();
                }
            },
            Command::Send(payload) => self.send(payload),
            Command::Visibility(visibility) => self.on_visibility(visibility),
        }
    }

    fn on_visibility(&mut self, visibility: Visibility) {
        #[cfg(feature = "tracing")]
        tracing::debug!(?visibility, state = ?self.state, "Visibility changed");

        if visibility != Visibility::Visible {
            return;
        }

        match self.state {
            ConnectionState::Idle => self.begin_connect(),
            ConnectionState::Reconnecting { .. } => {
                // Skip the rest of the backoff without resetting it
                self.scheduler.schedule_now(Instant::now());
            }
            _ => {}
        }
    }

    fn on_retry_due(&mut self) {
        if !self.scheduler.take_due(Instant::now()) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(attempt = self.scheduler.attempts(), "Reconnecting");

        self.set_state(ConnectionState::Connecting);
        self.acquire();
    }

    fn begin_connect(&mut self) {
        self.scheduler.cancel();
        self.credential_retry = None;
        self.set_state(ConnectionState::Connecting);
        self.acquire();
    }

    /// Ask the registry for a channel, or come back later when there is no token yet.
    fn acquire(&mut self) {
        self.detach();

        let credentials = self.config.credentials.as_deref();
        match self
            .registry
            .acquire(&self.url, credentials, self.config.binary_mode)
        {
            Acquire::Ready(channel) => self.attach(channel),
            Acquire::Deferred => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    retry_in = ?self.config.credential_retry,
                    "No token available yet, deferring connect"
                );
                self.credential_retry = Some(Instant::now() + self.config.credential_retry);
            }
        }
    }

    fn attach(&mut self, channel: Arc<Channel>) {
        // Subscribe first so a transition between the two calls is seen as an event
        let events = channel.subscribe();
        let state = channel.state();
        let close_reason = channel.close_reason();
        self.attachment = Some(Attachment {
            channel,
            events,
            errored: false,
        });

        match state {
            ChannelState::Open => self.on_open(),
            ChannelState::Closed => self.on_closed(
                close_reason.unwrap_or_else(|| CloseReason::abnormal("channel closed")),
                None,
            ),
            _ => {}
        }
    }

    fn detach(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            self.registry
                .release(attachment.channel.identity(), &attachment.channel);
        }
    }

    fn on_channel_event(&mut self, event: std::result::Result<ChannelEvent, RecvError>) {
        match event {
            Ok(ChannelEvent::Opened) => {
                // Already handled when the channel was open at attach time
                if !self.state.is_connected() {
                    self.on_open();
                }
            }
            Ok(ChannelEvent::Frame(frame)) => self.on_frame(frame),
            Ok(ChannelEvent::Errored(error)) => {
                if let Some(attachment) = self.attachment.as_mut() {
                    attachment.errored = true;
                }
                self.report(&error);
            }
            Ok(ChannelEvent::Closed(reason)) => self.on_closed(reason, None),
            Err(RecvError::Lagged(count)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(count, "Lagged behind channel events");
                self.report(&WsError::Lagged { count }.into());

                // The close may be among the missed events
                let closed = self
                    .attachment
                    .as_ref()
                    .filter(|a| a.channel.state() == ChannelState::Closed)
                    .map(|a| a.channel.close_reason());
                if let Some(reason) = closed {
                    self.on_closed(
                        reason.unwrap_or_else(|| CloseReason::abnormal("channel closed")),
                        None,
                    );
                }
            }
            Err(RecvError::Closed) => {
                let reason = self
                    .attachment
                    .as_ref()
                    .and_then(|a| a.channel.close_reason())
                    .unwrap_or_else(|| CloseReason::abnormal("channel dropped"));
                self.on_closed(reason, None);
            }
        }
    }

    fn on_open(&mut self) {
        let Some(channel) = self.attachment.as_ref().map(|a| Arc::clone(&a.channel)) else {
            return;
        };

        let flushed = self.queue.flush_into(|payload| channel.try_send(payload));
        self.sync_queued();

        for on_ready in self.waiters.drain() {
            self.shared.dispatch(on_ready);
        }

        let now = Instant::now();
        self.watchdog.start(now);
        self.scheduler.reset();

        #[cfg(feature = "tracing")]
        tracing::info!(channel = channel.id(), flushed, "Connected");
        #[cfg(not(feature = "tracing"))]
        let _: &usize = &flushed;

        self.set_state(ConnectionState::Connected {
            since: std::time::Instant::now(),
        });
        self.shared.dispatch(|| self.handler.on_open());
    }

    fn on_frame(&mut self, frame: Frame) {
        self.watchdog.record_activity(Instant::now());

        let is_ack = match (&self.probe, &frame) {
            (HeartbeatProbe::Control, Frame::Pong(_)) => true,
            (HeartbeatProbe::Text { ack, .. }, Frame::Text(text)) => ack == text,
            (HeartbeatProbe::Text { ack, .. }, Frame::Binary(bytes)) => {
                ack.as_bytes() == bytes.as_slice()
            }
            _ => false,
        };
        if is_ack {
            #[cfg(feature = "tracing")]
            tracing::trace!("Heartbeat acknowledged");
            return;
        }

        match frame {
            Frame::Text(text) => self.deliver(&Payload::Text(text)),
            Frame::Binary(bytes) => self.deliver(&Payload::Binary(bytes)),
            // Pings are answered by the transport; control frames never reach the app
            _ => {}
        }
    }

    fn deliver(&mut self, payload: &Payload) {
        match self.parser.parse(payload) {
            Ok(messages) => {
                for message in messages {
                    self.shared.dispatch(|| self.handler.on_message(message));
                }
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Failed to parse WebSocket message");
                self.report(&e);
            }
        }
    }

    fn on_heartbeat(&mut self) {
        match self.watchdog.poll(Instant::now()) {
            Some(WatchdogAction::SendProbe) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Connection idle, sending heartbeat probe");

                let probe = self.probe_frame();
                // A failed probe means the channel is closing; its close event follows.
                if let Some(attachment) = &self.attachment {
                    _ = attachment.channel.send_probe(probe);
                }
            }
            Some(WatchdogAction::Expired) => {
                let after = self.watchdog.ack_timeout();
                #[cfg(feature = "tracing")]
                tracing::warn!("Heartbeat timeout: no acknowledgment within {after:?}");

                let reason = CloseReason::heartbeat_timeout();
                if let Some(attachment) = &self.attachment {
                    attachment.channel.close(reason.clone());
                }
                self.on_closed(reason, Some(WsError::HeartbeatTimeout { after }.into()));
            }
            None => {}
        }
    }

    fn probe_frame(&self) -> Frame {
        match &self.probe {
            HeartbeatProbe::Text { probe, .. } if self.config.binary_mode => {
                Frame::Binary(probe.as_bytes().to_vec())
            }
            HeartbeatProbe::Text { probe, .. } => Frame::Text(probe.clone()),
            _ => Frame::Ping(Vec::new()),
        }
    }

    /// Handle the end of the current channel, whatever caused it.
    ///
    /// `error` replaces the default [`WsError::AbnormalClose`] report.
    fn on_closed(&mut self, reason: CloseReason, error: Option<Error>) {
        if self.attachment.is_none() {
            return;
        }

        self.watchdog.stop();
        let errored = self.attachment.as_ref().is_some_and(|a| a.errored);

        #[cfg(feature = "tracing")]
        tracing::info!(%reason, "Disconnected");

        self.shared.dispatch(|| self.handler.on_close(&reason));
        // The error event that caused this close already went through on_error
        let error = error.or_else(|| {
            (!reason.is_normal() && !errored)
                .then(|| WsError::AbnormalClose(reason.clone()).into())
        });
        if let Some(error) = error {
            self.report(&error);
        }

        self.detach();

        if self.shared.is_closed() {
            return;
        }

        if !self.config.auto_reconnect {
            self.set_state(ConnectionState::Idle);
            return;
        }

        match self.scheduler.schedule(Instant::now()) {
            Some(delay) => {
                let attempt = self.scheduler.attempts();
                #[cfg(feature = "tracing")]
                tracing::info!(attempt, ?delay, "Scheduling reconnect");
                #[cfg(not(feature = "tracing"))]
                let _: &std::time::Duration = &delay;

                self.set_state(ConnectionState::Reconnecting { attempt });
            }
            None => {
                let attempts = self.scheduler.attempts();
                #[cfg(feature = "tracing")]
                tracing::error!(attempts, "Max reconnection attempts exceeded");

                self.report(&WsError::ReconnectExhausted { attempts }.into());
                self.set_state(ConnectionState::Idle);
            }
        }
    }

    fn send(&mut self, payload: Payload) {
        // Queued payloads go first, so only bypass the queue when it is empty
        let payload = match &self.attachment {
            Some(attachment) if self.state.is_connected() && self.queue.is_empty() => {
                match attachment.channel.try_send(payload) {
                    Ok(()) => return,
                    Err(payload) => payload,
                }
            }
            _ => payload,
        };

        let overflow = match self.queue.enqueue(payload) {
            Enqueued::Queued => None,
            Enqueued::DroppedOldest(_) => Some(true),
            Enqueued::Rejected(_) => Some(false),
        };
        self.sync_queued();

        if let Some(dropped_oldest) = overflow {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                capacity = self.queue.capacity(),
                dropped_oldest,
                "Outbound queue full"
            );
            self.report(
                &WsError::QueueOverflow {
                    capacity: self.queue.capacity(),
                    dropped_oldest,
                }
                .into(),
            );
        }
    }

    fn report(&mut self, error: &Error) {
        self.shared.dispatch(|| self.handler.on_error(error));
    }

    fn set_state(&mut self, state: ConnectionState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(from = ?self.state, to = ?state, "State transition");

        self.state = state;
        self.shared.publish(state);
    }

    fn sync_queued(&self) {
        self.shared.queued.store(self.queue.len(), Ordering::Release);
    }

    fn teardown(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Connection manager closed");

        self.watchdog.stop();
        self.scheduler.cancel();
        self.credential_retry = None;
        self.waiters.clear();
        self.queue.clear();
        self.sync_queued();
        self.detach();
        self.state = ConnectionState::Closed;
    }
}

async fn next_event(
    attachment: Option<&mut Attachment>,
) -> std::result::Result<ChannelEvent, RecvError> {
    match attachment {
        Some(attachment) => attachment.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
