//! Push-channel lifecycle.
//!
//! A single actor task owns the live socket and every piece of connection
//! state. Public calls and socket callbacks both arrive as events, and each
//! event is one explicit transition of the state machine:
//!
//! ```text
//! Idle/Closed --ensure & !manualOff & credentials--> Connecting
//! Connecting  --opened-->                            Open
//! Connecting  --failed-->                            Closed (retry armed) | Idle (manualOff)
//! Open        --lost-->                              Closed (retry armed) | Idle (manualOff)
//! any         --ensure & manualOff-->                Idle (retry cancelled)
//! any         --request_disconnect-->                Idle (manualOff = true)
//! any         --request_connect-->                   manualOff = false, then ensure
//! ```
//!
//! Each connection attempt carries a generation number. Events from an
//! attempt that is no longer current (superseded or cancelled) are ignored.
//!
//! Storage is read and written on the blocking pool, never on the actor's
//! own worker.

use std::{sync::Arc, time::Duration};

use codepush_core::{ClientId, LinkStatus, channel_url};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, HeartbeatMonitor},
    store::{PersistedState, StateStore, StoreError},
};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
/// How long shutdown waits for the socket to send its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Constant delay before the single retry after a failure or loss.
    pub retry_delay: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Channel lost or attempt failed; one delayed retry is armed.
    Closed,
}

/// What a call to [`ConnectionManager::ensure_connected`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Started,
    AlreadyActive,
    ManualOff,
    MissingCredentials,
    InvalidAddress,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("closed by server: {0}")]
    ClosedByPeer(String),
    #[error("stream ended")]
    Ended,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("connection manager is not running")]
    ManagerGone,
}

enum Command {
    EnsureConnected(oneshot::Sender<Result<EnsureOutcome, StoreError>>),
    RequestConnect(oneshot::Sender<Result<EnsureOutcome, StoreError>>),
    RequestDisconnect(oneshot::Sender<Result<(), StoreError>>),
}

enum ChannelEvent {
    Opened {
        attempt: u64,
        outbound: mpsc::UnboundedSender<Message>,
    },
    Closed {
        attempt: u64,
        error: TransportError,
    },
    RetryDue {
        attempt: u64,
    },
}

/// Handle to the connection actor. Cheap to clone; the actor stops once
/// every handle is dropped, closing the live channel with a close frame
/// before its task finishes.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    command_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<LinkStatus>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Spawns the actor. Inbound text frames are forwarded on `inbound_tx` in
    /// arrival order.
    pub fn spawn(
        store: Arc<dyn StateStore>,
        client_id: ClientId,
        config: ConnectionConfig,
        inbound_tx: mpsc::UnboundedSender<String>,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::Disconnected);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let driver = Driver {
            store,
            client_id,
            config,
            state: ConnectionState::Idle,
            attempt: 0,
            live: None,
            heartbeat: None,
            retry: None,
            event_tx,
            inbound_tx,
            status_tx,
            state_tx,
        };
        let task = tokio::spawn(driver.run(command_rx, event_rx));

        (
            Self {
                command_tx,
                status_rx,
                state_rx,
            },
            task,
        )
    }

    /// Idempotent: a no-op while connecting or open, while `manualOff` is set,
    /// or without stored credentials. Re-reads intent and credentials from
    /// storage on every call.
    pub async fn ensure_connected(&self) -> Result<EnsureOutcome, ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::EnsureConnected(reply_tx))?;
        Ok(reply_rx.await.map_err(|_| ConnectionError::ManagerGone)??)
    }

    /// Clears `manualOff` and connects.
    pub async fn request_connect(&self) -> Result<EnsureOutcome, ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::RequestConnect(reply_tx))?;
        Ok(reply_rx.await.map_err(|_| ConnectionError::ManagerGone)??)
    }

    /// Sets `manualOff`, closes the live channel and cancels any pending retry.
    ///
    /// The channel is closed even when persisting the intent fails; the
    /// persistence error is still returned.
    pub async fn request_disconnect(&self) -> Result<(), ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::RequestDisconnect(reply_tx))?;
        Ok(reply_rx.await.map_err(|_| ConnectionError::ManagerGone)??)
    }

    /// Observable `connected`/`disconnected` signal for badge or UI layers.
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn send(&self, command: Command) -> Result<(), ConnectionError> {
        self.command_tx
            .send(command)
            .map_err(|_| ConnectionError::ManagerGone)
    }
}

struct LiveChannel {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Driver {
    store: Arc<dyn StateStore>,
    client_id: ClientId,
    config: ConnectionConfig,
    state: ConnectionState,
    attempt: u64,
    live: Option<LiveChannel>,
    heartbeat: Option<HeartbeatMonitor>,
    retry: Option<JoinHandle<()>>,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    inbound_tx: mpsc::UnboundedSender<String>,
    status_tx: watch::Sender<LinkStatus>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Driver {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut event_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = event_rx.recv() => self.handle_event(event).await,
            }
        }

        debug!("connection manager stopping");
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::EnsureConnected(reply) => {
                let _ = reply.send(self.ensure_connected().await);
            }
            Command::RequestConnect(reply) => {
                let _ = reply.send(self.request_connect().await);
            }
            Command::RequestDisconnect(reply) => {
                let _ = reply.send(self.request_disconnect().await);
            }
        }
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened { attempt, outbound } => self.on_opened(attempt, outbound),
            ChannelEvent::Closed { attempt, error } => self.on_closed(attempt, error).await,
            ChannelEvent::RetryDue { attempt } => self.on_retry_due(attempt).await,
        }
    }

    async fn ensure_connected(&mut self) -> Result<EnsureOutcome, StoreError> {
        let persisted = load_state(Arc::clone(&self.store)).await?;
        let active = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        );

        if persisted.manual_off {
            if self.state != ConnectionState::Idle {
                // Intent written by another process (or a previous run) wins.
                info!(state = ?self.state, "manual-off found in storage, going idle");
                self.close_channel();
                self.set_state(ConnectionState::Idle);
            }
            return Ok(EnsureOutcome::ManualOff);
        }
        if active {
            return Ok(EnsureOutcome::AlreadyActive);
        }

        let Some(credentials) = persisted.credentials() else {
            debug!("no credentials stored, not connecting");
            return Ok(EnsureOutcome::MissingCredentials);
        };
        let url = match channel_url(&credentials, &self.client_id) {
            Ok(url) => url,
            Err(err) => {
                warn!(server_url = %credentials.server_url, "cannot build channel address: {}", err);
                return Ok(EnsureOutcome::InvalidAddress);
            }
        };

        self.cancel_retry();
        self.attempt += 1;
        info!(
            attempt = self.attempt,
            client_id = %self.client_id,
            server_url = %credentials.server_url,
            "connecting"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_channel(
            self.attempt,
            url,
            self.config.connect_timeout,
            shutdown_rx,
            self.event_tx.clone(),
            self.inbound_tx.clone(),
        ));
        self.live = Some(LiveChannel {
            shutdown: shutdown_tx,
            task,
        });
        self.set_state(ConnectionState::Connecting);
        Ok(EnsureOutcome::Started)
    }

    async fn request_connect(&mut self) -> Result<EnsureOutcome, StoreError> {
        store_manual_off(Arc::clone(&self.store), false).await?;
        info!("connect requested");
        self.ensure_connected().await
    }

    async fn request_disconnect(&mut self) -> Result<(), StoreError> {
        let persisted = store_manual_off(Arc::clone(&self.store), true).await;
        info!("disconnect requested");
        self.close_channel();
        self.set_state(ConnectionState::Idle);
        persisted.map(|_| ())
    }

    fn on_opened(&mut self, attempt: u64, outbound: mpsc::UnboundedSender<Message>) {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            debug!(attempt, current = self.attempt, "ignoring stale open");
            return;
        }

        info!(attempt, "connected");
        self.set_state(ConnectionState::Open);
        self.status_tx.send_replace(LinkStatus::Connected);
        self.heartbeat = Some(HeartbeatMonitor::start(
            outbound,
            self.config.heartbeat_interval,
        ));
    }

    async fn on_closed(&mut self, attempt: u64, error: TransportError) {
        let active = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        );
        if attempt != self.attempt || !active {
            debug!(attempt, current = self.attempt, "ignoring stale close");
            return;
        }

        warn!(attempt, "channel down: {}", error);
        self.heartbeat = None;
        self.live = None;
        self.status_tx.send_replace(LinkStatus::Disconnected);

        let manual_off = match load_state(Arc::clone(&self.store)).await {
            Ok(state) => state.manual_off,
            Err(err) => {
                // The retry re-reads storage and will not connect while it is unreadable.
                warn!("cannot read connection intent: {}", err);
                false
            }
        };
        if manual_off {
            self.set_state(ConnectionState::Idle);
            return;
        }

        self.schedule_retry(attempt);
        self.set_state(ConnectionState::Closed);
    }

    async fn on_retry_due(&mut self, attempt: u64) {
        if attempt != self.attempt || self.state != ConnectionState::Closed {
            debug!(attempt, current = self.attempt, "ignoring stale retry");
            return;
        }

        self.retry = None;
        match self.ensure_connected().await {
            Ok(outcome) => debug!(?outcome, "retry fired"),
            Err(err) => warn!("retry skipped, storage unavailable: {}", err),
        }
    }

    fn schedule_retry(&mut self, attempt: u64) {
        self.cancel_retry();
        let delay = self.config.retry_delay;
        let event_tx = self.event_tx.clone();
        info!(attempt, ?delay, "reconnect scheduled");
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(ChannelEvent::RetryDue { attempt });
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
    }

    /// Stops heartbeat, retry and socket, and invalidates in-flight events.
    fn close_channel(&mut self) {
        self.attempt += 1;
        self.cancel_retry();
        self.heartbeat = None;
        if let Some(live) = self.live.take() {
            let _ = live.shutdown.send(());
        }
        self.status_tx.send_replace(LinkStatus::Disconnected);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "connection state");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Closes the channel and waits briefly for its close frame to go out.
    async fn teardown(&mut self) {
        let live = self.live.take();
        self.close_channel();
        self.set_state(ConnectionState::Idle);

        if let Some(live) = live {
            let _ = live.shutdown.send(());
            if timeout(CLOSE_GRACE, live.task).await.is_err() {
                debug!("channel did not close within {:?}", CLOSE_GRACE);
            }
        }
    }
}

async fn load_state(store: Arc<dyn StateStore>) -> Result<PersistedState, StoreError> {
    tokio::task::spawn_blocking(move || store.load())
        .await
        .map_err(|_| StoreError::Unavailable)?
}

async fn store_manual_off(
    store: Arc<dyn StateStore>,
    manual_off: bool,
) -> Result<PersistedState, StoreError> {
    tokio::task::spawn_blocking(move || store.update(&mut |state| state.manual_off = manual_off))
        .await
        .map_err(|_| StoreError::Unavailable)?
}

/// Drives one connection attempt from dial to close.
///
/// Reports `Opened` once the handshake completes and `Closed` when the
/// attempt fails or the socket goes away. A shutdown signal closes the socket
/// without reporting anything, because the manager has already moved on.
async fn run_channel(
    attempt: u64,
    url: Url,
    connect_timeout: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    inbound_tx: mpsc::UnboundedSender<String>,
) {
    let ws_stream = tokio::select! {
        result = timeout(connect_timeout, connect_async(url.as_str())) => match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(err)) => {
                let _ = event_tx.send(ChannelEvent::Closed {
                    attempt,
                    error: TransportError::Connect(err.to_string()),
                });
                return;
            }
            Err(_) => {
                let _ = event_tx.send(ChannelEvent::Closed {
                    attempt,
                    error: TransportError::Timeout(connect_timeout),
                });
                return;
            }
        },
        _ = &mut shutdown_rx => {
            debug!(attempt, "connect attempt cancelled");
            return;
        }
    };

    let (mut write_half, mut read_half) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    if event_tx
        .send(ChannelEvent::Opened {
            attempt,
            outbound: outbound_tx,
        })
        .is_err()
    {
        return;
    }

    let error = loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = write_half.send(Message::Close(None)).await;
                debug!(attempt, "channel closed on request");
                return;
            }
            Some(message) = outbound_rx.recv() => {
                if let Err(err) = write_half.send(message).await {
                    break TransportError::Write(err.to_string());
                }
            }
            incoming = read_half.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound_tx.send(text.as_str().to_owned());
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| format!("{} {}", frame.code, frame.reason.as_str()))
                        .unwrap_or_else(|| "no close frame".to_owned());
                    break TransportError::ClosedByPeer(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break TransportError::Read(err.to_string()),
                None => break TransportError::Ended,
            },
        }
    };

    let _ = event_tx.send(ChannelEvent::Closed { attempt, error });
}
