#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::backoff::ReconnectBackoff;
use super::classifier::NotificationParser;
use super::config::Config;
use super::error::WsError;
use super::events::{Disconnect, ErrorEvent, Event, EventName};
use super::router::{EventRouter, Listener, ListenerId};
use super::traits::MessageParser as _;
use super::transport::{
    ABNORMAL_CLOSURE, NORMAL_CLOSURE, Socket, SocketEvent, Transport, TungsteniteTransport,
};
use crate::Result;
use crate::auth::Authenticator;
use crate::error::{Error, Kind};

/// Close reason sent and reported when the caller disconnects.
pub const CLIENT_DISCONNECT: &str = "Client disconnect";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket and no reconnect pending
    Idle,
    /// Handshake in flight
    Connecting,
    /// Socket open and delivering frames
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// Close requested by the caller, waiting for the socket to finish
    Closing,
    /// Connection dropped, reconnect timer armed
    WaitingToReconnect {
        /// Reconnects scheduled since the last successful open, starting at 1
        attempt: u32,
        /// Delay the armed timer waits before dialing
        delay: Duration,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Caller,
    /// Fired by the reconnect timer armed during `epoch`
    Reconnect { epoch: u64 },
}

struct Lifecycle {
    state: ConnectionState,
    backoff: ReconnectBackoff,
    intentional_close: bool,
    has_opened: bool,
    /// Bumped by every connect attempt and every disconnect; work started under an older
    /// epoch must not touch the lifecycle.
    epoch: u64,
    handshake: Option<CancellationToken>,
    socket: Option<CancellationToken>,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct Inner<T: Transport> {
    endpoint: String,
    authenticator: Authenticator,
    config: Config,
    transport: T,
    parser: NotificationParser,
    router: EventRouter,
    /// Serializes `connect()` calls and reconnect attempts
    connect_lock: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Maintains the authenticated notification socket and publishes its traffic as [`Event`]s.
///
/// - `connect()` signs a fresh handshake and resolves once the socket is open. A failure of the
///   very first attempt is returned to the caller and never retried.
/// - Once a connection has been open, every unexpected drop schedules a reconnect with
///   exponential backoff (see [`super::BackoffPolicy`]) until `disconnect()` is called.
/// - Frames are classified and dispatched to the listeners registered with [`Self::on`].
///
/// Cloning yields another handle to the same connection. Dropping the last handle tears the
/// connection down.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use clawsquare_agent_sdk::auth::{Authenticator, MemoryKeyStore};
/// use clawsquare_agent_sdk::ws::{ConnectionManager, Event, EventName};
/// use clawsquare_agent_sdk::ws::config::Config;
///
/// # async fn run() -> clawsquare_agent_sdk::Result<()> {
/// let keys = Arc::new(MemoryKeyStore::generate("agent-1"));
/// let authenticator = Authenticator::new(keys, "manifest-hash");
/// let connection = ConnectionManager::new(
///     clawsquare_agent_sdk::DEFAULT_WS_URL,
///     authenticator,
///     Config::default(),
/// )?;
///
/// connection.on(EventName::Dm, Arc::new(|event: &Event| println!("{event:?}")));
/// connection.connect().await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager<T: Transport = TungsteniteTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConnectionManager {
    /// Creates a manager for `endpoint` that dials with `tokio-tungstenite`.
    ///
    /// Nothing is opened until [`Self::connect`] is called.
    pub fn new(endpoint: &str, authenticator: Authenticator, config: Config) -> Result<Self> {
        Self::with_transport(endpoint, authenticator, config, TungsteniteTransport)
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Creates a manager that opens sockets through `transport`.
    pub fn with_transport(
        endpoint: &str,
        authenticator: Authenticator,
        config: Config,
        transport: T,
    ) -> Result<Self> {
        let url = Url::parse(endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WsError::InvalidEndpoint(endpoint.to_owned()).into());
        }

        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let backoff = ReconnectBackoff::new(config.backoff_policy());

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint: url.into(),
                authenticator,
                config,
                transport,
                parser: NotificationParser,
                router: EventRouter::new(),
                connect_lock: tokio::sync::Mutex::new(()),
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Idle,
                    backoff,
                    intentional_close: false,
                    has_opened: false,
                    epoch: 0,
                    handshake: None,
                    socket: None,
                    reconnect_timer: None,
                }),
                state_tx,
            }),
        })
    }

    /// Opens the connection, resolving once the socket is open.
    ///
    /// Does nothing when already open. Cancels a pending reconnect timer and clears a previous
    /// `disconnect()`.
    ///
    /// # Errors
    ///
    /// - [`Kind::Configuration`] when the key store holds no keys
    /// - [`Kind::Validation`] when the stored private key is not a 32-byte hex seed
    /// - [`Kind::WebSocket`] when the handshake fails or `disconnect()` aborts it
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect_with(Origin::Caller).await
    }

    /// Closes the connection and stops reconnecting. Idempotent.
    ///
    /// Listeners receive [`Event::Disconnected`] with code `1000` once the open socket has been
    /// closed. [`Self::connected`] is `false` as soon as this returns.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle();

        lifecycle.intentional_close = true;
        lifecycle.epoch = lifecycle.epoch.wrapping_add(1);

        if let Some(timer) = lifecycle.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(handshake) = lifecycle.handshake.take() {
            handshake.cancel();
        }

        let next = match lifecycle.socket.take() {
            Some(socket) => {
                socket.cancel();
                ConnectionState::Closing
            }
            None if lifecycle.state == ConnectionState::Closing => ConnectionState::Closing,
            None => ConnectionState::Idle,
        };

        if lifecycle.state != next {
            inner.transition(&mut lifecycle, next);
        }
    }

    /// Whether the socket is currently open.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.state().is_open()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle().state
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Registers `listener` for events published as `name`.
    ///
    /// Registering the same `Arc` twice under one name is a no-op that returns the first id.
    pub fn on(&self, name: EventName, listener: Listener) -> ListenerId {
        self.inner.router.subscribe(name, listener)
    }

    /// Removes the listener registered as `id`. Unknown ids are ignored.
    pub fn off(&self, name: EventName, id: ListenerId) -> bool {
        self.inner.router.unsubscribe(name, id)
    }

    /// Listener registry shared by every handle to this connection.
    #[must_use]
    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    /// Normalized endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }
}

impl<T: Transport> fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Inner<T> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, lifecycle: &mut Lifecycle, next: ConnectionState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(from = ?lifecycle.state, to = ?next, "Connection state changed");

        lifecycle.state = next;
        self.state_tx.send_replace(next);
    }

    async fn open_socket(&self) -> Result<Box<dyn Socket>> {
        let headers = self.authenticator.handshake_headers().await?;
        self.transport.open(&self.endpoint, headers).await
    }

    async fn connect_with(self: &Arc<Self>, origin: Origin) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        let (epoch, cancel) = {
            let mut lifecycle = self.lifecycle();

            if lifecycle.state.is_open() {
                return Ok(());
            }

            match origin {
                Origin::Caller => {
                    lifecycle.intentional_close = false;
                    if let Some(timer) = lifecycle.reconnect_timer.take() {
                        timer.abort();
                    }
                }
                Origin::Reconnect { epoch } => {
                    if lifecycle.epoch != epoch || lifecycle.intentional_close {
                        return Ok(());
                    }
                    // The handle belongs to the task running this attempt
                    lifecycle.reconnect_timer = None;
                }
            }

            lifecycle.epoch = lifecycle.epoch.wrapping_add(1);
            let cancel = CancellationToken::new();
            lifecycle.handshake = Some(cancel.clone());
            self.transition(&mut lifecycle, ConnectionState::Connecting);

            (lifecycle.epoch, cancel)
        };

        let opened = tokio::select! {
            result = self.open_socket() => result,
            () = cancel.cancelled() => Err(WsError::Aborted.into()),
        };

        match opened {
            Ok(socket) => self.on_open(socket, epoch).await,
            Err(error) => Err(self.on_open_failed(error, epoch)),
        }
    }

    async fn on_open(self: &Arc<Self>, mut socket: Box<dyn Socket>, epoch: u64) -> Result<()> {
        let token = CancellationToken::new();

        let superseded = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.epoch == epoch {
                lifecycle.handshake = None;
                lifecycle.backoff.reset();
                lifecycle.has_opened = true;
                lifecycle.socket = Some(token.clone());
                self.transition(
                    &mut lifecycle,
                    ConnectionState::Open {
                        since: Instant::now(),
                    },
                );
                false
            } else {
                true
            }
        };

        if superseded {
            socket.close(NORMAL_CLOSURE, CLIENT_DISCONNECT).await;
            return Err(WsError::Aborted.into());
        }

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.endpoint, "Notification socket open");

        self.router.dispatch(&Event::Connected);
        tokio::spawn(run_socket(Arc::downgrade(self), socket, token, epoch));

        Ok(())
    }

    fn on_open_failed(self: &Arc<Self>, error: Error, epoch: u64) -> Error {
        let report = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.epoch == epoch {
                lifecycle.handshake = None;

                let retry = !is_fatal(error.kind())
                    && lifecycle.has_opened
                    && self.config.auto_reconnect
                    && !lifecycle.intentional_close;
                if retry {
                    self.schedule_reconnect(&mut lifecycle);
                } else {
                    self.transition(&mut lifecycle, ConnectionState::Idle);
                }

                error.kind() != Kind::Configuration
            } else {
                // disconnect() already settled the lifecycle
                false
            }
        };

        #[cfg(feature = "tracing")]
        tracing::warn!(error = %error, "Unable to connect");

        if report {
            self.router
                .dispatch(&Event::Error(ErrorEvent::new(error.to_string())));
        }

        error
    }

    fn schedule_reconnect(self: &Arc<Self>, lifecycle: &mut Lifecycle) {
        let delay = lifecycle
            .backoff
            .next_backoff()
            .unwrap_or(self.config.max_reconnect_delay);
        let attempt = lifecycle.backoff.attempt();
        let epoch = lifecycle.epoch;

        #[cfg(feature = "tracing")]
        tracing::info!(attempt, ?delay, "Scheduling reconnect");

        if let Some(stale) = lifecycle.reconnect_timer.take() {
            stale.abort();
        }

        let inner = Arc::downgrade(self);
        lifecycle.reconnect_timer = Some(tokio::spawn(async move {
            sleep(delay).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Err(e) = inner.connect_with(Origin::Reconnect { epoch }).await {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, attempt, "Reconnect attempt failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }));

        self.transition(
            lifecycle,
            ConnectionState::WaitingToReconnect { attempt, delay },
        );
    }

    fn handle_frame(&self, text: &str) {
        #[cfg(feature = "tracing")]
        tracing::trace!(%text, "Received notification frame");

        match self.parser.parse(text.as_bytes()) {
            Ok(events) => {
                for event in &events {
                    self.router.dispatch(event);
                }
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "Dropping malformed frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn handle_close(self: &Arc<Self>, epoch: u64, code: u16, reason: String) {
        let report = {
            let mut lifecycle = self.lifecycle();

            if lifecycle.epoch == epoch {
                lifecycle.socket = None;
                if self.config.auto_reconnect && !lifecycle.intentional_close {
                    self.schedule_reconnect(&mut lifecycle);
                } else {
                    self.transition(&mut lifecycle, ConnectionState::Idle);
                }
                true
            } else if lifecycle.state == ConnectionState::Closing {
                self.transition(&mut lifecycle, ConnectionState::Idle);
                true
            } else {
                // A newer connection owns the lifecycle
                false
            }
        };

        #[cfg(feature = "tracing")]
        tracing::info!(code, %reason, "Notification socket closed");

        if report {
            self.router
                .dispatch(&Event::Disconnected(Disconnect::new(code, reason)));
        }
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(timer) = lifecycle.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(handshake) = lifecycle.handshake.take() {
            handshake.cancel();
        }
        if let Some(socket) = lifecycle.socket.take() {
            socket.cancel();
        }
    }
}

/// Failures that retrying cannot fix: missing or malformed credentials.
const fn is_fatal(kind: Kind) -> bool {
    matches!(kind, Kind::Configuration | Kind::Validation)
}

/// Pumps `socket` until it closes or `cancel` fires.
async fn run_socket<T: Transport>(
    inner: Weak<Inner<T>>,
    mut socket: Box<dyn Socket>,
    cancel: CancellationToken,
    epoch: u64,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                socket.close(NORMAL_CLOSURE, CLIENT_DISCONNECT).await;
                if let Some(inner) = inner.upgrade() {
                    inner.handle_close(epoch, NORMAL_CLOSURE, CLIENT_DISCONNECT.to_owned());
                }
                return;
            }
            event = socket.next_event() => {
                let Some(inner) = inner.upgrade() else {
                    socket.close(NORMAL_CLOSURE, CLIENT_DISCONNECT).await;
                    return;
                };

                match event {
                    Some(SocketEvent::Message(text)) => inner.handle_frame(&text),
                    Some(SocketEvent::Pong) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!("Received pong");
                    }
                    Some(SocketEvent::Error(error)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %error, "Notification socket error");

                        inner
                            .router
                            .dispatch(&Event::Error(ErrorEvent::new(error.to_string())));
                    }
                    Some(SocketEvent::Close { code, reason }) => {
                        inner.handle_close(epoch, code, reason);
                        return;
                    }
                    None => {
                        inner.handle_close(epoch, ABNORMAL_CLOSURE, String::new());
                        return;
                    }
                }
            }
        }
    }
}
