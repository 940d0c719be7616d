#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Deeply nested uses in sub-modules are falsely flagged as being unused"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use clawsquare_agent_sdk::auth::{Authenticator, KeyStore, MemoryKeyStore};
use clawsquare_agent_sdk::ws::config::Config;
use clawsquare_agent_sdk::ws::{ConnectionManager, Event, EventName, Listener};
use futures_util::{SinkExt as _, StreamExt as _};
use secrecy::SecretString;
use strum::IntoEnumIterator as _;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

// RFC 8032, section 7.1, test 1
pub const PRIVATE_KEY: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
pub const PUBLIC_KEY: &str = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";

pub const AGENT_ID: &str = "agent-7";
pub const MANIFEST_HASH: &str = "b1946ac92492d2347c6235b4d2611184";

pub const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
enum Command {
    Send(String),
    Close(u16, String),
    /// Drop the TCP stream without a close frame
    Kill,
}

/// Mock notification server.
pub struct MockWsServer {
    pub addr: SocketAddr,
    command_tx: broadcast::Sender<Command>,
    /// Headers of every upgrade request, accepted or not
    handshake_rx: mpsc::UnboundedReceiver<HeaderMap>,
    /// Close frames sent by clients
    close_rx: mpsc::UnboundedReceiver<Option<CloseFrame>>,
    reject: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (command_tx, _) = broadcast::channel::<Command>(100);
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let reject = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicUsize::new(0));

        let commands = command_tx.clone();
        let rejecting = Arc::clone(&reject);
        let accepted_count = Arc::clone(&accepted);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                // Subscribe before the handshake so nothing sent after it completes is lost
                let mut command_rx = commands.subscribe();
                let handshake_tx = handshake_tx.clone();
                let close_tx = close_tx.clone();
                let reject = rejecting.load(Ordering::SeqCst);

                let callback = move |request: &Request, response: Response| {
                    drop(handshake_tx.send(request.headers().clone()));
                    if reject {
                        let mut error = ErrorResponse::new(Some("unauthorized".to_owned()));
                        *error.status_mut() = StatusCode::UNAUTHORIZED;
                        return Err(error);
                    }
                    Ok(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };
                accepted_count.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Close(frame))) => {
                                        drop(close_tx.send(frame));
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            command = command_rx.recv() => {
                                match command {
                                    Ok(Command::Send(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Command::Close(code, reason)) => {
                                        let frame = CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: reason.into(),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                        break;
                                    }
                                    Ok(Command::Kill) | Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            command_tx,
            handshake_rx,
            close_rx,
            reject,
            accepted,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Answer every later upgrade request with `401`.
    pub fn reject_handshakes(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    /// Number of completed upgrades.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Send a text frame to all connected clients.
    pub fn send(&self, message: &str) {
        drop(self.command_tx.send(Command::Send(message.to_owned())));
    }

    /// Close every connected client with `code`.
    pub fn close(&self, code: u16, reason: &str) {
        drop(self.command_tx.send(Command::Close(code, reason.to_owned())));
    }

    /// Drop every connected client without a close frame.
    pub fn kill(&self) {
        drop(self.command_tx.send(Command::Kill));
    }

    /// Headers of the next upgrade request.
    pub async fn recv_handshake(&mut self) -> Option<HeaderMap> {
        timeout(TIMEOUT, self.handshake_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Returns whether another upgrade request arrived.
    pub fn has_pending_handshake(&mut self) -> bool {
        self.handshake_rx.try_recv().is_ok()
    }

    /// The next close frame a client sent.
    pub async fn recv_close(&mut self) -> Option<CloseFrame> {
        timeout(TIMEOUT, self.close_rx.recv())
            .await
            .ok()
            .flatten()
            .flatten()
    }
}

#[must_use]
pub fn key_store() -> Arc<dyn KeyStore> {
    Arc::new(MemoryKeyStore::with_keys(
        AGENT_ID,
        SecretString::from(PRIVATE_KEY.to_owned()),
    ))
}

/// Reconnects quickly so the tests do not wait on the production delays.
#[must_use]
pub fn fast_config() -> Config {
    Config::builder()
        .base_reconnect_delay(Duration::from_millis(50))
        .max_reconnect_delay(Duration::from_millis(400))
        .build()
}

pub fn manager(server: &MockWsServer, config: Config) -> ConnectionManager {
    ConnectionManager::new(
        &server.ws_url(),
        Authenticator::new(key_store(), MANIFEST_HASH),
        config,
    )
    .unwrap()
}

/// Forwards every dispatched event into a channel.
pub fn record(manager: &ConnectionManager) -> EventLog {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: Listener = Arc::new(move |event: &Event| {
        drop(tx.send(event.clone()));
    });
    for name in EventName::iter() {
        manager.on(name, Arc::clone(&listener));
    }
    EventLog { rx }
}

pub struct EventLog {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventLog {
    pub async fn next(&mut self) -> Event {
        timeout(TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    /// Returns whether nothing has been dispatched since the last [`Self::next`].
    pub fn is_quiet(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}
