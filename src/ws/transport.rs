//! Socket capability used by [`super::ConnectionManager`].
//!
//! The manager never touches a network socket directly: it asks a [`Transport`] to perform the
//! handshake and then pulls [`SocketEvent`]s from the returned [`Socket`]. The production
//! implementation is [`TungsteniteTransport`]; tests substitute their own.

use async_trait::async_trait;
use futures::StreamExt as _;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::Result;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code used for a caller-requested disconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the peer's close frame carried no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the socket ended without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Inbound event from an open socket.
#[non_exhaustive]
#[derive(Debug)]
pub enum SocketEvent {
    /// A text frame
    Message(String),
    /// A pong control frame; liveness only
    Pong,
    /// The socket closed. No further events follow.
    Close { code: u16, reason: String },
    /// A transport error. A [`SocketEvent::Close`] follows.
    Error(Error),
}

/// Opens authenticated sockets.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Performs the upgrade handshake with `headers` attached, resolving once the socket is open.
    async fn open(&self, endpoint: &str, headers: HeaderMap) -> Result<Box<dyn Socket>>;
}

/// An open socket.
#[async_trait]
pub trait Socket: Send + 'static {
    /// The next inbound event, or `None` once the socket has finished.
    ///
    /// Must be cancel safe: dropping the returned future loses no event.
    async fn next_event(&mut self) -> Option<SocketEvent>;

    /// Sends a close frame with `code` and `reason`.
    async fn close(&mut self, code: u16, reason: &str);
}

/// [`Transport`] backed by `tokio-tungstenite`.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, endpoint: &str, headers: HeaderMap) -> Result<Box<dyn Socket>> {
        let mut request = endpoint.into_client_request()?;
        request.headers_mut().extend(headers);

        let (stream, _response) = connect_async(request).await?;

        Ok(Box::new(TungsteniteSocket {
            stream,
            phase: Phase::Live,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Live,
    /// An error was reported; the next call reports the abnormal close.
    Errored,
    Finished,
}

struct TungsteniteSocket {
    stream: WsStream,
    phase: Phase,
}

impl TungsteniteSocket {
    fn finish(&mut self, code: u16, reason: String) -> Option<SocketEvent> {
        self.phase = Phase::Finished;
        Some(SocketEvent::Close { code, reason })
    }
}

#[async_trait]
impl Socket for TungsteniteSocket {
    async fn next_event(&mut self) -> Option<SocketEvent> {
        match self.phase {
            Phase::Finished => return None,
            Phase::Errored => return self.finish(ABNORMAL_CLOSURE, String::new()),
            Phase::Live => {}
        }

        loop {
            let Some(message) = self.stream.next().await else {
                return self.finish(ABNORMAL_CLOSURE, String::new());
            };

            match message {
                Ok(Message::Text(text)) => {
                    return Some(SocketEvent::Message(text.as_str().to_owned()));
                }
                Ok(Message::Pong(_)) => return Some(SocketEvent::Pong),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame.map_or_else(
                        || (NO_STATUS_RECEIVED, String::new()),
                        |frame| (u16::from(frame.code), frame.reason.as_str().to_owned()),
                    );
                    return self.finish(code, reason);
                }
                Ok(_) => {
                    // Binary frames carry nothing on this channel; pings are answered by tungstenite.
                }
                Err(e) => {
                    self.phase = Phase::Errored;
                    return Some(SocketEvent::Error(e.into()));
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };

        if let Err(e) = self.stream.close(Some(frame)).await {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "Failed to send WebSocket close frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
        self.phase = Phase::Finished;
    }
}
