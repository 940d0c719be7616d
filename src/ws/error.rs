#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// WebSocket connection was closed
    ConnectionClosed {
        /// Close code sent by the peer, `1006` when the socket dropped without one
        code: u16,
        /// Close reason sent by the peer
        reason: String,
    },
    /// A pending `connect()` was abandoned because `disconnect()` was called
    Aborted,
    /// The endpoint is not a `ws://` or `wss://` URL
    InvalidEndpoint(String),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectionClosed { code, reason } => {
                write!(f, "WebSocket connection closed ({code}): {reason}")
            }
            Self::Aborted => write!(f, "WebSocket connect aborted by disconnect"),
            Self::InvalidEndpoint(endpoint) => {
                write!(f, "Invalid WebSocket endpoint: {endpoint}")
            }
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        let kind = match e {
            WsError::InvalidEndpoint(_) => crate::error::Kind::Configuration,
            _ => crate::error::Kind::WebSocket,
        };
        crate::error::Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}
