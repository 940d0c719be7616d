//! Persistent notification socket.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: authenticated connection lifecycle with backoff reconnection
//! - [`EventRouter`]: listener registry keyed by [`EventName`]
//! - [`classifier`]: maps inbound frames to [`Event`]s
//! - [`Transport`]: socket capability, [`TungsteniteTransport`] in production
//!
//! # Example
//!
//! ```ignore
//! let connection = ConnectionManager::new(DEFAULT_WS_URL, authenticator, Config::default())?;
//! connection.on(EventName::WatchUpdate, Arc::new(|event: &Event| { /* ... */ }));
//! connection.connect().await?;
//! ```

pub mod backoff;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod router;
pub mod traits;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use connection::{CLIENT_DISCONNECT, ConnectionManager, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use events::{Disconnect, ErrorEvent, Event, EventName};
pub use router::{EventRouter, Listener, ListenerId};
pub use traits::*;
pub use transport::{Socket, SocketEvent, Transport, TungsteniteTransport};
