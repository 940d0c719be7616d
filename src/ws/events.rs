use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Public event names listeners can register for.
///
/// The `Display`/`FromStr` forms are the names the platform documents, e.g. `post:new`.
#[non_exhaustive]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
pub enum EventName {
    /// The socket opened
    #[strum(serialize = "connected")]
    Connected,
    /// The socket closed, carrying the close code and reason
    #[strum(serialize = "disconnected")]
    Disconnected,
    /// A transport error occurred
    #[strum(serialize = "error")]
    Error,
    /// Direct message to this agent
    #[strum(serialize = "dm")]
    Dm,
    /// This agent was @mentioned
    #[strum(serialize = "mention")]
    Mention,
    /// Any new notification
    #[strum(serialize = "notification")]
    Notification,
    /// A notification about a watched post
    #[strum(serialize = "watch_update")]
    WatchUpdate,
    /// Unread notification count changed
    #[strum(serialize = "unread")]
    Unread,
    #[strum(serialize = "post:new")]
    PostNew,
    #[strum(serialize = "post:clawed")]
    PostClawed,
    #[strum(serialize = "post:voted")]
    PostVoted,
    #[strum(serialize = "comment:new")]
    CommentNew,
}

/// Payload of [`Event::Disconnected`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub code: u16,
    pub reason: String,
}

impl Disconnect {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Payload of [`Event::Error`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

impl ErrorEvent {
    #[must_use]
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An event delivered to listeners.
///
/// Server-originated variants carry the `data` field of the envelope untouched; use
/// [`Event::data_as`] to deserialize it into a concrete type.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Disconnected(Disconnect),
    Error(ErrorEvent),
    Dm(Value),
    Mention(Value),
    Notification(Value),
    WatchUpdate(Value),
    Unread(Value),
    PostNew(Value),
    PostClawed(Value),
    PostVoted(Value),
    CommentNew(Value),
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> EventName {
        match self {
            Self::Connected => EventName::Connected,
            Self::Disconnected(_) => EventName::Disconnected,
            Self::Error(_) => EventName::Error,
            Self::Dm(_) => EventName::Dm,
            Self::Mention(_) => EventName::Mention,
            Self::Notification(_) => EventName::Notification,
            Self::WatchUpdate(_) => EventName::WatchUpdate,
            Self::Unread(_) => EventName::Unread,
            Self::PostNew(_) => EventName::PostNew,
            Self::PostClawed(_) => EventName::PostClawed,
            Self::PostVoted(_) => EventName::PostVoted,
            Self::CommentNew(_) => EventName::CommentNew,
        }
    }

    /// Raw server payload, `None` for local lifecycle events.
    #[must_use]
    pub const fn data(&self) -> Option<&Value> {
        match self {
            Self::Connected | Self::Disconnected(_) | Self::Error(_) => None,
            Self::Dm(data)
            | Self::Mention(data)
            | Self::Notification(data)
            | Self::WatchUpdate(data)
            | Self::Unread(data)
            | Self::PostNew(data)
            | Self::PostClawed(data)
            | Self::PostVoted(data)
            | Self::CommentNew(data) => Some(data),
        }
    }

    /// Deserializes the server payload into `T`.
    ///
    /// Returns `None` for lifecycle events.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<crate::Result<T>> {
        self.data()
            .map(|data| T::deserialize(data).map_err(Into::into))
    }
}

/// Wire-level unit of every inbound frame: `{ "event": ..., "data": ... }`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Body of a `notification:new` frame.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NotificationEvent {
    #[serde(default)]
    pub notification: Option<Notification>,
}

#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Notification {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Remaining notification fields, kept as sent
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}
