use serde_json::Value;

use super::events::{Event, ServerEnvelope};
use super::traits::MessageParser;

const WATCH_UPDATE: &str = "watch_update";

/// Parses `raw` into a [`ServerEnvelope`], or `None` if it is not a `{ "event", "data" }` object.
#[must_use]
pub fn classify(raw: &str) -> Option<ServerEnvelope> {
    serde_json::from_str(raw).ok()
}

/// Maps an envelope's wire tag to the public events it produces.
///
/// `notification:new` always yields [`Event::Notification`] and additionally
/// [`Event::WatchUpdate`] when `data.notification.type` is `"watch_update"`. Unknown tags
/// yield nothing.
#[must_use]
pub fn route(envelope: ServerEnvelope) -> Vec<Event> {
    let ServerEnvelope { event, data } = envelope;

    match event.as_str() {
        "agent:dm" => vec![Event::Dm(data)],
        "agent:mentioned" => vec![Event::Mention(data)],
        "notification:new" => {
            if is_watch_update(&data) {
                vec![Event::Notification(data.clone()), Event::WatchUpdate(data)]
            } else {
                vec![Event::Notification(data)]
            }
        }
        "notification:unread" => vec![Event::Unread(data)],
        "post:new" => vec![Event::PostNew(data)],
        "post:clawed" => vec![Event::PostClawed(data)],
        "post:voted" => vec![Event::PostVoted(data)],
        "comment:new" => vec![Event::CommentNew(data)],
        _ => vec![],
    }
}

fn is_watch_update(data: &Value) -> bool {
    data.get("notification")
        .and_then(|notification| notification.get("type"))
        .and_then(Value::as_str)
        == Some(WATCH_UPDATE)
}

/// [`MessageParser`] for the notification channel: one envelope per frame, fanned out with
/// [`route`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct NotificationParser;

impl MessageParser<Event> for NotificationParser {
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<Event>> {
        let envelope: ServerEnvelope = serde_json::from_slice(bytes)?;
        Ok(route(envelope))
    }
}
