use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::events::{Event, EventName};

/// Callback invoked with every event published under the name it was registered for.
///
/// Listeners run synchronously on the task that received the frame, so long-running work
/// should be handed off (e.g. to a channel or a spawned task).
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Handle returned by [`EventRouter::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Registry of listeners keyed by [`EventName`].
///
/// Each name holds a set of listeners: registering the same [`Listener`] (the same `Arc`) twice
/// under one name yields the same [`ListenerId`] and a single delivery per event. Dispatch
/// iterates a snapshot, so listeners may subscribe or unsubscribe (themselves included) while
/// being invoked.
#[derive(Default)]
pub struct EventRouter {
    listeners: DashMap<EventName, BTreeMap<ListenerId, Listener>>,
    next_id: AtomicU64,
}

impl EventRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, name: EventName, listener: Listener) -> ListenerId {
        let mut slot = self.listeners.entry(name).or_default();

        if let Some(id) = slot
            .iter()
            .find_map(|(id, existing)| same_listener(existing, &listener).then_some(*id))
        {
            return id;
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        slot.insert(id, listener);
        id
    }

    /// Removes the listener registered as `id`. Returns whether anything was removed.
    pub fn unsubscribe(&self, name: EventName, id: ListenerId) -> bool {
        self.listeners
            .get_mut(&name)
            .is_some_and(|mut slot| slot.remove(&id).is_some())
    }

    /// Removes `listener` by identity. Returns whether anything was removed.
    pub fn remove_listener(&self, name: EventName, listener: &Listener) -> bool {
        self.listeners.get_mut(&name).is_some_and(|mut slot| {
            let before = slot.len();
            slot.retain(|_, existing| !same_listener(existing, listener));
            slot.len() != before
        })
    }

    /// Invokes every listener registered for `event.name()`.
    ///
    /// A panicking listener is caught and ignored; the remaining listeners still run and the
    /// panic never reaches the caller.
    pub fn dispatch(&self, event: &Event) {
        let snapshot: Vec<Listener> = match self.listeners.get(&event.name()) {
            Some(slot) => slot.values().cloned().collect(),
            None => return,
        };

        for listener in snapshot {
            _ = panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
        }
    }

    #[must_use]
    pub fn listener_count(&self, name: EventName) -> usize {
        self.listeners.get(&name).map_or(0, |slot| slot.len())
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<EventName, usize> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().len()))
            .collect();

        f.debug_struct("EventRouter")
            .field("listeners", &counts)
            .finish_non_exhaustive()
    }
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn failing_listener(_: &Event) {
        panic!("listener failure");
    }

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener: Listener = Arc::new(move |_: &Event| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    #[test]
    fn dispatch_reaches_only_matching_name() {
        let router = EventRouter::new();
        let (dms, dm_listener) = counter();
        let (mentions, mention_listener) = counter();
        router.subscribe(EventName::Dm, dm_listener);
        router.subscribe(EventName::Mention, mention_listener);

        router.dispatch(&Event::Dm(json!({ "text": "hi" })));

        assert_eq!(dms.load(Ordering::SeqCst), 1);
        assert_eq!(mentions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispatch_without_listeners_is_noop() {
        let router = EventRouter::new();
        router.dispatch(&Event::Connected);
        assert_eq!(router.listener_count(EventName::Connected), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let router = EventRouter::new();
        let (count, listener) = counter();
        router.subscribe(EventName::Unread, Arc::new(failing_listener));
        router.subscribe(EventName::Unread, listener);

        router.dispatch(&Event::Unread(json!({ "count": 3 })));
        router.dispatch(&Event::Unread(json!({ "count": 4 })));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn same_listener_registered_twice_fires_once() {
        let router = EventRouter::new();
        let (count, listener) = counter();

        let first = router.subscribe(EventName::PostNew, Arc::clone(&listener));
        let second = router.subscribe(EventName::PostNew, Arc::clone(&listener));
        router.dispatch(&Event::PostNew(json!({})));

        assert_eq!(first, second);
        assert_eq!(router.listener_count(EventName::PostNew), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let router = EventRouter::new();
        let (_, listener) = counter();
        let id = router.subscribe(EventName::Dm, listener);

        assert!(!router.unsubscribe(EventName::Mention, id));
        assert!(router.unsubscribe(EventName::Dm, id));
        assert!(!router.unsubscribe(EventName::Dm, id));
    }

    #[test]
    fn remove_listener_by_identity() {
        let router = EventRouter::new();
        let (count, listener) = counter();
        router.subscribe(EventName::CommentNew, Arc::clone(&listener));

        assert!(router.remove_listener(EventName::CommentNew, &listener));
        router.dispatch(&Event::CommentNew(json!({})));

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_can_unsubscribe_itself_during_dispatch() {
        let router = Arc::new(EventRouter::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(OnceLock::new());

        let listener: Listener = {
            let router = Arc::clone(&router);
            let calls = Arc::clone(&calls);
            let own_id = Arc::clone(&own_id);
            Arc::new(move |_: &Event| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = own_id.get() {
                    router.unsubscribe(EventName::Notification, *id);
                }
            })
        };
        let (others, other_listener) = counter();

        own_id
            .set(router.subscribe(EventName::Notification, listener))
            .unwrap();
        router.subscribe(EventName::Notification, other_listener);

        router.dispatch(&Event::Notification(json!({})));
        router.dispatch(&Event::Notification(json!({})));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(others.load(Ordering::SeqCst), 2);
    }
}
