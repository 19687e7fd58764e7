//! Topic-keyed listener registry.
//!
//! Every state change the engine makes is published here. Subscribers get a
//! [`Subscription`] handle; dropping it or calling [`Subscription::remove`]
//! detaches exactly that callback.
//!
//! Delivery is queued: an event emitted while another is being delivered
//! (including from inside a callback) waits until the current one has reached
//! every listener, so listeners of a topic always observe emission order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use inbox_shared::{AuthEvent, FeedType, InboxError, Message};

use crate::feed::FeedSnapshot;
use crate::lock;
use crate::transport::ConnectionState;

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Auth,
    Feed(FeedType),
    UnreadCount,
    Connection,
    Errors,
    MessageClick,
}

/// Events published by the engine.
#[derive(Debug, Clone)]
pub enum InboxEvent {
    Auth(AuthEvent),
    FeedChanged(FeedSnapshot),
    UnreadCountChanged { feed: FeedType, count: u64 },
    Connection(ConnectionState),
    Error(InboxError),
    MessageClicked(Message),
}

impl InboxEvent {
    pub fn topic(&self) -> Topic {
        match self {
            InboxEvent::Auth(_) => Topic::Auth,
            InboxEvent::FeedChanged(snapshot) => Topic::Feed(snapshot.feed.clone()),
            InboxEvent::UnreadCountChanged { .. } => Topic::UnreadCount,
            InboxEvent::Connection(_) => Topic::Connection,
            InboxEvent::Error(_) => Topic::Errors,
            InboxEvent::MessageClicked(_) => Topic::MessageClick,
        }
    }
}

type Callback = Arc<dyn Fn(&InboxEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    /// Keyed by subscription id, so iteration follows registration order.
    subscribers: BTreeMap<u64, (Topic, Callback)>,
    queue: VecDeque<InboxEvent>,
    dispatching: bool,
}

/// Shared handle to the registry. Cloning shares the same subscribers.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = lock(&self.inner);
        f.debug_struct("ListenerRegistry")
            .field("subscribers", &registry.subscribers.len())
            .field("queued", &registry.queue.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        topic: Topic,
        callback: impl Fn(&InboxEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = lock(&self.inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.insert(id, (topic, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscriptions for `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        lock(&self.inner)
            .subscribers
            .values()
            .filter(|(t, _)| t == topic)
            .count()
    }

    /// Publish an event and deliver everything queued.
    pub fn emit(&self, event: InboxEvent) {
        self.enqueue(event);
        self.dispatch();
    }

    /// Queue an event without delivering it.
    ///
    /// Lets callers fix the order of events while holding their own lock, then
    /// deliver with [`dispatch`](Self::dispatch) once the lock is released.
    pub(crate) fn enqueue(&self, event: InboxEvent) {
        lock(&self.inner).queue.push_back(event);
    }

    /// Deliver queued events unless a delivery is already running, in which
    /// case that delivery picks them up.
    pub(crate) fn dispatch(&self) {
        {
            let mut registry = lock(&self.inner);
            if registry.dispatching {
                return;
            }
            registry.dispatching = true;
        }
        let mut guard = DispatchGuard {
            registry: &self.inner,
            armed: true,
        };

        loop {
            let (event, callbacks) = {
                let mut registry = lock(&self.inner);
                let Some(event) = registry.queue.pop_front() else {
                    // Cleared under the same lock that saw the queue empty, so
                    // a concurrent enqueue either lands here or dispatches itself.
                    registry.dispatching = false;
                    guard.armed = false;
                    return;
                };
                let topic = event.topic();
                let callbacks: Vec<Callback> = registry
                    .subscribers
                    .values()
                    .filter(|(t, _)| *t == topic)
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect();
                (event, callbacks)
            };

            for callback in callbacks {
                callback(&event);
            }
        }
    }
}

/// Clears the dispatching flag if a callback panics.
struct DispatchGuard<'a> {
    registry: &'a Arc<Mutex<Registry>>,
    armed: bool,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.registry).dispatching = false;
        }
    }
}

/// Handle to one registered callback.
///
/// Removal is idempotent and safe after the registry itself is gone.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remove(&self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).subscribers.remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_shared::AuthCause;

    fn error_event(n: u64) -> InboxEvent {
        InboxEvent::Error(InboxError::MessageNotFound(n.to_string()))
    }

    fn error_id(event: &InboxEvent) -> String {
        match event {
            InboxEvent::Error(InboxError::MessageNotFound(id)) => id.clone(),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn delivers_only_to_matching_topic() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _errors = registry.subscribe(Topic::Errors, move |e| {
            sink.lock().unwrap().push(error_id(e));
        });
        let _auth = registry.subscribe(Topic::Auth, |_| panic!("auth listener must not fire"));

        registry.emit(error_event(1));
        assert_eq!(*seen.lock().unwrap(), vec!["1"]);
    }

    #[test]
    fn remove_is_idempotent_and_survives_registry_drop() {
        let registry = ListenerRegistry::new();
        let sub = registry.subscribe(Topic::Errors, |_| {});
        assert_eq!(registry.subscriber_count(&Topic::Errors), 1);
        sub.remove();
        sub.remove();
        assert_eq!(registry.subscriber_count(&Topic::Errors), 0);

        let late = registry.subscribe(Topic::Auth, |_| {});
        drop(registry);
        late.remove();
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let registry = ListenerRegistry::new();
        {
            let _sub = registry.subscribe(Topic::Errors, |_| {});
            assert_eq!(registry.subscriber_count(&Topic::Errors), 1);
        }
        assert_eq!(registry.subscriber_count(&Topic::Errors), 0);
    }

    #[test]
    fn removing_inside_callback_keeps_current_delivery() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let second: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = second.clone();
        let log = seen.clone();
        let _first = registry.subscribe(Topic::Errors, move |e| {
            log.lock().unwrap().push(format!("first:{}", error_id(e)));
            if let Some(sub) = slot.lock().unwrap().as_ref() {
                sub.remove();
            }
        });
        let log = seen.clone();
        *second.lock().unwrap() = Some(registry.subscribe(Topic::Errors, move |e| {
            log.lock().unwrap().push(format!("second:{}", error_id(e)));
        }));

        registry.emit(error_event(1));
        registry.emit(error_event(2));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:1", "second:1", "first:2"]
        );
    }

    #[test]
    fn reentrant_emit_is_delivered_after_current_event() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_registry = registry.clone();
        let log = seen.clone();
        let _a = registry.subscribe(Topic::Errors, move |e| {
            let id = error_id(e);
            log.lock().unwrap().push(format!("a:{id}"));
            if id == "1" {
                inner_registry.emit(error_event(2));
            }
        });
        let log = seen.clone();
        let _b = registry.subscribe(Topic::Errors, move |e| {
            log.lock().unwrap().push(format!("b:{}", error_id(e)));
        });

        registry.emit(error_event(1));

        assert_eq!(*seen.lock().unwrap(), vec!["a:1", "b:1", "a:2", "b:2"]);
    }

    #[test]
    fn enqueue_defers_until_dispatch() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let _sub = registry.subscribe(Topic::Auth, move |e| {
            if let InboxEvent::Auth(event) = e {
                log.lock().unwrap().push(event.cause);
            }
        });

        registry.enqueue(InboxEvent::Auth(AuthEvent {
            identity: None,
            cause: AuthCause::SignedOut,
        }));
        assert!(seen.lock().unwrap().is_empty());
        registry.dispatch();
        assert_eq!(*seen.lock().unwrap(), vec![AuthCause::SignedOut]);
    }
}
