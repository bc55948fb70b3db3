//! Membership events and ordered delivery to listeners

use crate::member::Member;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Kinds of membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEventType {
    MemberAdded,
    MetadataChanged,
    ReachabilityChanged,
    MemberRemoved,
}

/// A membership change observed by the local member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub event_type: MembershipEventType,
    pub subject: Member,
    pub time: DateTime<Utc>,
}

impl MembershipEvent {
    pub fn new(event_type: MembershipEventType, subject: Member) -> Self {
        Self {
            event_type,
            subject,
            time: Utc::now(),
        }
    }
}

/// Consumer of membership events.
///
/// Listeners are invoked one event at a time, in the order the events were
/// produced, from a dedicated delivery task.
pub trait MembershipEventListener: Send + Sync {
    fn event(&self, event: &MembershipEvent);
}

impl<F> MembershipEventListener for F
where
    F: Fn(&MembershipEvent) + Send + Sync,
{
    fn event(&self, event: &MembershipEvent) {
        self(event)
    }
}

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Listeners {
    listeners: DashMap<ListenerId, Arc<dyn MembershipEventListener>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Listeners {
    fn deliver(&self, event: &MembershipEvent) {
        trace!("Delivering {:?} for {}", event.event_type, event.subject.id);

        let listeners: Vec<Arc<dyn MembershipEventListener>> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.event(event))).is_err() {
                warn!("Membership event listener panicked on {:?}", event.event_type);
            }
        }

        // No subscribers is not an error
        let _ = self.events.send(event.clone());
    }
}

/// Serializes membership events onto a single delivery path.
///
/// Events posted before the delivery task is started are buffered and
/// delivered once it runs.
pub struct EventNotifier {
    listeners: Arc<Listeners>,
    sender: mpsc::UnboundedSender<MembershipEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<MembershipEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl EventNotifier {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1000);

        Self {
            listeners: Arc::new(Listeners {
                listeners: DashMap::new(),
                events,
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            dispatcher: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start the delivery task. Calling this again is a no-op.
    pub fn start(&self) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut receiver) = receiver {
            let listeners = self.listeners.clone();
            let handle = tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    listeners.deliver(&event);
                }
            });
            *self
                .dispatcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
    }

    /// Queue an event for delivery
    pub fn post(&self, event: MembershipEvent) {
        if self.sender.send(event).is_err() {
            warn!("Membership event dropped: delivery task is gone");
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MembershipEventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.listeners.insert(id, listener);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.listeners.remove(&id).is_some()
    }

    /// Stream of every event delivered after this call
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.listeners.events.subscribe()
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventNotifier {
    fn drop(&mut self) {
        if let Some(handle) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberState;
    use std::time::Duration;

    fn event(event_type: MembershipEventType, id: &str) -> MembershipEvent {
        MembershipEvent::new(
            event_type,
            Member::new(id, "127.0.0.1:5000".parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let notifier = EventNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        notifier.add_listener(Arc::new(move |event: &MembershipEvent| {
            sink.lock().unwrap().push(event.subject.id.to_string());
        }));

        // Posted before start, buffered until the delivery task runs
        notifier.post(event(MembershipEventType::MemberAdded, "a"));
        notifier.start();
        notifier.post(event(MembershipEventType::MemberAdded, "b"));
        notifier.post(event(MembershipEventType::MemberRemoved, "c"));

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let notifier = EventNotifier::new();
        notifier.start();
        let mut events = notifier.subscribe();

        let mut removed = event(MembershipEventType::MemberRemoved, "a");
        removed.subject.state = MemberState::Dead;
        notifier.post(removed.clone());

        let received = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, removed);
    }

    #[tokio::test]
    async fn test_remove_listener_and_panicking_listener() {
        let notifier = EventNotifier::new();
        notifier.start();

        let panicking = notifier.add_listener(Arc::new(|_: &MembershipEvent| {
            panic!("listener failure");
        }) as Arc<dyn MembershipEventListener>);
        let mut events = notifier.subscribe();

        notifier.post(event(MembershipEventType::MemberAdded, "a"));
        assert!(events.recv().await.is_ok());

        assert!(notifier.remove_listener(panicking));
        assert!(!notifier.remove_listener(panicking));

        notifier.post(event(MembershipEventType::MemberAdded, "b"));
        assert_eq!(events.recv().await.unwrap().subject.id.as_str(), "b");
    }
}
