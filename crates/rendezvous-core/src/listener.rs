//! Rendezvous change notifications.
//!
//! State changes are queued on a channel and delivered by a dispatcher task,
//! so listener code never runs while an internal lock is held.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::contact::Contact;
use crate::sync::StateLock;

/// Observer of an identity's rendezvous
pub trait RendezvousListener: Send + Sync + 'static {
    /// A rendezvous became operational
    fn rendezvous_changed(&self, rendezvous: &Contact);
}

impl<F> RendezvousListener for F
where
    F: Fn(&Contact) + Send + Sync + 'static,
{
    fn rendezvous_changed(&self, rendezvous: &Contact) {
        self(rendezvous);
    }
}

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Vec<(ListenerId, Arc<dyn RendezvousListener>)>;

pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Arc<StateLock<ListenerList>>,
    events: mpsc::UnboundedSender<Contact>,
    receiver: StateLock<Option<mpsc::UnboundedReceiver<Contact>>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            next_id: AtomicU64::new(1),
            listeners: Arc::new(StateLock::new("listeners", Vec::new())),
            events,
            receiver: StateLock::new("listener-queue", Some(receiver)),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn RendezvousListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Queue a notification for all listeners
    pub(crate) fn notify(&self, rendezvous: Contact) {
        // Fails only once the dispatcher is gone, at shutdown
        if self.events.send(rendezvous).is_err() {
            tracing::trace!("Listener dispatcher stopped, notification dropped");
        }
    }

    /// Start delivering queued notifications; only the first call spawns
    pub(crate) fn spawn_dispatcher(&self) -> Option<JoinHandle<()>> {
        let mut receiver = self.receiver.lock().take()?;
        let listeners = Arc::clone(&self.listeners);

        Some(tokio::spawn(async move {
            while let Some(rendezvous) = receiver.recv().await {
                let snapshot: Vec<_> = listeners
                    .lock()
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect();
                for listener in snapshot {
                    listener.rendezvous_changed(&rendezvous);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn contact() -> Contact {
        Contact::from_address("10.0.0.2:6881".parse().unwrap())
    }

    #[tokio::test]
    async fn test_dispatch_to_listeners() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        registry.add(Arc::new(move |c: &Contact| s.lock().push(c.clone())));
        let dispatcher = registry.spawn_dispatcher().unwrap();
        assert!(registry.spawn_dispatcher().is_none());

        registry.notify(contact());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(*seen.lock(), vec![contact()]);
        dispatcher.abort();
    }

    #[tokio::test]
    async fn test_removed_listener_not_called() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(0u32));

        let s = seen.clone();
        let id = registry.add(Arc::new(move |_: &Contact| *s.lock() += 1));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        let dispatcher = registry.spawn_dispatcher().unwrap();
        registry.notify(contact());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(*seen.lock(), 0);
        dispatcher.abort();
    }

    #[tokio::test]
    async fn test_listener_may_reenter_registry() {
        let registry = Arc::new(ListenerRegistry::new());
        let seen = Arc::new(Mutex::new(0u32));

        // A listener that registers another listener must not deadlock
        let r = registry.clone();
        let s = seen.clone();
        registry.add(Arc::new(move |_: &Contact| {
            *s.lock() += 1;
            r.add(Arc::new(|_: &Contact| {}));
        }));

        let dispatcher = registry.spawn_dispatcher().unwrap();
        registry.notify(contact());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(*seen.lock(), 1);
        dispatcher.abort();
    }
}
