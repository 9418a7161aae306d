//! Login/logout notifications for collaborators.
//!
//! Anything that needs to react to sessions coming and going (audit
//! logs, per-user caches, admin consoles) implements [`SessionListener`]
//! and registers with [`SessionManager::add_listener`](crate::SessionManager::add_listener).

use std::sync::{Arc, Mutex, PoisonError};

use crate::{Session, Subject};

/// A lifecycle change in the registry.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A subject became alive (first session of a login).
    SubjectAdded(Arc<Subject>),
    /// A subject shut down (last session of a login left).
    SubjectRemoved(Arc<Subject>),
    /// A session was created and indexed.
    SessionAdded(Arc<Session>),
    /// A session was resumed or its connection properties changed.
    SessionUpdated(Arc<Session>),
    /// A session is about to be removed. It is still reachable by token.
    SessionPreRemove(Arc<Session>),
    /// A session was removed from the registry.
    SessionRemoved(Arc<Session>),
}

impl SessionEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SubjectAdded(_) => "subject_added",
            Self::SubjectRemoved(_) => "subject_removed",
            Self::SessionAdded(_) => "session_added",
            Self::SessionUpdated(_) => "session_updated",
            Self::SessionPreRemove(_) => "session_pre_remove",
            Self::SessionRemoved(_) => "session_removed",
        }
    }
}

/// Receives registry lifecycle events.
///
/// Called synchronously on the task that caused the change, with no
/// registry lock held. Implementations should be quick; anything slow
/// belongs on a channel. A listener may add or remove listeners
/// (including itself) from inside `on_event`.
pub trait SessionListener: Send + Sync + 'static {
    /// Handles one event.
    fn on_event(&self, event: &SessionEvent);
}

/// Listener set with snapshot-on-read iteration.
#[derive(Default)]
pub(crate) struct Listeners {
    inner: Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn SessionListener>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            inner.push(listener);
        }
    }

    /// Returns `true` if the listener was registered.
    pub(crate) fn remove(&self, listener: &Arc<dyn SessionListener>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.len();
        inner.retain(|l| !Arc::ptr_eq(l, listener));
        inner.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Delivers `event` to a point-in-time copy of the listener list.
    pub(crate) fn fire(&self, event: SessionEvent) {
        let snapshot: Vec<Arc<dyn SessionListener>> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tracing::trace!(kind = event.kind(), listeners = snapshot.len(), "firing event");
        for listener in snapshot {
            listener.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    use warden_protocol::SessionName;

    use super::*;

    #[derive(Default)]
    struct Counting {
        seen: AtomicUsize,
    }

    impl SessionListener for Counting {
        fn on_event(&self, _event: &SessionEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Removes itself from the set the first time it is called.
    struct OneShot {
        listeners: Weak<Listeners>,
        me: Mutex<Option<Arc<dyn SessionListener>>>,
        seen: AtomicUsize,
    }

    impl SessionListener for OneShot {
        fn on_event(&self, _event: &SessionEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            let me = self.me.lock().unwrap().take();
            if let (Some(listeners), Some(me)) = (self.listeners.upgrade(), me) {
                listeners.remove(&me);
            }
        }
    }

    fn event() -> SessionEvent {
        let name = SessionName::parse("alice", None).unwrap();
        SessionEvent::SubjectAdded(Arc::new(Subject::new(name, Default::default())))
    }

    #[test]
    fn test_add_is_idempotent_per_listener() {
        let listeners = Listeners::default();
        let counting: Arc<dyn SessionListener> = Arc::new(Counting::default());
        listeners.add(Arc::clone(&counting));
        listeners.add(Arc::clone(&counting));
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_fire_reaches_every_listener() {
        let listeners = Listeners::default();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        listeners.add(a.clone());
        listeners.add(b.clone());

        listeners.fire(event());

        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_unknown_listener_returns_false() {
        let listeners = Listeners::default();
        let stranger: Arc<dyn SessionListener> = Arc::new(Counting::default());
        assert!(!listeners.remove(&stranger));
    }

    #[test]
    fn test_listener_can_remove_itself_during_fire() {
        let listeners = Arc::new(Listeners::default());
        let one_shot = Arc::new(OneShot {
            listeners: Arc::downgrade(&listeners),
            me: Mutex::new(None),
            seen: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn SessionListener> = one_shot.clone();
        *one_shot.me.lock().unwrap() = Some(Arc::clone(&as_dyn));
        let counting = Arc::new(Counting::default());
        listeners.add(as_dyn);
        listeners.add(counting.clone());

        listeners.fire(event());
        listeners.fire(event());

        assert_eq!(one_shot.seen.load(Ordering::SeqCst), 1);
        assert_eq!(counting.seen.load(Ordering::SeqCst), 2);
        assert_eq!(listeners.len(), 1);
    }
}
