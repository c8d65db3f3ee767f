//! Observer registration and ordered delivery.
//!
//! Transitions enqueue a [`Notification`] while the connection lock is held.
//! After the lock is released, one caller at a time drains the queue and
//! invokes observers with no lock held, so observers may call back into the
//! connection. Notifications raised during delivery join the same queue and
//! are delivered in order by the active drainer.

use std::collections::BTreeMap;
use std::sync::Arc;

use lifeline_core::{ConnectionError, ConnectionState, ObserverId, StateChange};

/// Called with `(old, new)` for every transition.
pub type StateObserver = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;
/// Called with each inbound application frame.
pub type MessageObserver = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Called with each classified close or failure.
pub type ErrorObserver = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// One queued delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// A state transition.
    State(StateChange),
    /// An inbound application frame.
    Message(Vec<u8>),
    /// A classified close or failure.
    Error(ConnectionError),
}

/// Registered observers, one map per event kind.
#[derive(Default)]
pub struct Observers {
    state: BTreeMap<ObserverId, StateObserver>,
    message: BTreeMap<ObserverId, MessageObserver>,
    error: BTreeMap<ObserverId, ErrorObserver>,
}

impl Observers {
    /// Register a state observer.
    pub fn add_state(&mut self, observer: StateObserver) -> ObserverId {
        let id = ObserverId::next();
        let _ = self.state.insert(id, observer);
        id
    }

    /// Register a message observer.
    pub fn add_message(&mut self, observer: MessageObserver) -> ObserverId {
        let id = ObserverId::next();
        let _ = self.message.insert(id, observer);
        id
    }

    /// Register an error observer.
    pub fn add_error(&mut self, observer: ErrorObserver) -> ObserverId {
        let id = ObserverId::next();
        let _ = self.error.insert(id, observer);
        id
    }

    /// Remove an observer of any kind. Returns `false` if `id` is unknown.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        self.state.remove(&id).is_some()
            || self.message.remove(&id).is_some()
            || self.error.remove(&id).is_some()
    }

    /// Total registered observers.
    pub fn len(&self) -> usize {
        self.state.len() + self.message.len() + self.error.len()
    }

    /// Whether no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observers interested in `notification`, in registration order.
    pub fn targets(&self, notification: &Notification) -> Targets {
        match notification {
            Notification::State(_) => Targets::State(self.state.values().cloned().collect()),
            Notification::Message(_) => {
                Targets::Message(self.message.values().cloned().collect())
            }
            Notification::Error(_) => Targets::Error(self.error.values().cloned().collect()),
        }
    }
}

/// Cloned observer list for one notification, callable without the registry lock.
pub enum Targets {
    /// State observers.
    State(Vec<StateObserver>),
    /// Message observers.
    Message(Vec<MessageObserver>),
    /// Error observers.
    Error(Vec<ErrorObserver>),
}

impl Targets {
    /// Invoke every observer with `notification`.
    pub fn deliver(self, notification: &Notification) {
        match (self, notification) {
            (Self::State(observers), Notification::State(change)) => {
                for observer in observers {
                    observer(change.old, change.new);
                }
            }
            (Self::Message(observers), Notification::Message(frame)) => {
                for observer in observers {
                    observer(frame);
                }
            }
            (Self::Error(observers), Notification::Error(err)) => {
                for observer in observers {
                    observer(err);
                }
            }
            _ => {}
        }
    }
}
