//! Change notifications.
//!
//! Observers and filters announce changes (subjects added or removed, activity
//! changed, context destroyed) through [`Signal`]s. Handlers run directly on
//! the emitting thread, in the order they were connected.
//!
//! # Example
//!
//! ```
//! use horizon_observer_core::Signal;
//!
//! let subject_count = Signal::<usize>::new();
//! let handler = subject_count.connect(|count| {
//!     println!("now {count} subjects");
//! });
//! subject_count.emit(3);
//! subject_count.disconnect(handler);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::logging::targets;

new_key_type! {
    /// Handle returned by [`Signal::connect`].
    pub struct ConnectionId;
}

type Handler<Args> = Arc<dyn Fn(&Args) + Send + Sync>;

/// A list of handlers invoked with `&Args` on every emit.
///
/// Handlers are cloned out of the list before any of them runs, so a
/// handler may connect, disconnect or emit on the same signal.
pub struct Signal<Args> {
    handlers: Mutex<SlotMap<ConnectionId, Handler<Args>>>,
    muted: AtomicBool,
}

impl<Args> Default for Signal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args> Signal<Args> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(SlotMap::with_key()),
            muted: AtomicBool::new(false),
        }
    }

    pub fn connect<F>(&self, handler: F) -> ConnectionId
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.handlers.lock().insert(Arc::new(handler))
    }

    /// Remove one handler. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.handlers.lock().remove(id).is_some()
    }

    pub fn disconnect_all(&self) {
        self.handlers.lock().clear();
    }

    pub fn connection_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Mute or unmute the signal. A muted signal drops every emit.
    pub fn set_blocked(&self, blocked: bool) {
        self.muted.store(blocked, Ordering::Release);
    }

    pub fn is_blocked(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Invoke every connected handler with `args`.
    pub fn emit(&self, args: Args) {
        if self.is_blocked() {
            tracing::trace!(target: targets::SIGNAL, "muted, emit dropped");
            return;
        }
        let handlers: Vec<Handler<Args>> = self.handlers.lock().values().cloned().collect();
        tracing::trace!(target: targets::SIGNAL, handlers = handlers.len(), "emit");
        for handler in handlers {
            handler(&args);
        }
    }
}

static_assertions::assert_impl_all!(Signal<Vec<u64>>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<T: Clone + Send + 'static>(signal: &Signal<T>) -> (ConnectionId, Arc<Mutex<Vec<T>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = signal.connect(move |value: &T| sink.lock().push(value.clone()));
        (id, seen)
    }

    #[test]
    fn test_handlers_see_every_emit() {
        let renamed = Signal::<String>::new();
        let (_, first) = recorder(&renamed);
        let (_, second) = recorder(&renamed);
        renamed.emit("alpha".into());
        renamed.emit("beta".into());
        assert_eq!(*first.lock(), vec!["alpha", "beta"]);
        assert_eq!(*second.lock(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_disconnected_handler_is_not_called() {
        let count = Signal::<u32>::new();
        let (id, seen) = recorder(&count);
        count.emit(1);
        assert!(count.disconnect(id));
        assert!(!count.disconnect(id));
        count.emit(2);
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(count.connection_count(), 0);
    }

    #[test]
    fn test_muted_signal_drops_emits() {
        let count = Signal::<u32>::new();
        let (_, seen) = recorder(&count);
        count.set_blocked(true);
        count.emit(1);
        count.set_blocked(false);
        count.emit(2);
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn test_handler_may_emit_again() {
        let depth = Arc::new(Signal::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&depth);
        let sink = seen.clone();
        depth.connect(move |&level| {
            sink.lock().push(level);
            if let Some(signal) = weak.upgrade().filter(|_| level < 2) {
                signal.emit(level + 1);
            }
        });
        depth.emit(0);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_handler_may_disconnect_everything() {
        let closed = Arc::new(Signal::<()>::new());
        let weak = Arc::downgrade(&closed);
        closed.connect(move |_| {
            if let Some(signal) = weak.upgrade() {
                signal.disconnect_all();
            }
        });
        closed.connect(|_| {});
        closed.emit(());
        assert_eq!(closed.connection_count(), 0);
    }
}
