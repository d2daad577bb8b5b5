//! Best-effort change notifications.
//!
//! After every commit the store signals the new head to all listeners.
//! A signal carries no facts: listeners re-scan the log. Signals to a
//! listener that has not yet consumed the previous one are coalesced.

use crate::error::{Result, StoreError};
use crate::types::Serial;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// A new head was committed. Only a hint; the log is the authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification {
    pub head: Serial,
}

struct BusInner {
    /// Registered listeners by id.
    listeners: RwLock<HashMap<u64, Sender<Notification>>>,

    next_id: AtomicU64,

    running: AtomicBool,

    /// While set, signals are dropped on the floor.
    suspended: AtomicBool,
}

/// Fan-out of commit signals. Clones share the same bus; separate
/// `new()` calls give fully isolated buses.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    /// Create a bus in the stopped state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
            }),
        }
    }

    pub fn start(&self) {
        if !self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("notification bus started");
        }
    }

    /// Stop the bus. Every listener is disconnected.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            let dropped = {
                let mut listeners = self.inner.listeners.write();
                let count = listeners.len();
                listeners.clear();
                count
            };
            debug!(listeners = dropped, "notification bus stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Keep listeners connected but silently drop signals.
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::SeqCst);
    }

    /// Register a listener. Fails if the bus is not running.
    pub fn subscribe(&self) -> Result<Notifications> {
        if !self.is_running() {
            return Err(StoreError::Transport("notification bus is not running".into()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(1);
        self.inner.listeners.write().insert(id, sender);
        trace!(listener = id, "notification listener registered");

        Ok(Notifications {
            id,
            receiver,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Signal a new head to every listener.
    pub fn notify(&self, head: Serial) {
        if !self.is_running() || self.inner.suspended.load(Ordering::SeqCst) {
            return;
        }

        let notification = Notification { head };
        let mut to_remove = Vec::new();

        {
            let listeners = self.inner.listeners.read();
            for (id, sender) in listeners.iter() {
                match sender.try_send(notification) {
                    // A pending signal already tells the listener to re-scan.
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => to_remove.push(*id),
                }
            }
        }

        if !to_remove.is_empty() {
            let mut listeners = self.inner.listeners.write();
            for id in to_remove {
                listeners.remove(&id);
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One listener's end of the bus. Unregisters on drop.
pub struct Notifications {
    id: u64,
    receiver: Receiver<Notification>,
    bus: Weak<BusInner>,
}

impl Notifications {
    /// Wait up to `timeout` for a signal. `Err(Transport)` means the bus
    /// went away and the listener must re-subscribe.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Notification>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(n) => Ok(Some(n)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(StoreError::Transport("notification bus disconnected".into()))
            }
        }
    }

    /// The underlying channel, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<Notification> {
        &self.receiver
    }
}

impl Drop for Notifications {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners.write().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_requires_running() {
        let bus = NotificationBus::new();
        assert!(matches!(bus.subscribe(), Err(StoreError::Transport(_))));

        bus.start();
        assert!(bus.subscribe().is_ok());
    }

    #[test]
    fn test_notify_reaches_listener() {
        let bus = NotificationBus::new();
        bus.start();
        let listener = bus.subscribe().unwrap();

        bus.notify(Serial(3));
        let n = listener.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(n, Some(Notification { head: Serial(3) }));
    }

    #[test]
    fn test_signals_coalesce() {
        let bus = NotificationBus::new();
        bus.start();
        let listener = bus.subscribe().unwrap();

        for i in 1..=5 {
            bus.notify(Serial(i));
        }

        assert!(listener
            .recv_timeout(Duration::from_millis(100))
            .unwrap()
            .is_some());
        assert!(listener
            .recv_timeout(Duration::from_millis(20))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stop_disconnects() {
        let bus = NotificationBus::new();
        bus.start();
        let listener = bus.subscribe().unwrap();

        bus.stop();
        assert!(matches!(
            listener.recv_timeout(Duration::from_millis(100)),
            Err(StoreError::Transport(_))
        ));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_suspend_drops_signals() {
        let bus = NotificationBus::new();
        bus.start();
        let listener = bus.subscribe().unwrap();

        bus.suspend();
        bus.notify(Serial(1));
        assert!(listener
            .recv_timeout(Duration::from_millis(20))
            .unwrap()
            .is_none());

        bus.resume();
        bus.notify(Serial(2));
        assert!(listener
            .recv_timeout(Duration::from_millis(100))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_drop_unregisters() {
        let bus = NotificationBus::new();
        bus.start();
        let listener = bus.subscribe().unwrap();
        assert_eq!(bus.listener_count(), 1);
        drop(listener);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_buses_are_isolated() {
        let a = NotificationBus::new();
        let b = NotificationBus::new();
        a.start();
        b.start();
        let listener = b.subscribe().unwrap();

        a.notify(Serial(1));
        assert!(listener
            .recv_timeout(Duration::from_millis(20))
            .unwrap()
            .is_none());
    }
}
