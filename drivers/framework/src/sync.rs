//! Blocking event used for quiescence waits.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::irql::NormalContext;

/// Reset behaviour of an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Stays signaled until cleared; releases every waiter
    Notification,
    /// Releases one waiter and clears itself
    Synchronization,
}

/// Kernel-style event
#[derive(Debug)]
pub struct Event {
    kind: EventKind,
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Create an unsignaled event
    pub const fn new(kind: EventKind) -> Self {
        Self {
            kind,
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Unsignaled notification event
    pub const fn notification() -> Self {
        Self::new(EventKind::Notification)
    }

    /// Unsignaled synchronization event
    pub const fn synchronization() -> Self {
        Self::new(EventKind::Synchronization)
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Event kind
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Signal the event; legal from any context
    pub fn set(&self) {
        let mut signaled = self.state();
        *signaled = true;
        match self.kind {
            EventKind::Notification => self.cond.notify_all(),
            EventKind::Synchronization => self.cond.notify_one(),
        }
    }

    /// Reset to unsignaled
    pub fn clear(&self) {
        *self.state() = false;
    }

    /// Current state
    pub fn is_signaled(&self) -> bool {
        *self.state()
    }

    /// Block until signaled
    pub fn wait(&self, _ctx: &NormalContext) {
        let mut signaled = self.state();
        while !*signaled {
            signaled = self
                .cond
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if self.kind == EventKind::Synchronization {
            *signaled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_synchronization_event_auto_clears() {
        let ctx = NormalContext::require();
        let event = Event::synchronization();
        event.set();
        event.wait(&ctx);
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_notification_event_stays_signaled() {
        let ctx = NormalContext::require();
        let event = Event::notification();
        event.set();
        event.wait(&ctx);
        assert!(event.is_signaled());
        event.clear();
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_wait_across_threads() {
        let event = Arc::new(Event::notification());
        let setter = Arc::clone(&event);

        let handle = thread::spawn(move || setter.set());
        event.wait(&NormalContext::require());
        handle.join().unwrap();
        assert!(event.is_signaled());
    }
}
