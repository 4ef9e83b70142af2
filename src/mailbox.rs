//! Per-agent inbound message queue.
//!
//! The transport pushes from any thread; the owning agent is the only
//! consumer, so every mutation of auction and map state happens on the agent
//! thread in arrival order.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// A synchronized FIFO with deadline-bounded and draining consumers.
pub struct Mailbox<T> {
    inner: Mutex<MailboxState<T>>,
    available: Condvar,
}

struct MailboxState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Push an item; returns it back if the mailbox is closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        if guard.closed {
            return Err(item);
        }
        guard.queue.push_back(item);
        self.available.notify_one();
        Ok(())
    }

    /// Take everything queued right now.
    pub fn drain(&self) -> Vec<T> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.queue.drain(..).collect()
    }

    /// Block until an item arrives, the mailbox closes, or `deadline` passes.
    pub fn pop_until(&self, deadline: Instant) -> Option<T> {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        loop {
            if let Some(item) = guard.queue.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if guard.closed || now >= deadline {
                return None;
            }
            // Wait releases the lock and re-acquires it before returning.
            let (next, _) = self
                .available
                .wait_timeout(guard, deadline - now)
                .expect("condvar wait failed");
            guard = next;
        }
    }

    /// Close the mailbox and wake all blocked consumers.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("mailbox mutex poisoned");
        guard.closed = true;
        self.available.notify_all();
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
