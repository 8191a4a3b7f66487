//! Cooperative cancellation for blocking I/O.
//!
//! The connection workers are plain OS threads parked in blocking reads
//! and writes, so there is no task to simply drop the way an async
//! runtime would. A [`CancellationToken`] is checked at the natural
//! break points in the send/receive loops (between messages, between
//! rectangles) and carried down into anything that can block for an
//! unbounded time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A cloneable, cancel-once flag with a blocking wait.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Requests cancellation and wakes anyone blocked in [`Self::wait`].
    /// Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap();
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns [`crate::Error::Cancelled`] if cancellation has been
    /// requested. Intended to be called with `?` at loop boundaries.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Blocks the calling thread until cancellation is requested or
    /// `timeout` elapses, whichever comes first. Used by workers that
    /// would otherwise sit in an unbounded blocking read with no other
    /// way to observe cancellation.
    pub fn wait_timeout(&self, timeout: Duration) {
        if self.is_cancelled() {
            return;
        }
        let guard = self.inner.lock.lock().unwrap();
        let _ = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled());
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn check_is_ok_until_cancelled() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.check().is_err());
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn wait_timeout_wakes_on_cancel_from_another_thread() {
        let token = CancellationToken::new();
        let other = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            other.cancel();
        });
        token.wait_timeout(Duration::from_secs(5));
        assert!(token.is_cancelled());
        handle.join().unwrap();
    }
}
