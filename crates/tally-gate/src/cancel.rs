// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Observer-side cancellation.
//!
//! A token is a one-shot signal of its own, so a blocked observer can race
//! its wait against it. Cancelling never touches the gate or the tracked
//! tasks; it only releases observers that chose to listen to the token.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::WaitError;
use crate::signal::Signal;

/// Cancellation token shared between an observer and whoever may abandon it.
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct CancelToken {
    signal: Signal,
    lease: Option<Arc<TimerLease>>,
}

/// Held by every clone of a timed token. Dropping the last one releases
/// the timer thread.
#[derive(Debug)]
struct TimerLease {
    released: Signal,
}

impl Drop for TimerLease {
    fn drop(&mut self) {
        self.released.fire();
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            signal: Signal::new(),
            lease: None,
        }
    }

    /// Token that cancels itself once `delay` has elapsed.
    ///
    /// The timer runs on its own thread, which exits early if the token is
    /// cancelled or every clone of it is dropped.
    pub fn cancel_after(delay: Duration) -> Self {
        Self::with_timer(delay).0
    }

    fn with_timer(delay: Duration) -> (Self, JoinHandle<()>) {
        let released = Signal::new();
        let token = Self {
            signal: Signal::new(),
            lease: Some(Arc::new(TimerLease {
                released: released.clone(),
            })),
        };
        // Must not hold the lease, or the token could never be released.
        let timer = Self {
            signal: token.signal.clone(),
            lease: None,
        };
        let handle = thread::spawn(move || {
            match released.wait_cancellable_timeout(&timer, delay) {
                Err(WaitError::TimedOut) => timer.cancel(),
                Ok(()) => tracing::trace!("cancel timer released, every token dropped"),
                Err(WaitError::Cancelled) => {}
            }
        });
        (token, handle)
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if self.signal.fire() {
            tracing::debug!("cancel token fired");
        }
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_fired()
    }

    /// The token as a signal, for async observers.
    pub fn signal(&self) -> Signal {
        self.signal.clone()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_flag() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        t.cancel();
        t.cancel();
        assert!(t.is_cancelled());
    }

    #[test]
    fn clones_observe_cancel() {
        let t = CancelToken::new();
        let c = t.clone();
        c.cancel();
        assert!(t.is_cancelled());
        assert_eq!(t.signal(), c.signal());
    }

    #[test]
    fn cancel_after_fires() {
        let t = CancelToken::cancel_after(Duration::from_millis(10));
        assert!(t.signal().wait_timeout(Duration::from_secs(5)).is_ok());
        assert!(t.is_cancelled());
    }

    fn wait_finished(timer: &JoinHandle<()>) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !timer.is_finished() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn timer_exits_once_every_clone_is_dropped() {
        let (t, timer) = CancelToken::with_timer(Duration::from_secs(3600));
        let observed = t.signal();
        let clone = t.clone();
        drop(t);
        thread::sleep(Duration::from_millis(10));
        assert!(!timer.is_finished());

        drop(clone);
        assert!(wait_finished(&timer));
        assert!(!observed.is_fired());
    }

    #[test]
    fn timer_exits_on_early_cancel() {
        let (t, timer) = CancelToken::with_timer(Duration::from_secs(3600));
        t.cancel();
        assert!(wait_finished(&timer));
        assert!(t.is_cancelled());
    }
}
