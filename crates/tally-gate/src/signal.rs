// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot completion signal.
//!
//! Starts unfired, fires at most once, and stays fired. Every clone refers
//! to the same event, so a handle obtained before, during or after firing
//! always reports the same outcome.
//!
//! Blocking waiters park on a condvar; async waiters and the cancellable
//! blocking waits register wakers. All waits can be abandoned at any time
//! without touching the signal's state or other waiters.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::error::WaitError;

/// Handle to a one-shot, level-persistent event.
///
/// Equality is identity: two handles compare equal only when they refer to
/// the same event.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    fired_cvar: Condvar,
}

struct State {
    fired: bool,
    waiters: Vec<(u64, Waker)>,
    next_waiter: u64,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    fired: false,
                    waiters: Vec::new(),
                    next_waiter: 0,
                }),
                fired_cvar: Condvar::new(),
            }),
        }
    }

    /// Fire the signal. Returns false if it had already fired.
    pub(crate) fn fire(&self) -> bool {
        match self.mark_fired() {
            Some(wakers) => {
                wake_all(wakers);
                true
            }
            None => false,
        }
    }

    /// Set the fired flag and release blocked threads, handing back the
    /// async wakers instead of waking them.
    ///
    /// Lets a caller holding its own lock fire now and wake after it has
    /// unlocked. `None` if the signal had already fired.
    pub(crate) fn mark_fired(&self) -> Option<Vec<Waker>> {
        let mut state = self.inner.state.lock();
        if state.fired {
            return None;
        }
        state.fired = true;
        self.inner.fired_cvar.notify_all();
        let wakers: Vec<Waker> = std::mem::take(&mut state.waiters)
            .into_iter()
            .map(|(_, waker)| waker)
            .collect();
        tracing::debug!(async_waiters = wakers.len(), "signal fired");
        Some(wakers)
    }

    /// Non-blocking check.
    pub fn is_fired(&self) -> bool {
        self.inner.state.lock().fired
    }

    /// True when both handles refer to the same event.
    pub fn same(a: &Signal, b: &Signal) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Block the current thread until the signal fires.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.fired {
            self.inner.fired_cvar.wait(&mut state);
        }
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_deadline(deadline),
            None => {
                self.wait();
                Ok(())
            }
        }
    }

    /// Block until the signal fires or `deadline` passes.
    pub fn wait_deadline(&self, deadline: Instant) -> Result<(), WaitError> {
        let mut state = self.inner.state.lock();
        while !state.fired {
            if self
                .inner
                .fired_cvar
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return if state.fired {
                    Ok(())
                } else {
                    Err(WaitError::TimedOut)
                };
            }
        }
        Ok(())
    }

    /// Block until the signal fires or `cancel` is cancelled.
    ///
    /// If both have fired by the time the waiter wakes, the signal wins.
    pub fn wait_cancellable(&self, cancel: &CancelToken) -> Result<(), WaitError> {
        self.race(cancel, None)
    }

    /// Like [`Signal::wait_cancellable`], additionally bounded by `timeout`.
    pub fn wait_cancellable_timeout(
        &self,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        self.race(cancel, Instant::now().checked_add(timeout))
    }

    /// Future that resolves once the signal fires.
    ///
    /// Executor-agnostic. Dropping the future abandons the wait.
    pub fn fired(&self) -> Fired {
        Fired {
            signal: self.clone(),
            waiter: None,
        }
    }

    /// Returns true if fired; otherwise (re)registers `waker` under `waiter`.
    fn poll_waiter(&self, waiter: &mut Option<u64>, waker: &Waker) -> bool {
        let mut state = self.inner.state.lock();
        if state.fired {
            *waiter = None;
            return true;
        }

        if let Some(id) = *waiter {
            if let Some((_, slot)) = state.waiters.iter_mut().find(|(w, _)| *w == id) {
                if !slot.will_wake(waker) {
                    *slot = waker.clone();
                }
                return false;
            }
        }

        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push((id, waker.clone()));
        *waiter = Some(id);
        false
    }

    fn remove_waiter(&self, id: u64) {
        let mut state = self.inner.state.lock();
        state.waiters.retain(|(w, _)| *w != id);
    }

    fn race(&self, cancel: &CancelToken, deadline: Option<Instant>) -> Result<(), WaitError> {
        let waker = Waker::from(Arc::new(ThreadWaker {
            thread: thread::current(),
        }));
        let mut cx = Context::from_waker(&waker);

        let mut done = self.fired();
        let mut cancelled = cancel.signal().fired();

        loop {
            if Pin::new(&mut done).poll(&mut cx).is_ready() {
                return Ok(());
            }
            if Pin::new(&mut cancelled).poll(&mut cx).is_ready() {
                return Err(WaitError::Cancelled);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitError::TimedOut);
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }
}

impl PartialEq for Signal {
    fn eq(&self, other: &Self) -> bool {
        Signal::same(self, other)
    }
}

impl Eq for Signal {}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Signal")
            .field("fired", &state.fired)
            .field("async_waiters", &state.waiters.len())
            .finish()
    }
}

/// Wake the wakers returned by [`Signal::mark_fired`]. Call with no locks held.
pub(crate) fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}

/// Future returned by [`Signal::fired`].
#[must_use = "futures do nothing unless polled"]
pub struct Fired {
    signal: Signal,
    waiter: Option<u64>,
}

impl Future for Fired {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.signal.poll_waiter(&mut this.waiter, cx.waker()) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Fired {
    fn drop(&mut self) {
        if let Some(id) = self.waiter.take() {
            self.signal.remove_waiter(id);
        }
    }
}

impl fmt::Debug for Fired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fired")
            .field("signal", &self.signal)
            .field("registered", &self.waiter.is_some())
            .finish()
    }
}

/// Waker that unparks a blocked OS thread.
struct ThreadWaker {
    thread: Thread,
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.thread.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.thread.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_and_stays_fired() {
        let s = Signal::new();
        assert!(!s.is_fired());
        assert!(s.fire());
        assert!(!s.fire());
        assert!(s.is_fired());
        s.wait();
        assert_eq!(s.wait_timeout(Duration::ZERO), Ok(()));
    }

    #[test]
    fn clones_share_identity() {
        let a = Signal::new();
        let b = a.clone();
        let c = Signal::new();
        assert_eq!(a, b);
        assert_ne!(a, c);
        b.fire();
        assert!(a.is_fired());
        assert!(!c.is_fired());
    }

    #[test]
    fn wait_timeout_expires_when_unfired() {
        let s = Signal::new();
        let start = Instant::now();
        assert_eq!(
            s.wait_timeout(Duration::from_millis(20)),
            Err(WaitError::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn blocked_waiters_wake_on_fire() {
        let s = Signal::new();
        let mut handles = vec![];
        for _ in 0..4 {
            let s = s.clone();
            handles.push(std::thread::spawn(move || s.wait()));
        }
        std::thread::sleep(Duration::from_millis(10));
        s.fire();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn cancellable_wait_returns_cancelled() {
        let s = Signal::new();
        let token = CancelToken::new();
        let t = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            t.cancel();
        });
        assert_eq!(s.wait_cancellable(&token), Err(WaitError::Cancelled));
        assert!(!s.is_fired());
    }

    #[test]
    fn cancellable_wait_prefers_fired_signal() {
        let s = Signal::new();
        let token = CancelToken::new();
        s.fire();
        token.cancel();
        assert_eq!(s.wait_cancellable(&token), Ok(()));
    }

    #[test]
    fn cancellable_wait_times_out() {
        let s = Signal::new();
        let token = CancelToken::new();
        assert_eq!(
            s.wait_cancellable_timeout(&token, Duration::from_millis(10)),
            Err(WaitError::TimedOut)
        );
    }

    #[test]
    fn abandoned_waits_leave_no_waiters_behind() {
        let s = Signal::new();
        let token = CancelToken::new();
        for _ in 0..8 {
            let _ = s.wait_cancellable_timeout(&token, Duration::from_millis(1));
        }
        assert_eq!(s.inner.state.lock().waiters.len(), 0);
        assert_eq!(token.signal().inner.state.lock().waiters.len(), 0);
    }

    #[test]
    fn fired_future_resolves_after_fire() {
        let s = Signal::new();
        let mut fut = s.fired();
        let waker = Waker::from(Arc::new(ThreadWaker {
            thread: thread::current(),
        }));
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert_eq!(s.inner.state.lock().waiters.len(), 1);
        // Repolling with the same waker must not register twice.
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert_eq!(s.inner.state.lock().waiters.len(), 1);
        s.fire();
        assert!(Pin::new(&mut fut).poll(&mut cx).is_ready());
    }

    #[test]
    fn mark_fired_defers_wakes() {
        struct Counting(std::sync::atomic::AtomicUsize);

        impl Wake for Counting {
            fn wake(self: Arc<Self>) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let s = Signal::new();
        let counter = Arc::new(Counting(std::sync::atomic::AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut fut = s.fired();
        assert!(Pin::new(&mut fut).poll(&mut Context::from_waker(&waker)).is_pending());

        let wakers = s.mark_fired().unwrap();
        assert!(s.is_fired());
        assert_eq!(wakers.len(), 1);
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(s.mark_fired().is_none());

        wake_all(wakers);
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
