// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-use counting completion gate.
//!
//! Tasks are registered and completed against a counter. The gate closes
//! when the counter is zero *and* registration has been declared done, so
//! a counter that briefly touches zero while tasks are still being added
//! never closes it early.
//!
//! ```text
//!              register(+n)          counter == 0
//!   Open ──────────────────▶ Open ─────────────────▶ Open
//!    │ declare (counter > 0)                          │ declare (counter == 0)
//!    ▼                                                ▼
//!   AwaitingCompletion ────── counter == 0 ───────▶ Closed (signal fires)
//! ```
//!
//! Every operation is a short critical section under one lock. Observers
//! wait on the [`Signal`] from [`Gate::await_handle`], never on the lock.
//!
//! Breaking the counting discipline (more completions than registrations,
//! or any registration after close) is a caller bug and panics.

use std::fmt;
use std::sync::Arc;
use std::task::Waker;

use parking_lot::Mutex;

use crate::error::{GateViolation, SpawnError};
use crate::signal::{self, Signal};
use crate::spawn::{self, Spawner, ThreadSpawner};

/// Where the gate is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// More registrations expected; a zero counter does not close.
    Open,
    /// Registration declared done; the next zero counter closes.
    AwaitingCompletion,
    /// Terminal. The signal has fired.
    Closed,
}

/// Counting completion gate. See the module docs.
pub struct Gate {
    inner: Mutex<GateState>,
}

struct GateState {
    counter: i64,
    state: RegistrationState,
    signal: Option<Signal>,
    poisoned: bool,
}

impl GateState {
    /// Marks the signal fired with both locks held (gate then signal).
    /// The returned wakers must be woken after the gate lock is released.
    fn close(&mut self) -> Vec<Waker> {
        self.state = RegistrationState::Closed;
        tracing::debug!("gate closed");
        self.signal
            .as_ref()
            .and_then(Signal::mark_fired)
            .unwrap_or_default()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateState {
                counter: 0,
                state: RegistrationState::Open,
                signal: None,
                poisoned: false,
            }),
        }
    }

    /// Adjust the outstanding-task counter by `delta`.
    ///
    /// Positive values register tasks, negative values record completions.
    /// Zero is a no-op.
    ///
    /// # Panics
    ///
    /// If the gate is closed or poisoned, or if the counter would go
    /// negative or overflow. The latter two poison the gate.
    pub fn register(&self, delta: i64) {
        if delta == 0 {
            return;
        }

        let mut st = self.inner.lock();
        if st.poisoned {
            drop(st);
            violation(GateViolation::Poisoned);
        }
        if st.state == RegistrationState::Closed {
            drop(st);
            violation(GateViolation::AlreadyClosed);
        }

        let Some(counter) = st.counter.checked_add(delta) else {
            let counter = st.counter;
            st.poisoned = true;
            drop(st);
            violation(GateViolation::CounterOverflow { counter, delta });
        };
        st.counter = counter;
        tracing::trace!(delta, counter, "gate counter updated");

        if counter < 0 {
            st.poisoned = true;
            drop(st);
            violation(GateViolation::OverCompletion { counter });
        }
        if counter == 0 && st.state == RegistrationState::AwaitingCompletion {
            let wakers = st.close();
            drop(st);
            signal::wake_all(wakers);
        }
    }

    /// Register `n` tasks.
    pub fn add(&self, n: u32) {
        self.register(i64::from(n));
    }

    /// Record one task's completion. Same as `register(-1)`.
    pub fn complete(&self) {
        self.register(-1);
    }

    /// Declare that no further top-level registrations will be made.
    ///
    /// Closes immediately if nothing is outstanding. Only the first call
    /// has any effect. Tasks already registered may still register more
    /// work before they complete.
    ///
    /// # Panics
    ///
    /// If the gate is poisoned.
    pub fn declare_registration_done(&self) {
        let mut st = self.inner.lock();
        if st.poisoned {
            drop(st);
            violation(GateViolation::Poisoned);
        }
        if st.state != RegistrationState::Open {
            return;
        }

        if st.counter == 0 {
            let wakers = st.close();
            drop(st);
            signal::wake_all(wakers);
        } else {
            st.state = RegistrationState::AwaitingCompletion;
            tracing::debug!(pending = st.counter, "gate awaiting completion");
        }
    }

    /// Completion signal for this gate.
    ///
    /// Created on first call; every later call returns the same handle.
    /// Already fired if the gate has closed.
    pub fn await_handle(&self) -> Signal {
        let mut st = self.inner.lock();
        if let Some(signal) = &st.signal {
            return signal.clone();
        }

        let signal = Signal::new();
        if st.state == RegistrationState::Closed {
            signal.fire();
        }
        st.signal = Some(signal.clone());
        tracing::debug!(state = ?st.state, "gate signal created");
        signal
    }

    /// Register one task and return a guard that completes it on drop.
    ///
    /// The guard completes on every exit path, including unwinding.
    pub fn track(self: &Arc<Self>) -> TaskGuard {
        self.register(1);
        TaskGuard {
            gate: Some(Arc::clone(self)),
        }
    }

    /// Register one task, then run `task` on its own thread.
    ///
    /// The registration is applied before the thread is started. The task
    /// completes exactly once however `task` exits; a panic is logged and
    /// not propagated.
    pub fn run_tracked<F>(self: &Arc<Self>, task: F) -> Result<(), SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_tracked_on(ThreadSpawner::global(), task)
    }

    /// [`Gate::run_tracked`] with a caller-chosen spawner.
    ///
    /// If the spawner refuses the task, the registration is undone before
    /// the error is returned.
    pub fn run_tracked_on<S, F>(self: &Arc<Self>, spawner: &S, task: F) -> Result<(), SpawnError>
    where
        S: Spawner + ?Sized,
        F: FnOnce() + Send + 'static,
    {
        let guard = self.track();
        spawner.spawn(Box::new(move || {
            let _guard = guard;
            spawn::run_catching(task);
        }))
    }

    /// Register one task, then spawn `fut` on the current tokio runtime.
    ///
    /// Nothing is registered when called outside a runtime.
    #[cfg(feature = "tokio")]
    pub fn run_tracked_future<Fut>(self: &Arc<Self>, fut: Fut) -> Result<(), SpawnError>
    where
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SpawnError::NoRuntime)?;
        let guard = self.track();
        let task = handle.spawn(async move {
            let _guard = guard;
            fut.await;
        });
        handle.spawn(async move {
            if let Err(err) = task.await {
                if err.is_panic() {
                    let payload = err.into_panic();
                    tracing::warn!(
                        panic = %spawn::panic_message(payload.as_ref()),
                        "tracked future panicked"
                    );
                }
            }
        });
        Ok(())
    }

    /// Outstanding tasks. Diagnostic only; may be stale on return.
    pub fn pending(&self) -> i64 {
        self.inner.lock().counter
    }

    pub fn state(&self) -> RegistrationState {
        self.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RegistrationState::Closed
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.lock().poisoned
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("Gate")
            .field("counter", &st.counter)
            .field("state", &st.state)
            .field("signal", &st.signal.is_some())
            .field("poisoned", &st.poisoned)
            .finish()
    }
}

/// Outstanding registration from [`Gate::track`]. Completes on drop.
#[must_use = "dropping the guard completes the task immediately"]
pub struct TaskGuard {
    gate: Option<Arc<Gate>>,
}

impl TaskGuard {
    /// Complete now. Same as dropping the guard.
    pub fn done(mut self) {
        if let Some(gate) = self.gate.take() {
            gate.complete();
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.complete();
        }
    }
}

impl fmt::Debug for TaskGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGuard").finish_non_exhaustive()
    }
}

#[cold]
#[track_caller]
fn violation(v: GateViolation) -> ! {
    tracing::error!(violation = %v, "gate counting discipline violated");
    panic!("{v}");
}
