// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduling of tracked tasks.
//!
//! The gate never runs work itself; it hands a boxed closure to a
//! [`Spawner`]. `ThreadSpawner` gives every task its own OS thread.
//! With the `tokio` feature, `TokioSpawner` runs tasks on a runtime's
//! blocking pool.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use once_cell::sync::Lazy;

use crate::config::SpawnConfig;
use crate::error::SpawnError;

/// Unit of work handed to a spawner.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run a task independently of the caller.
///
/// On `Err`, the task must have been dropped without running.
pub trait Spawner {
    fn spawn(&self, task: Task) -> Result<(), SpawnError>;
}

impl<S: Spawner + ?Sized> Spawner for &S {
    fn spawn(&self, task: Task) -> Result<(), SpawnError> {
        (**self).spawn(task)
    }
}

/// One OS thread per task.
#[derive(Debug)]
pub struct ThreadSpawner {
    config: SpawnConfig,
    spawned: AtomicUsize,
}

static GLOBAL: Lazy<ThreadSpawner> = Lazy::new(|| ThreadSpawner::new(SpawnConfig::from_env()));

impl ThreadSpawner {
    pub fn new(config: SpawnConfig) -> Self {
        Self {
            config,
            spawned: AtomicUsize::new(0),
        }
    }

    /// Process-wide spawner configured from the environment.
    /// Used by [`crate::Gate::run_tracked`].
    pub fn global() -> &'static ThreadSpawner {
        &GLOBAL
    }

    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// Number of threads this spawner has started.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl Default for ThreadSpawner {
    fn default() -> Self {
        Self::new(SpawnConfig::default())
    }
}

impl Spawner for ThreadSpawner {
    fn spawn(&self, task: Task) -> Result<(), SpawnError> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);

        let mut builder = thread::Builder::new();
        if let Some(prefix) = &self.config.name_prefix {
            builder = builder.name(format!("{prefix}-{n}"));
        }
        if let Some(bytes) = self.config.stack_size {
            builder = builder.stack_size(bytes);
        }

        match builder.spawn(task) {
            Ok(_detached) => Ok(()),
            Err(err) => {
                self.spawned.fetch_sub(1, Ordering::Relaxed);
                tracing::error!(error = %err, "failed to spawn task thread");
                Err(SpawnError::Thread(err))
            }
        }
    }
}

/// Runs tasks on a tokio runtime's blocking pool.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

#[cfg(feature = "tokio")]
impl TokioSpawner {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Spawner for the runtime the caller is running in.
    pub fn current() -> Result<Self, SpawnError> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|_| SpawnError::NoRuntime)
    }
}

#[cfg(feature = "tokio")]
impl Spawner for TokioSpawner {
    fn spawn(&self, task: Task) -> Result<(), SpawnError> {
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }
}

/// Run `f`, absorbing a panic into a warning.
///
/// Tracked tasks report their own failures; the gate only needs them to
/// finish.
pub(crate) fn run_catching<F: FnOnce()>(f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        tracing::warn!(panic = %panic_message(payload.as_ref()), "tracked task panicked");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
