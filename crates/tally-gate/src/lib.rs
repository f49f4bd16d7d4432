// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-use counting completion gate with abandonable waits.
//!
//! Register outstanding tasks, complete them one by one, declare when
//! registration is finished, and let any number of observers wait for the
//! gate to close. Observers may give up (timeout, deadline, cancel token,
//! or dropping a future) without affecting the gate or each other.
//!
//! Components:
//! - gate — counter + registration state machine, tracked spawning
//! - signal — one-shot level-persistent completion event
//! - cancel — observer-side cancellation token
//! - spawn — scheduling collaborators (OS threads, tokio)
//! - config — thread spawner configuration
//! - error — wait/spawn errors and fatal gate violations

pub mod cancel;
pub mod config;
pub mod error;
pub mod gate;
pub mod signal;
pub mod spawn;

pub use cancel::CancelToken;
pub use config::SpawnConfig;
pub use error::{GateViolation, SpawnError, WaitError};
pub use gate::{Gate, RegistrationState, TaskGuard};
pub use signal::{Fired, Signal};
pub use spawn::{Spawner, Task, ThreadSpawner};
#[cfg(feature = "tokio")]
pub use spawn::TokioSpawner;
