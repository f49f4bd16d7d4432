// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types.
//!
//! Two families: observer-side failures (`WaitError`, `SpawnError`) are
//! returned as values; counting-discipline defects (`GateViolation`) are
//! raised as panics carrying the violation's message.

use thiserror::Error;

/// Why an observer stopped waiting before the signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The timeout or deadline elapsed first.
    #[error("wait timed out before the gate closed")]
    TimedOut,
    /// The cancellation token fired first.
    #[error("wait cancelled before the gate closed")]
    Cancelled,
}

/// A tracked task could not be handed to its spawner.
///
/// The registration made for the task has already been undone when this is
/// returned.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The OS refused to create a thread.
    #[error("failed to spawn task thread: {0}")]
    Thread(#[from] std::io::Error),
    /// No async runtime is available on the calling thread.
    #[error("no async runtime available to spawn onto")]
    NoRuntime,
}

/// A broken counting discipline. Always fatal for the calling context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateViolation {
    /// More completions than registrations.
    #[error("tally-gate: negative counter, too many completions (counter = {counter})")]
    OverCompletion { counter: i64 },
    /// A registration that does not fit in the counter.
    #[error("tally-gate: counter overflow (counter = {counter}, delta = {delta})")]
    CounterOverflow { counter: i64, delta: i64 },
    /// Registration or completion on a gate that already closed.
    #[error("tally-gate: gate already closed")]
    AlreadyClosed,
    /// Any use of a gate after an earlier violation.
    #[error("tally-gate: gate poisoned by an earlier violation")]
    Poisoned,
}
