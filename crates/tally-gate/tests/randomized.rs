// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Randomized register/complete sequences.
//!
//! For any sequence whose running sum stays non-negative and ends at zero,
//! with registration declared done once the final registration is in, the
//! gate closes exactly at the last completion and never before.

use std::panic::{catch_unwind, AssertUnwindSafe};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tally_gate::{Gate, GateViolation, RegistrationState};

/// Deltas with a non-negative running sum ending at zero.
fn balanced_sequence(rng: &mut StdRng) -> Vec<i64> {
    let mut deltas = Vec::new();
    let mut outstanding = 0i64;
    for _ in 0..rng.gen_range(1..40) {
        if outstanding > 0 && rng.gen_bool(0.5) {
            let d = rng.gen_range(1..=outstanding);
            deltas.push(-d);
            outstanding -= d;
        } else {
            let d = rng.gen_range(1..=5);
            deltas.push(d);
            outstanding += d;
        }
    }
    if outstanding > 0 {
        deltas.push(-outstanding);
    }
    deltas
}

#[test]
fn balanced_sequences_close_exactly_once() {
    let mut rng = StdRng::seed_from_u64(0x7a11_9a7e);

    for _ in 0..500 {
        let deltas = balanced_sequence(&mut rng);
        let last_positive = deltas.iter().rposition(|d| *d > 0).unwrap();
        let declare_at = rng.gen_range(last_positive..deltas.len());

        let gate = Gate::new();
        let early_handle = rng.gen_bool(0.5).then(|| gate.await_handle());

        for (i, &d) in deltas.iter().enumerate() {
            assert!(!gate.is_closed(), "closed before step {i} of {deltas:?}");
            gate.register(d);
            if i == declare_at {
                gate.declare_registration_done();
            }
        }

        assert_eq!(gate.state(), RegistrationState::Closed, "{deltas:?}");
        assert_eq!(gate.pending(), 0);
        let signal = gate.await_handle();
        assert!(signal.is_fired());
        if let Some(early) = early_handle {
            assert_eq!(early, signal);
        }
    }
}

#[test]
fn negative_running_sum_always_panics() {
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..100 {
        let registered = rng.gen_range(0..10);
        let gate = Gate::new();
        gate.register(registered);

        let err = catch_unwind(AssertUnwindSafe(|| gate.register(-(registered + 1))))
            .expect_err("over-completion must panic");
        let msg = err
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert_eq!(msg, GateViolation::OverCompletion { counter: -1 }.to_string());
        assert!(gate.is_poisoned());
    }
}
