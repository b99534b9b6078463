use std::time::Duration;

use assessctl_store::db::retry::{Backoff, RetryPolicy, Verdict};
use assessctl_store::models::state::requires_completed_at;
use assessctl_store::models::{check_transition, AssessmentState, RetryBudget, Transition};
use proptest::prelude::*;

const MAX_RETRIES: i32 = 3;

fn arb_state() -> impl Strategy<Value = AssessmentState> {
    prop::sample::select(AssessmentState::ALL.to_vec())
}

/// Requested move: target state plus how much to bump retry_count
fn arb_step() -> impl Strategy<Value = (AssessmentState, i32)> {
    (arb_state(), prop_oneof![4 => Just(0), 2 => Just(1), 1 => -1..=2i32])
}

fn allowed(edge: Transition, from: AssessmentState, to: AssessmentState) -> bool {
    use AssessmentState::*;
    matches!(
        (edge, from, to),
        (Transition::Start, Pending, Processing)
            | (Transition::Succeed, Processing, Completed)
            | (Transition::Fail, Processing, Failed)
            | (Transition::Reschedule, Failed, Pending)
            | (Transition::Cancel, Pending | Processing | Failed, Cancelled)
    )
}

proptest! {
    /// Property: walking the machine with arbitrary requests never breaks
    /// the lifecycle invariants
    #[test]
    fn prop_random_walk_keeps_invariants(steps in prop::collection::vec(arb_step(), 1..60)) {
        let mut state = AssessmentState::Pending;
        let mut retry_count = 0i32;
        let mut completed = false;

        for (to, delta) in steps {
            let proposed = retry_count + delta;
            let budget = RetryBudget { current: retry_count, proposed, max_retries: MAX_RETRIES };
            let was_terminal = state.is_terminal(retry_count, MAX_RETRIES);

            match check_transition(state, to, budget) {
                Ok(edge) => {
                    prop_assert!(!was_terminal, "terminal state {state} accepted a change");
                    prop_assert!(proposed >= retry_count);
                    match edge {
                        Some(edge) => {
                            prop_assert!(allowed(edge, state, to), "{edge:?} {state} -> {to}");
                            if proposed > retry_count {
                                prop_assert!(edge.is_retry_cycle());
                            }
                        }
                        None => {
                            prop_assert_eq!(state, to);
                            prop_assert_eq!(proposed, retry_count);
                        }
                    }
                    state = to;
                    retry_count = proposed;
                    if !completed && requires_completed_at(state, retry_count, MAX_RETRIES) {
                        completed = true;
                    }
                }
                Err(_) => {
                    // rejected requests leave the row untouched
                }
            }

            prop_assert_eq!(completed, state.is_terminal(retry_count, MAX_RETRIES));
        }
    }

    /// Property: classification is a pure function of code and message
    #[test]
    fn prop_classifier_is_deterministic(
        code in proptest::option::of("[0-9A-Z]{5}"),
        message in ".{0,80}",
    ) {
        let policy = RetryPolicy::default();
        let first = policy.classify_parts(code.as_deref(), &message);
        let second = policy.classify_parts(code.as_deref(), &message);
        prop_assert_eq!(first, second);
        prop_assert_eq!(RetryPolicy::default().classify_parts(code.as_deref(), &message), first);
    }

    /// Property: known codes ignore the message entirely
    #[test]
    fn prop_known_codes_win_over_message(
        code in prop::sample::select(vec!["40001", "40P01", "53300", "08006", "57P03"]),
        message in ".{0,80}",
    ) {
        prop_assert_eq!(
            RetryPolicy::default().classify_parts(Some(code), &message),
            Verdict::Retryable
        );
    }

    /// Property: permanent classes stay permanent whatever the message says
    #[test]
    fn prop_permanent_classes(
        class in prop::sample::select(vec!["42", "23", "22"]),
        suffix in "[0-9A-Z]{3}",
        message in ".{0,80}",
    ) {
        let code = format!("{class}{suffix}");
        prop_assert_eq!(
            RetryPolicy::default().classify_parts(Some(&code), &message),
            Verdict::Permanent
        );
    }

    /// Property: backoff never shrinks between attempts and never exceeds the cap
    #[test]
    fn prop_backoff_monotonic_and_capped(
        base_ms in 1u64..1_000,
        multiplier in 1.0f64..4.0,
        max_ms in 1_000u64..60_000,
        attempts in 1u32..40,
    ) {
        let backoff = Backoff {
            base: Duration::from_millis(base_ms),
            multiplier,
            max: Duration::from_millis(max_ms),
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = backoff.delay(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= backoff.max);
            previous = delay;
        }
    }
}
