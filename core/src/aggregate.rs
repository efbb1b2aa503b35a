//! Shipment status aggregation.
//!
//! [`aggregate`] maps the ordered states of a shipment's steps to one
//! [`ShipmentStatus`]. It is total and deterministic: the same input always
//! yields the same status, so recomputing from an unchanged set of steps
//! never produces a status change.
//!
//! # Rules
//!
//! Evaluated in order:
//!
//! 1. No steps: `PENDING`.
//! 2. A step in `CANCELLED` or `REJECTED` is overridden when any later step
//!    has reached at least `ACCEPTED` (a replacement leg was arranged). If
//!    any failure is not overridden: `ABORTED`. Overridden failures are
//!    ignored by the remaining rules.
//! 3. Every remaining step in `FULFILLED`, `CLAIMED` or `COMPLETED`:
//!    `DELIVERED`.
//! 4. First remaining step at `ACCEPTED` or beyond: `INITIALIZED` while no
//!    step has progressed past `COMMITTED`, otherwise `IN_TRANSIT`.
//! 5. Otherwise `PENDING`.

use crate::model::{ShipmentStatus, StepState};

const ACCEPTED_RANK: u8 = 1;
const COMMITTED_RANK: u8 = 2;

fn reached_accepted(state: StepState) -> bool {
    state.progress().is_some_and(|rank| rank >= ACCEPTED_RANK)
}

/// Derive a shipment status from its steps' states in leg order.
#[must_use]
pub fn aggregate(steps: &[StepState]) -> ShipmentStatus {
    if steps.is_empty() {
        return ShipmentStatus::Pending;
    }

    if let Some(last_failure) = steps.iter().rposition(|state| state.is_hard_failure()) {
        let overridden = steps[last_failure + 1..]
            .iter()
            .copied()
            .any(reached_accepted);
        if !overridden {
            return ShipmentStatus::Aborted;
        }
    }

    // Every failure sits before the overriding step, so all of them drop out.
    let effective: Vec<StepState> = steps
        .iter()
        .copied()
        .filter(|state| !state.is_hard_failure())
        .collect();

    if effective.iter().all(|state| state.is_delivered()) {
        return ShipmentStatus::Delivered;
    }

    match effective.first() {
        Some(&first) if reached_accepted(first) => {
            let moving = effective
                .iter()
                .any(|state| state.progress().is_some_and(|rank| rank > COMMITTED_RANK));
            if moving {
                ShipmentStatus::InTransit
            } else {
                ShipmentStatus::Initialized
            }
        }
        _ => ShipmentStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use StepState::{
        Accepted, Cancelled, Claimed, Commenced, Committed, Completed, Fulfilled, Initialized,
        PickedUp, Refunded, Rejected,
    };

    #[test]
    fn documented_cases() {
        assert_eq!(aggregate(&[Accepted]), ShipmentStatus::Initialized);
        assert_eq!(aggregate(&[Cancelled]), ShipmentStatus::Aborted);
        assert_eq!(
            aggregate(&[Fulfilled, Claimed, Completed]),
            ShipmentStatus::Delivered
        );
        assert_eq!(aggregate(&[]), ShipmentStatus::Pending);
        assert_eq!(aggregate(&[PickedUp, Accepted]), ShipmentStatus::InTransit);
    }

    #[test]
    fn failure_overridden_by_later_accepted_step() {
        assert_eq!(aggregate(&[Cancelled, Accepted]), ShipmentStatus::Initialized);
        assert_eq!(aggregate(&[Rejected, Completed]), ShipmentStatus::Delivered);
    }

    #[test]
    fn failure_not_overridden_by_initialized_step() {
        assert_eq!(aggregate(&[Cancelled, Initialized]), ShipmentStatus::Aborted);
        assert_eq!(aggregate(&[Accepted, Rejected]), ShipmentStatus::Aborted);
    }

    #[test]
    fn commenced_counts_as_moving() {
        assert_eq!(aggregate(&[Commenced, Accepted]), ShipmentStatus::InTransit);
        assert_eq!(aggregate(&[Committed, Accepted]), ShipmentStatus::Initialized);
    }

    #[test]
    fn unaccepted_first_leg_is_pending() {
        assert_eq!(aggregate(&[Initialized, PickedUp]), ShipmentStatus::Pending);
    }

    #[test]
    fn refunded_is_not_delivered() {
        assert_eq!(aggregate(&[Refunded]), ShipmentStatus::InTransit);
    }

    fn any_state() -> impl Strategy<Value = StepState> {
        proptest::sample::select(StepState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn aggregation_is_deterministic(steps in proptest::collection::vec(any_state(), 0..8)) {
            prop_assert_eq!(aggregate(&steps), aggregate(&steps));
        }

        #[test]
        fn trailing_failure_always_aborts(
            steps in proptest::collection::vec(any_state(), 0..8),
            failure in proptest::sample::select(vec![Cancelled, Rejected]),
        ) {
            let mut steps = steps;
            steps.push(failure);
            prop_assert_eq!(aggregate(&steps), ShipmentStatus::Aborted);
        }

        #[test]
        fn all_delivered_is_delivered(
            steps in proptest::collection::vec(
                proptest::sample::select(vec![Fulfilled, Claimed, Completed]),
                1..8,
            )
        ) {
            prop_assert_eq!(aggregate(&steps), ShipmentStatus::Delivered);
        }
    }
}
