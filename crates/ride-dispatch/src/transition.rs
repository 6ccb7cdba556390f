//! The ride status state machine.
//!
//! ```text
//! requested ──► matched ──► arrived ──► in_progress ──► completed
//!     │            │           │             │
//!     └────────────┴───────────┴─────────────┴────────► cancelled
//! ```
//!
//! This table is the only place transitions are defined. Every component
//! that changes a ride's status calls [`validate`] before writing.

use smallvec::SmallVec;

use crate::ride::RideStatus;

/// Statuses reachable from `current` in one step.
pub fn next_allowed(current: RideStatus) -> SmallVec<[RideStatus; 2]> {
    use RideStatus::*;

    match current {
        Requested => SmallVec::from_buf([Matched, Cancelled]),
        Matched => SmallVec::from_buf([Arrived, Cancelled]),
        Arrived => SmallVec::from_buf([InProgress, Cancelled]),
        InProgress => SmallVec::from_buf([Completed, Cancelled]),
        Completed | Cancelled => SmallVec::new(),
    }
}

/// What a validated transition request should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Write the new status.
    Apply,
    /// Already in the requested status; nothing to write.
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: RideStatus,
    pub to: RideStatus,
}

/// Gate a status change.
///
/// Requesting the current status is a no-op rather than an error, which
/// makes duplicate requests (a retried "start trip", a second cancel) safe.
pub fn validate(
    current: RideStatus,
    requested: RideStatus,
) -> Result<Transition, IllegalTransition> {
    if current == requested {
        return Ok(Transition::NoOp);
    }
    if next_allowed(current).contains(&requested) {
        Ok(Transition::Apply)
    } else {
        Err(IllegalTransition {
            from: current,
            to: requested,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RideStatus::*;

    #[test]
    fn happy_path_is_allowed() {
        let path = [Requested, Matched, Arrived, InProgress, Completed];
        for pair in path.windows(2) {
            assert_eq!(validate(pair[0], pair[1]), Ok(Transition::Apply));
        }
    }

    #[test]
    fn cancel_reachable_from_every_non_terminal_status() {
        for status in RideStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(validate(status, Cancelled), Ok(Transition::Apply));
        }
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        assert_eq!(
            validate(Requested, InProgress),
            Err(IllegalTransition {
                from: Requested,
                to: InProgress
            })
        );
        assert!(validate(Matched, Completed).is_err());
    }

    #[test]
    fn regression_is_rejected() {
        // Every pair not in the table fails, which covers all backward moves.
        for from in RideStatus::ALL {
            for to in RideStatus::ALL {
                if from == to || next_allowed(from).contains(&to) {
                    continue;
                }
                assert!(validate(from, to).is_err(), "{from} -> {to} should fail");
            }
        }
    }

    #[test]
    fn terminal_states_only_accept_themselves() {
        for terminal in [Completed, Cancelled] {
            assert!(next_allowed(terminal).is_empty());
            assert_eq!(validate(terminal, terminal), Ok(Transition::NoOp));
        }
        assert!(validate(Completed, Cancelled).is_err());
        assert!(validate(Cancelled, Requested).is_err());
    }
}
