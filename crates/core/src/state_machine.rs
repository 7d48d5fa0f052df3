//! Job state machine.
//!
//! Lives in `core` so the record store backends, the worker engine and the
//! status service all validate against the same edge list.

use crate::job::JobState;

/// Returns the set of states reachable from `from` in a single transition.
///
/// Terminal states (Success, Failure, Revoked) return an empty slice because
/// no further transitions are allowed.
pub fn valid_transitions(from: JobState) -> &'static [JobState] {
    use JobState::*;

    match from {
        // Pending -> Started (claimed), Revoked (cancelled before claim)
        Pending => &[Started, Revoked],
        // Started -> Progress, Success, Failure, Revoked (cooperative)
        Started => &[Progress, Success, Failure, Revoked],
        // Progress -> Progress, Success, Failure, Revoked (cooperative)
        Progress => &[Progress, Success, Failure, Revoked],
        Success | Failure | Revoked => &[],
    }
}

/// Check whether a transition from `from` to `to` is valid.
pub fn can_transition(from: JobState, to: JobState) -> bool {
    valid_transitions(from).contains(&to)
}

/// Validate a state transition, returning an error message for invalid ones.
pub fn validate_transition(from: JobState, to: JobState) -> Result<(), String> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(format!("Invalid transition: {from} -> {to}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobState::*;

    // -----------------------------------------------------------------------
    // Valid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn pending_to_started() {
        assert!(can_transition(Pending, Started));
    }

    #[test]
    fn pending_to_revoked() {
        assert!(can_transition(Pending, Revoked));
    }

    #[test]
    fn started_to_progress() {
        assert!(can_transition(Started, Progress));
    }

    #[test]
    fn progress_to_progress() {
        assert!(can_transition(Progress, Progress));
    }

    #[test]
    fn running_states_reach_every_terminal() {
        for from in [Started, Progress] {
            assert!(can_transition(from, Success));
            assert!(can_transition(from, Failure));
            assert!(can_transition(from, Revoked));
        }
    }

    // -----------------------------------------------------------------------
    // Invalid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn pending_cannot_skip_to_success() {
        assert!(!can_transition(Pending, Success));
        assert!(!can_transition(Pending, Failure));
        assert!(!can_transition(Pending, Progress));
    }

    #[test]
    fn started_cannot_restart() {
        assert!(!can_transition(Started, Started));
        assert!(!can_transition(Progress, Started));
    }

    #[test]
    fn nothing_moves_backwards_to_pending() {
        for from in [Started, Progress, Success, Failure, Revoked] {
            assert!(!can_transition(from, Pending));
        }
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        assert!(valid_transitions(Success).is_empty());
        assert!(valid_transitions(Failure).is_empty());
        assert!(valid_transitions(Revoked).is_empty());
    }

    // -----------------------------------------------------------------------
    // validate_transition
    // -----------------------------------------------------------------------

    #[test]
    fn validate_transition_ok() {
        assert!(validate_transition(Pending, Started).is_ok());
    }

    #[test]
    fn validate_transition_err_message() {
        let err = validate_transition(Success, Started).unwrap_err();
        assert!(err.contains("SUCCESS"));
        assert!(err.contains("STARTED"));
    }
}
