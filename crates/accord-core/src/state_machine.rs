//! Session phase state machine
//!
//! `SeedingProposals -> RoundActive -> ConflictCheck -> (Arbitration) ->
//! Committing -> ConvergenceCheck -> (RoundActive | Terminated)`

use serde::{Deserialize, Serialize};

/// Phase of a negotiation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Round 0 proposal collection in activation order
    SeedingProposals,
    /// Proposal collection (after round 0), distribution and evaluation
    RoundActive,
    ConflictCheck,
    Arbitration,
    Committing,
    ConvergenceCheck,
    Terminated,
}

/// Illegal phase change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal phase transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

/// Validates a phase transition.
pub fn validate_transition(from: SessionPhase, to: SessionPhase) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// Phases reachable from `from` in one step.
///
/// A zero round cap lets seeding terminate directly.
#[must_use]
pub fn allowed_transitions(from: SessionPhase) -> &'static [SessionPhase] {
    use SessionPhase::*;
    match from {
        SeedingProposals => &[RoundActive, Terminated],
        RoundActive => &[ConflictCheck],
        ConflictCheck => &[Arbitration, Committing],
        Arbitration => &[Committing],
        Committing => &[ConvergenceCheck],
        ConvergenceCheck => &[RoundActive, Terminated],
        Terminated => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionPhase::*;

    #[test]
    fn full_round_path_is_legal() {
        let path = [
            SeedingProposals,
            RoundActive,
            ConflictCheck,
            Arbitration,
            Committing,
            ConvergenceCheck,
            RoundActive,
            ConflictCheck,
            Committing,
            ConvergenceCheck,
            Terminated,
        ];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{pair:?}");
        }
    }

    #[test]
    fn skipping_phases_is_illegal() {
        assert!(validate_transition(RoundActive, Committing).is_err());
        assert!(validate_transition(Arbitration, ConvergenceCheck).is_err());
        assert!(validate_transition(Committing, Terminated).is_err());
    }

    #[test]
    fn terminated_is_final() {
        assert!(allowed_transitions(Terminated).is_empty());
        let err = validate_transition(Terminated, RoundActive).unwrap_err();
        assert!(err.to_string().contains("Terminated"));
    }
}
