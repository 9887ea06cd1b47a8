use anyhow::{anyhow, Result};

use crate::types::AssignmentState;

/// Describes a single valid state transition for an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: AssignmentState,
    pub to: AssignmentState,
}

/// Guards the assignment lifecycle by enforcing a finite set of valid
/// state transitions. Completed and Aborted are terminal.
#[derive(Debug, Clone)]
pub struct AssignmentStateMachine {
    pub state: AssignmentState,
    pub transitions: Vec<StateTransition>,
}

impl AssignmentStateMachine {
    /// Creates a state machine positioned at `state` with all valid
    /// transitions pre-configured.
    pub fn at(state: AssignmentState) -> Self {
        let transitions = vec![
            StateTransition {
                from: AssignmentState::Scheduled,
                to: AssignmentState::Scheduled,
            },
            StateTransition {
                from: AssignmentState::Scheduled,
                to: AssignmentState::Completed,
            },
            StateTransition {
                from: AssignmentState::Scheduled,
                to: AssignmentState::Aborted,
            },
        ];

        Self { state, transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &AssignmentState, to: &AssignmentState) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Attempts to move the state machine to `to`. Returns an error if the
    /// transition is not permitted.
    pub fn transition(&mut self, to: AssignmentState) -> Result<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(anyhow!(
                "Invalid assignment transition from {:?} to {:?}",
                self.state,
                to
            ))
        }
    }
}

impl Default for AssignmentStateMachine {
    fn default() -> Self {
        Self::at(AssignmentState::Scheduled)
    }
}
