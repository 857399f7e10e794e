//! Scheduler phase state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of the task scheduler.
///
/// `Idle → Armed → Firing → Idle`, with `Firing → Armed` when work remains
/// and `Armed → Armed` whenever the single wake alarm is re-targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    /// No tasks queued and no alarm armed.
    Idle,
    /// The wake alarm targets the earliest queued task.
    Armed,
    /// Due tasks are being extracted and run.
    Firing,
}

impl SchedulerPhase {
    /// Check if this phase allows transitioning to another phase.
    pub fn can_transition_to(&self, target: SchedulerPhase) -> bool {
        use SchedulerPhase::*;

        matches!(
            (self, target),
            (Idle, Armed) | (Idle, Firing) |
            (Armed, Armed) | (Armed, Firing) | (Armed, Idle) |
            (Firing, Idle) | (Firing, Armed) |
            (Idle, Idle)
        )
    }

    pub fn is_firing(&self) -> bool {
        matches!(self, Self::Firing)
    }
}

impl fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Firing => "firing",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_valid() {
        assert!(SchedulerPhase::Idle.can_transition_to(SchedulerPhase::Armed));
        assert!(SchedulerPhase::Armed.can_transition_to(SchedulerPhase::Armed));
        assert!(SchedulerPhase::Armed.can_transition_to(SchedulerPhase::Firing));
        assert!(SchedulerPhase::Firing.can_transition_to(SchedulerPhase::Idle));
        assert!(SchedulerPhase::Firing.can_transition_to(SchedulerPhase::Armed));
    }

    #[test]
    fn phase_transitions_invalid() {
        assert!(!SchedulerPhase::Firing.can_transition_to(SchedulerPhase::Firing));
    }

    #[test]
    fn phase_display_and_serde() {
        assert_eq!(SchedulerPhase::Firing.to_string(), "firing");
        let json = serde_json::to_string(&SchedulerPhase::Armed).unwrap();
        assert_eq!(json, "\"armed\"");
    }
}
