use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Uncreated,
    Created,
    Running,
    Paused,
    Removed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Uncreated => write!(f, "uncreated"),
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Removed => write!(f, "removed"),
        }
    }
}

impl ContainerState {
    /// Exec may target a container whose init process is up and not frozen.
    pub fn accepts_exec(self) -> bool {
        matches!(self, ContainerState::Created | ContainerState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ContainerState,
    pub to: ContainerState,
}

/// Validate a lifecycle transition.
///
/// `Running -> Uncreated` and friends exist because a cancelled or failed
/// operation tears the container down without marking it removed, so that the
/// caller's own `remove` still succeeds exactly once.
pub fn validate_transition(
    from: ContainerState,
    to: ContainerState,
) -> Result<(), InvalidTransition> {
    use ContainerState::{Created, Paused, Removed, Running, Uncreated};

    let valid = matches!(
        (from, to),
        (Uncreated, Created)
            | (Created | Running, Running)
            | (Created | Running, Paused)
            | (Paused, Running)
            | (Created | Running | Paused, Uncreated)
            | (Uncreated | Created | Running | Paused, Removed)
    );

    if valid {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContainerState::{Created, Paused, Removed, Running, Uncreated};

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(Uncreated, Created).is_ok());
        assert!(validate_transition(Created, Running).is_ok());
        assert!(validate_transition(Running, Running).is_ok()); // repeated exec
        assert!(validate_transition(Created, Paused).is_ok());
        assert!(validate_transition(Running, Paused).is_ok());
        assert!(validate_transition(Paused, Running).is_ok());
        assert!(validate_transition(Running, Uncreated).is_ok());
        assert!(validate_transition(Uncreated, Removed).is_ok());
        assert!(validate_transition(Paused, Removed).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(Uncreated, Running).is_err());
        assert!(validate_transition(Uncreated, Paused).is_err());
        assert!(validate_transition(Created, Created).is_err());
        assert!(validate_transition(Paused, Paused).is_err());
        assert!(validate_transition(Paused, Created).is_err());
        assert!(validate_transition(Removed, Removed).is_err());
        assert!(validate_transition(Removed, Created).is_err());
        assert!(validate_transition(Removed, Uncreated).is_err());
    }

    #[test]
    fn exec_acceptance() {
        assert!(Created.accepts_exec());
        assert!(Running.accepts_exec());
        assert!(!Paused.accepts_exec());
        assert!(!Uncreated.accepts_exec());
        assert!(!Removed.accepts_exec());
    }

    #[test]
    fn invalid_transition_display() {
        let err = validate_transition(Removed, Running).unwrap_err();
        assert_eq!(err.to_string(), "invalid state transition: removed -> running");
    }
}
