use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Derived label of a workspace, cached from its conditions.
///
/// PENDING, ARCHIVED, STANDBY and RUNNING form the level order the state
/// machine moves along one step at a time. ERROR and DELETING/DELETED are
/// orthogonal axes entered via health loss and soft deletion.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pending,
    Archived,
    Standby,
    Running,
    Error,
    Deleting,
    Deleted,
}

impl Phase {
    /// Position on the level order, for the phases that are on it.
    pub fn level(self) -> Option<u8> {
        match self {
            Phase::Pending => Some(0),
            Phase::Archived => Some(1),
            Phase::Standby => Some(2),
            Phase::Running => Some(3),
            Phase::Error | Phase::Deleting | Phase::Deleted => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "PENDING",
            Phase::Archived => "ARCHIVED",
            Phase::Standby => "STANDBY",
            Phase::Running => "RUNNING",
            Phase::Error => "ERROR",
            Phase::Deleting => "DELETING",
            Phase::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Phase::Pending),
            "ARCHIVED" => Ok(Phase::Archived),
            "STANDBY" => Ok(Phase::Standby),
            "RUNNING" => Ok(Phase::Running),
            "ERROR" => Ok(Phase::Error),
            "DELETING" => Ok(Phase::Deleting),
            "DELETED" => Ok(Phase::Deleted),
            other => Err(ParseStateError::phase(other)),
        }
    }
}

/// User-declared target. A strict subset of [`Phase`]: the orthogonal
/// DELETING/ERROR labels cannot be asked for.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
    Deleted,
    Pending,
    Archived,
    Standby,
    Running,
}

impl DesiredState {
    pub fn as_str(self) -> &'static str {
        match self {
            DesiredState::Deleted => "DELETED",
            DesiredState::Pending => "PENDING",
            DesiredState::Archived => "ARCHIVED",
            DesiredState::Standby => "STANDBY",
            DesiredState::Running => "RUNNING",
        }
    }

    /// The phase that satisfies this desire.
    pub fn target_phase(self) -> Phase {
        match self {
            DesiredState::Deleted => Phase::Deleted,
            DesiredState::Pending => Phase::Pending,
            DesiredState::Archived => Phase::Archived,
            DesiredState::Standby => Phase::Standby,
            DesiredState::Running => Phase::Running,
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesiredState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DELETED" => Ok(DesiredState::Deleted),
            "PENDING" => Ok(DesiredState::Pending),
            "ARCHIVED" => Ok(DesiredState::Archived),
            "STANDBY" => Ok(DesiredState::Standby),
            "RUNNING" => Ok(DesiredState::Running),
            other => Err(ParseStateError::desired(other)),
        }
    }
}

/// A named work item that advances the phase by one level or handles
/// deletion. At most one per workspace at any time.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    None,
    CreateEmptyArchive,
    Provisioning,
    Restoring,
    Starting,
    Stopping,
    Archiving,
    Deleting,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::None => "NONE",
            Operation::CreateEmptyArchive => "CREATE_EMPTY_ARCHIVE",
            Operation::Provisioning => "PROVISIONING",
            Operation::Restoring => "RESTORING",
            Operation::Starting => "STARTING",
            Operation::Stopping => "STOPPING",
            Operation::Archiving => "ARCHIVING",
            Operation::Deleting => "DELETING",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(Operation::None),
            "CREATE_EMPTY_ARCHIVE" => Ok(Operation::CreateEmptyArchive),
            "PROVISIONING" => Ok(Operation::Provisioning),
            "RESTORING" => Ok(Operation::Restoring),
            "STARTING" => Ok(Operation::Starting),
            "STOPPING" => Ok(Operation::Stopping),
            "ARCHIVING" => Ok(Operation::Archiving),
            "DELETING" => Ok(Operation::Deleting),
            other => Err(ParseStateError::operation(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStateError {
    kind: &'static str,
    value: String,
}

impl ParseStateError {
    fn phase(value: &str) -> Self {
        Self {
            kind: "phase",
            value: value.to_string(),
        }
    }

    fn desired(value: &str) -> Self {
        Self {
            kind: "desired_state",
            value: value.to_string(),
        }
    }

    fn operation(value: &str) -> Self {
        Self {
            kind: "operation",
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_text_round_trip() {
        for phase in [
            Phase::Pending,
            Phase::Archived,
            Phase::Standby,
            Phase::Running,
            Phase::Error,
            Phase::Deleting,
            Phase::Deleted,
        ] {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("BOOTING".parse::<Phase>().is_err());
    }

    #[test]
    fn level_order_is_pending_archived_standby_running() {
        assert_eq!(Phase::Pending.level(), Some(0));
        assert_eq!(Phase::Archived.level(), Some(1));
        assert_eq!(Phase::Standby.level(), Some(2));
        assert_eq!(Phase::Running.level(), Some(3));
        assert_eq!(Phase::Error.level(), None);
        assert_eq!(Phase::Deleting.level(), None);
    }

    #[test]
    fn desired_state_is_a_subset_of_phase() {
        for desired in [
            DesiredState::Deleted,
            DesiredState::Pending,
            DesiredState::Archived,
            DesiredState::Standby,
            DesiredState::Running,
        ] {
            assert_eq!(desired.as_str(), desired.target_phase().as_str());
        }
    }

    #[test]
    fn operation_text_round_trip() {
        for op in [
            Operation::None,
            Operation::CreateEmptyArchive,
            Operation::Provisioning,
            Operation::Restoring,
            Operation::Starting,
            Operation::Stopping,
            Operation::Archiving,
            Operation::Deleting,
        ] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
    }
}
