use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Done,
    /// A step failed; compensation is in progress.
    Failed,
    Reverted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Reverted)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Done)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Failed, RunStatus::Reverted)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Done => write!(f, "done"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Reverted => write!(f, "reverted"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "done" => Ok(RunStatus::Done),
            "failed" => Ok(RunStatus::Failed),
            "reverted" => Ok(RunStatus::Reverted),
            _ => Err(Error::Validation(format!("Invalid run status: {}", s))),
        }
    }
}

/// Status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    /// Invoked, waiting for an external completion signal.
    Waiting,
    Success,
    Failed,
    Compensated,
    CompensationFailed,
    Skipped,
}

impl StepStatus {
    /// Whether dependents of a node in this status may start.
    pub fn unlocks_dependents(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Waiting => write!(f, "waiting"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Compensated => write!(f, "compensated"),
            StepStatus::CompensationFailed => write!(f, "compensation_failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "waiting" => Ok(StepStatus::Waiting),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            "compensated" => Ok(StepStatus::Compensated),
            "compensation_failed" => Ok(StepStatus::CompensationFailed),
            "skipped" => Ok(StepStatus::Skipped),
            _ => Err(Error::Validation(format!("Invalid step status: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverted_is_only_reachable_from_failed() {
        assert!(RunStatus::Failed.can_transition_to(RunStatus::Reverted));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Reverted));
        assert!(!RunStatus::Done.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Done));
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Done,
            RunStatus::Failed,
            RunStatus::Reverted,
        ] {
            assert_eq!(status.to_string().parse::<RunStatus>().unwrap(), status);
        }
        assert_eq!(
            "compensation_failed".parse::<StepStatus>().unwrap(),
            StepStatus::CompensationFailed
        );
        assert!("bogus".parse::<StepStatus>().is_err());
    }
}
