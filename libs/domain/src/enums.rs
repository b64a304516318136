//! Status and type enums for the Maestro workflow engine
//!
//! These enums are the source of truth for every status string that
//! reaches the state store or the coordination store.

use serde::{Deserialize, Serialize};

// =============================================================================
// Workflow Status
// =============================================================================

/// Status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Retry,
}

impl WorkflowStatus {
    /// Check if this is a terminal status
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether the main loop should keep dispatching steps
    #[must_use]
    pub fn is_executing(self) -> bool {
        matches!(self, Self::Running | Self::Retry)
    }

    /// Check if transition to the target status is allowed
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        use WorkflowStatus::{Cancelled, Completed, Failed, Paused, Pending, Retry, Running};

        matches!(
            (self, target),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Retry)
                | (Retry, Running)
                | (Retry, Failed)
                | (Retry, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    /// Get the status name as stored in the database
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retry => "retry",
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

// =============================================================================
// Step Type
// =============================================================================

/// Type of workflow step
///
/// All types except `Parallel` and `Branching` dispatch a single task; the
/// type is carried through to the worker pool as routing metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Analysis,
    Transformation,
    Optimization,
    Validation,
    Approval,
    Notification,
    Branching,
    Parallel,
    Custom,
}

impl Default for StepType {
    fn default() -> Self {
        Self::Custom
    }
}

// =============================================================================
// Step Status
// =============================================================================

/// Status of a single step within an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Skipped,
}

impl StepStatus {
    /// Check if this is a terminal step status
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        assert!(WorkflowStatus::Pending.can_transition_to(WorkflowStatus::Running));
        assert!(WorkflowStatus::Running.can_transition_to(WorkflowStatus::Paused));
        assert!(WorkflowStatus::Paused.can_transition_to(WorkflowStatus::Running));
        assert!(WorkflowStatus::Running.can_transition_to(WorkflowStatus::Cancelled));

        // Terminal states are final
        assert!(!WorkflowStatus::Completed.can_transition_to(WorkflowStatus::Running));
        assert!(!WorkflowStatus::Cancelled.can_transition_to(WorkflowStatus::Running));
        assert!(!WorkflowStatus::Failed.can_transition_to(WorkflowStatus::Paused));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
            WorkflowStatus::Retry,
        ] {
            let parsed: WorkflowStatus = status.as_str().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_step_type_serialization() {
        let json = serde_json::to_string(&StepType::Optimization).unwrap();
        assert_eq!(json, "\"optimization\"");
        let parsed: StepType = serde_json::from_str("\"branching\"").unwrap();
        assert_eq!(parsed, StepType::Branching);
    }
}
