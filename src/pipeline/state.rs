//! Workflow stage machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage of a single attachment's workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    /// Not dispatched yet.
    Pending,
    Extracting,
    Classifying,
    /// Deciding the destination and moving the file.
    Filing,
    CleaningUp,
    Done,
    Failed,
}

impl WorkflowStage {
    /// Check if this stage allows transitioning to another stage.
    pub fn can_transition_to(&self, target: WorkflowStage) -> bool {
        use WorkflowStage::*;

        matches!(
            (self, target),
            (Pending, Extracting)
                | (Extracting, Classifying)
                | (Classifying, Filing)
                | (Filing, CleaningUp)
                | (CleaningUp, Done)
                // Any non-terminal stage can fail
                | (Pending | Extracting | Classifying | Filing | CleaningUp, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Classifying => "classifying",
            Self::Filing => "filing",
            Self::CleaningUp => "cleaning_up",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A stage transition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: WorkflowStage,
    pub to: WorkflowStage,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Current stage plus the transitions that led there.
#[derive(Debug, Clone)]
pub struct StageTracker {
    stage: WorkflowStage,
    transitions: Vec<StageTransition>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            stage: WorkflowStage::Pending,
            transitions: Vec::new(),
        }
    }

    pub fn stage(&self) -> WorkflowStage {
        self.stage
    }

    pub fn transitions(&self) -> &[StageTransition] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<StageTransition> {
        self.transitions
    }

    /// Transition to a new stage.
    pub fn transition_to(
        &mut self,
        next: WorkflowStage,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.stage.can_transition_to(next) {
            return Err(format!("Cannot transition from {} to {}", self.stage, next));
        }

        self.transitions.push(StageTransition {
            from: self.stage,
            to: next,
            timestamp: Utc::now(),
            reason,
        });
        self.stage = next;
        Ok(())
    }

    /// The last stage the run was working in.
    ///
    /// For a failed run this is the stage that failed, not `Failed` itself.
    pub fn stage_reached(&self) -> WorkflowStage {
        match self.stage {
            WorkflowStage::Failed => self
                .transitions
                .last()
                .map(|t| t.from)
                .unwrap_or(WorkflowStage::Pending),
            stage => stage,
        }
    }
}
