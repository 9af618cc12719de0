//! The pipeline state model: stages, progress checkpoints and the snapshot
//! observers receive.
//!
//! [`PipelineState`] is the single source of truth for progress. Only the
//! orchestrator writes it; everyone else gets clones.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Identifier of one upload-to-download run.
pub type SessionId = u64;

/// Advisory progress checkpoints, in pipeline order.
pub mod checkpoint {
    pub const UPLOAD_TARGET: u8 = 10;
    pub const BYTES_TRANSFERRED: u8 = 30;
    pub const REGISTERED: u8 = 50;
    pub const TASK_PENDING_FIRST: u8 = 60;
    pub const TASK_PENDING_LAST: u8 = 70;
    pub const OPERATION_PENDING_FIRST: u8 = 75;
    pub const OPERATION_PENDING_LAST: u8 = 80;
    pub const CONVERSION_ISSUED: u8 = 85;
    pub const CONVERSION_PENDING: u8 = 90;
    pub const COMPLETE: u8 = 100;

    /// Progress for the `attempt`-th pending tick of a stage whose pending
    /// band is `first..=last`: one point per tick, saturating at `last`.
    pub fn pending(first: u8, last: u8, attempt: u32) -> u8 {
        let step = attempt.saturating_sub(1).min(u32::from(last - first)) as u8;
        first + step
    }
}

/// One ordered phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    Uploading,
    Processing,
    AwaitingOperation,
    Converting,
    Completed,
    Failed,
}

impl Stage {
    /// Completed and Failed only leave via reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// A session is running in every stage except these three.
    pub fn is_active(self) -> bool {
        !matches!(self, Stage::Idle | Stage::Completed | Stage::Failed)
    }

    /// Progress values a snapshot in this stage may carry.
    pub fn progress_range(self) -> RangeInclusive<u8> {
        use checkpoint::*;
        match self {
            Stage::Idle => 0..=0,
            Stage::Uploading => UPLOAD_TARGET..=UPLOAD_TARGET,
            Stage::Processing => BYTES_TRANSFERRED..=TASK_PENDING_LAST,
            Stage::AwaitingOperation => OPERATION_PENDING_FIRST..=OPERATION_PENDING_LAST,
            Stage::Converting => CONVERSION_ISSUED..=CONVERSION_PENDING,
            Stage::Completed => COMPLETE..=COMPLETE,
            Stage::Failed => 0..=COMPLETE,
        }
    }

    /// The stage that follows this one on the happy path.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::Uploading),
            Stage::Uploading => Some(Stage::Processing),
            Stage::Processing => Some(Stage::AwaitingOperation),
            Stage::AwaitingOperation => Some(Stage::Converting),
            Stage::Converting => Some(Stage::Completed),
            Stage::Completed | Stage::Failed => None,
        }
    }

    /// Whether the state machine allows moving from `self` to `to`.
    ///
    /// Staying in the same non-terminal stage is a progress update. Reset to
    /// Idle is always allowed.
    pub fn can_transition_to(self, to: Stage) -> bool {
        if to == Stage::Idle {
            return true;
        }
        if self == to {
            return !self.is_terminal();
        }
        if to == Stage::Failed {
            return !self.is_terminal();
        }
        self.next() == Some(to)
    }

    /// The public status vocabulary exposed to observers.
    pub fn status(self) -> PipelineStatus {
        match self {
            Stage::Idle => PipelineStatus::Idle,
            Stage::Uploading => PipelineStatus::Uploading,
            Stage::Processing | Stage::AwaitingOperation => PipelineStatus::Processing,
            Stage::Converting => PipelineStatus::Converting,
            Stage::Completed => PipelineStatus::Completed,
            Stage::Failed => PipelineStatus::Error,
        }
    }

    /// Human label used in error messages and logs.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Idle => "Idle",
            Stage::Uploading => "Upload",
            Stage::Processing => "Recognition task",
            Stage::AwaitingOperation => "Recognition operation",
            Stage::Converting => "Conversion",
            Stage::Completed => "Completed",
            Stage::Failed => "Failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Coarse status shown to a UI: `idle, uploading, processing, converting,
/// completed, error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Idle,
    Uploading,
    Processing,
    Converting,
    Completed,
    Error,
}

/// A read-only snapshot of the orchestrator's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub stage: Stage,
    /// Advisory description of the current activity. Never parsed.
    pub message: String,
    /// 0–100, non-decreasing within a session until Failed.
    pub progress: u8,
    /// Present iff `stage == Failed`.
    pub error: Option<String>,
    /// Classification of `error`, present alongside it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Key of the uploaded object (`file_key`), fixed once assigned.
    pub artifact_ref: Option<String>,
    /// Stored path of the finished workbook, only set on Completed.
    pub result_ref: Option<String>,
    /// Task id or operation name currently being tracked remotely.
    pub task_ref: Option<String>,
    pub session: Option<SessionId>,
}

impl PipelineState {
    pub fn status(&self) -> PipelineStatus {
        self.stage.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Check the snapshot against the stage table and field rules.
    pub fn is_consistent(&self) -> bool {
        self.stage.progress_range().contains(&self.progress)
            && self.error.is_some() == (self.stage == Stage::Failed)
            && self.error_kind.is_some() == self.error.is_some()
            && (self.result_ref.is_none() || self.stage == Stage::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        let mut stage = Stage::Idle;
        while let Some(next) = stage.next() {
            assert!(stage.can_transition_to(next), "{stage:?} -> {next:?}");
            stage = next;
        }
        assert_eq!(stage, Stage::Completed);
    }

    #[test]
    fn skipping_and_revisiting_are_rejected() {
        assert!(!Stage::Uploading.can_transition_to(Stage::AwaitingOperation));
        assert!(!Stage::Converting.can_transition_to(Stage::Processing));
        assert!(!Stage::Completed.can_transition_to(Stage::Failed));
        assert!(!Stage::Failed.can_transition_to(Stage::Uploading));
        assert!(!Stage::Completed.can_transition_to(Stage::Completed));
    }

    #[test]
    fn reset_and_failure_edges() {
        for stage in [
            Stage::Uploading,
            Stage::Processing,
            Stage::AwaitingOperation,
            Stage::Converting,
        ] {
            assert!(stage.can_transition_to(Stage::Failed));
        }
        assert!(Stage::Failed.can_transition_to(Stage::Idle));
        assert!(Stage::Completed.can_transition_to(Stage::Idle));
    }

    #[test]
    fn status_vocabulary() {
        assert_eq!(Stage::AwaitingOperation.status(), PipelineStatus::Processing);
        assert_eq!(Stage::Failed.status(), PipelineStatus::Error);
        let json = serde_json::to_string(&PipelineStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn pending_progress_saturates() {
        use checkpoint::*;
        assert_eq!(pending(TASK_PENDING_FIRST, TASK_PENDING_LAST, 1), 60);
        assert_eq!(pending(TASK_PENDING_FIRST, TASK_PENDING_LAST, 4), 63);
        assert_eq!(pending(TASK_PENDING_FIRST, TASK_PENDING_LAST, 500), 70);
        assert_eq!(pending(CONVERSION_PENDING, CONVERSION_PENDING, 3), 90);
    }

    #[test]
    fn default_state_is_idle_and_consistent() {
        let s = PipelineState::default();
        assert_eq!(s.stage, Stage::Idle);
        assert_eq!(s.progress, 0);
        assert!(s.message.is_empty());
        assert!(s.error.is_none());
        assert!(s.is_consistent());
    }

    #[test]
    fn transferred_bytes_belong_to_processing() {
        let at = |stage| PipelineState {
            stage,
            progress: checkpoint::BYTES_TRANSFERRED,
            ..Default::default()
        };
        assert!(at(Stage::Processing).is_consistent());
        assert!(!at(Stage::Uploading).is_consistent());
    }

    #[test]
    fn error_without_failed_is_inconsistent() {
        let s = PipelineState {
            stage: Stage::Processing,
            progress: 50,
            error: Some("boom".into()),
            ..Default::default()
        };
        assert!(!s.is_consistent());
    }
}
