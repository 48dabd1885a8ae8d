// Run Events
// Progress reporting for manifest execution

use crate::runner::result::SkipReason;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for run progress events
pub type ProgressSender = mpsc::UnboundedSender<RunEvent>;

/// Receiver for run progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<RunEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while a manifest runs
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    PipelineStarted {
        pipeline: String,
        total_stages: usize,
    },

    /// Backend call issued for a stage
    StageStarted { stage: String, cache_key: String },

    /// Stage satisfied from the execution cache
    StageCached { stage: String, cache_key: String },

    StageCompleted {
        stage: String,
        success: bool,
        error: Option<String>,
        duration: Duration,
    },

    StageSkipped { stage: String, reason: SkipReason },

    PipelineCompleted {
        pipeline: String,
        success: bool,
        duration: Duration,
    },
}

impl RunEvent {
    pub fn pipeline_started(pipeline: impl Into<String>, total_stages: usize) -> Self {
        Self::PipelineStarted {
            pipeline: pipeline.into(),
            total_stages,
        }
    }

    pub fn stage_started(stage: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self::StageStarted {
            stage: stage.into(),
            cache_key: cache_key.into(),
        }
    }

    pub fn stage_cached(stage: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self::StageCached {
            stage: stage.into(),
            cache_key: cache_key.into(),
        }
    }

    pub fn stage_completed(
        stage: impl Into<String>,
        error: Option<String>,
        duration: Duration,
    ) -> Self {
        Self::StageCompleted {
            stage: stage.into(),
            success: error.is_none(),
            error,
            duration,
        }
    }

    pub fn stage_skipped(stage: impl Into<String>, reason: SkipReason) -> Self {
        Self::StageSkipped {
            stage: stage.into(),
            reason,
        }
    }

    pub fn pipeline_completed(pipeline: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::PipelineCompleted {
            pipeline: pipeline.into(),
            success,
            duration,
        }
    }

    /// Stage the event refers to, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            RunEvent::StageStarted { stage, .. }
            | RunEvent::StageCached { stage, .. }
            | RunEvent::StageCompleted { stage, .. }
            | RunEvent::StageSkipped { stage, .. } => Some(stage),
            RunEvent::PipelineStarted { .. } | RunEvent::PipelineCompleted { .. } => None,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: RunEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: RunEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: RunEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
