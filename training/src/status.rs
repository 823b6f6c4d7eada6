//! Status events emitted by jobs and the scheduler.

use gym_config::ExperimentId;
use serde::{Deserialize, Serialize};

use crate::{job::JobStatus, metrics::EvaluationResults};

/// A status update for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    JobStatus {
        experiment_id: ExperimentId,
        status: JobStatus,
        epoch: u64,
    },
    Progress {
        experiment_id: ExperimentId,
        epoch: u64,
        num_epochs: u64,
    },
    Evaluation {
        experiment_id: ExperimentId,
        epoch: u64,
        results: EvaluationResults,
    },
}

impl StatusEvent {
    #[must_use]
    pub fn experiment_id(&self) -> &ExperimentId {
        match self {
            Self::JobStatus { experiment_id, .. }
            | Self::Progress { experiment_id, .. }
            | Self::Evaluation { experiment_id, .. } => experiment_id,
        }
    }

    /// Short name of the event kind, as written in the `type` tag.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobStatus { .. } => "job_status",
            Self::Progress { .. } => "progress",
            Self::Evaluation { .. } => "evaluation",
        }
    }
}

/// Receiver of status events.
///
/// Publishing is fire-and-forget: implementations must not block the caller
/// and must swallow delivery failures.
pub trait StatusSink: Send + Sync {
    fn publish(&self, event: StatusEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn publish(&self, _event: StatusEvent) {}
}

/// Writes events to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn publish(&self, event: StatusEvent) {
        match event {
            StatusEvent::JobStatus {
                experiment_id,
                status,
                epoch,
            } => match status {
                JobStatus::Failed => {
                    tracing::warn!("{} is {} at epoch {}", experiment_id, status, epoch);
                }
                _ => tracing::info!("{} is {} at epoch {}", experiment_id, status, epoch),
            },
            StatusEvent::Progress {
                experiment_id,
                epoch,
                num_epochs,
            } => tracing::debug!("{} finished epoch {}/{}", experiment_id, epoch, num_epochs),
            StatusEvent::Evaluation {
                experiment_id,
                epoch,
                results,
            } => {
                for split in &results.0 {
                    tracing::debug!(
                        "{} epoch {} [{}] metrics={:?} losses={:?}",
                        experiment_id,
                        epoch,
                        split.split_name,
                        split.metrics,
                        split.losses
                    );
                }
            }
        }
    }
}
