//! Capabilities a job is assembled from: model, trainer and evaluator.
//!
//! A job never inspects which concrete component it holds. The model is
//! owned by the job and lent to the trainer (mutably) and evaluator
//! (immutably) for each step.

use gym_config::Device;
use serde::{Deserialize, Serialize};

use crate::metrics::EvaluationResults;

/// Serialized state of a checkpointable component.
pub type StateSnapshot = serde_json::Value;

/// A component whose state can be captured and restored.
pub trait Checkpointable {
    fn get_state(&self) -> Result<StateSnapshot, ComponentError>;

    fn set_state(&mut self, state: StateSnapshot) -> Result<(), ComponentError>;
}

/// Model parameters that live on a device.
pub trait Model: Checkpointable + Send + 'static {
    /// Move parameters to `device`. Called before every train/evaluate step.
    fn to_device(&mut self, device: Device) -> Result<(), ComponentError>;
}

/// Drives optimization of a model, one epoch at a time.
pub trait Trainer<M: Model>: Checkpointable + Send {
    /// Run one epoch, mutating `model` in place, and advance the epoch counter.
    fn train_epoch(&mut self, model: &mut M, device: Device) -> Result<(), ComponentError>;

    fn is_done(&self) -> bool;

    fn current_epoch(&self) -> u64;

    fn set_num_epochs(&mut self, num_epochs: u64);

    fn set_current_epoch(&mut self, epoch: u64);
}

/// Scores a model.
pub trait Evaluator<M: Model>: Send {
    fn evaluate(&mut self, model: &M, device: Device) -> Result<EvaluationResults, ComponentError>;
}

/// Epoch bookkeeping shared by trainer implementations.
///
/// Epochs are 1-based; the counter is done once `current_epoch` has moved
/// past `num_epochs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochCounter {
    pub current_epoch: u64,
    pub num_epochs: u64,
}

impl EpochCounter {
    #[must_use]
    pub fn new(num_epochs: u64) -> Self {
        Self {
            current_epoch: 1,
            num_epochs,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.current_epoch > self.num_epochs
    }

    pub fn advance(&mut self) {
        self.current_epoch += 1;
    }
}

/// Errors raised by a component while executing a step.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("device {0} unavailable: {1}")]
    Device(Device, String),
    #[error("invalid component state: {0}")]
    InvalidState(String),
    #[error("invalid component configuration: {0}")]
    InvalidConfig(String),
    #[error("metric error: {0}")]
    Metric(String),
    #[error("step failed: {0}")]
    Step(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
