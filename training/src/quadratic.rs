//! Deterministic reference components: gradient descent on a quadratic bowl.
//!
//! The model is a parameter vector `w`, the objective is `mean((w - t)^2)`.
//! Training minimizes it against the training target; evaluation scores the
//! model on a `train` split and on a `val` split whose target is shifted per
//! fold, so folds of a cross validation produce different scores.
//!
//! Parameters (all optional):
//!
//! | key             | default |
//! |-----------------|---------|
//! | `dim`           | 4       |
//! | `init`          | 1.0     |
//! | `target`        | 0.0     |
//! | `learning_rate` | 0.1     |
//! | `fold_shift`    | 0.01    |
//! | `early_stopping`| none    |

use std::sync::Arc;

use gym_config::{Device, ExperimentId};
use serde::{Deserialize, Serialize};

use crate::{
    blueprint::{BlueprintError, ComponentFactory, ComponentParams, load_trained_model},
    component::{
        Checkpointable, ComponentError, EpochCounter, Evaluator, Model, StateSnapshot, Trainer,
    },
    early_stopping,
    job::{ExecutionPlan, GymJob, Job, JobComponents},
    metrics::{EvaluationBatchResult, EvaluationResults},
    store::StateStore,
};

pub const TRAIN_SPLIT: &str = "train";
pub const VAL_SPLIT: &str = "val";
pub const MSE_KEY: &str = "mse";
pub const RMSE_KEY: &str = "rmse";

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterVector {
    pub weights: Vec<f64>,
    pub device: Device,
}

#[derive(Serialize, Deserialize)]
struct ParameterState {
    weights: Vec<f64>,
}

impl ParameterVector {
    #[must_use]
    pub fn new(dim: usize, init: f64) -> Self {
        Self {
            weights: vec![init; dim],
            device: Device::Cpu,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn mse(&self, target: f64) -> f64 {
        if self.weights.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.weights.iter().map(|w| (w - target).powi(2)).sum();
        sum / self.weights.len() as f64
    }
}

impl Checkpointable for ParameterVector {
    fn get_state(&self) -> Result<StateSnapshot, ComponentError> {
        Ok(serde_json::to_value(ParameterState {
            weights: self.weights.clone(),
        })?)
    }

    fn set_state(&mut self, state: StateSnapshot) -> Result<(), ComponentError> {
        let state: ParameterState = serde_json::from_value(state)?;
        if state.weights.len() != self.weights.len() {
            return Err(ComponentError::InvalidState(format!(
                "expected {} weights, got {}",
                self.weights.len(),
                state.weights.len()
            )));
        }
        self.weights = state.weights;
        Ok(())
    }
}

impl Model for ParameterVector {
    fn to_device(&mut self, device: Device) -> Result<(), ComponentError> {
        self.device = device;
        Ok(())
    }
}

/// Full-batch gradient descent towards `target`.
#[derive(Debug, Clone)]
pub struct GradientDescentTrainer {
    learning_rate: f64,
    target: f64,
    counter: EpochCounter,
}

impl GradientDescentTrainer {
    #[must_use]
    pub fn new(learning_rate: f64, target: f64) -> Self {
        Self {
            learning_rate,
            target,
            counter: EpochCounter::default(),
        }
    }
}

impl Checkpointable for GradientDescentTrainer {
    fn get_state(&self) -> Result<StateSnapshot, ComponentError> {
        Ok(serde_json::to_value(self.counter)?)
    }

    fn set_state(&mut self, state: StateSnapshot) -> Result<(), ComponentError> {
        self.counter = serde_json::from_value(state)?;
        Ok(())
    }
}

impl Trainer<ParameterVector> for GradientDescentTrainer {
    fn train_epoch(
        &mut self,
        model: &mut ParameterVector,
        device: Device,
    ) -> Result<(), ComponentError> {
        if model.device != device {
            return Err(ComponentError::Device(
                device,
                format!("model lives on {}", model.device),
            ));
        }
        for w in &mut model.weights {
            *w -= self.learning_rate * 2.0 * (*w - self.target);
        }
        if model.weights.iter().any(|w| !w.is_finite()) {
            return Err(ComponentError::Step(format!(
                "diverged at epoch {}",
                self.counter.current_epoch
            )));
        }
        self.counter.advance();
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.counter.is_done()
    }

    fn current_epoch(&self) -> u64 {
        self.counter.current_epoch
    }

    fn set_num_epochs(&mut self, num_epochs: u64) {
        self.counter.num_epochs = num_epochs;
    }

    fn set_current_epoch(&mut self, epoch: u64) {
        self.counter.current_epoch = epoch;
    }
}

/// Scores the model on a train and a validation split.
#[derive(Debug, Clone)]
pub struct MseEvaluator {
    train_target: f64,
    val_target: f64,
}

impl MseEvaluator {
    #[must_use]
    pub fn new(train_target: f64, val_target: f64) -> Self {
        Self {
            train_target,
            val_target,
        }
    }
}

impl Evaluator<ParameterVector> for MseEvaluator {
    fn evaluate(
        &mut self,
        model: &ParameterVector,
        _device: Device,
    ) -> Result<EvaluationResults, ComponentError> {
        let split = |name: &str, target: f64| {
            let mse = model.mse(target);
            EvaluationBatchResult::new(name)
                .with_loss(MSE_KEY, mse)
                .with_metric(RMSE_KEY, mse.sqrt())
        };
        Ok(EvaluationResults(vec![
            split(TRAIN_SPLIT, self.train_target),
            split(VAL_SPLIT, self.val_target),
        ]))
    }
}

/// Resolved quadratic hyperparameters.
#[derive(Debug, Clone, PartialEq)]
struct QuadraticParams {
    dim: usize,
    init: f64,
    target: f64,
    learning_rate: f64,
    val_target: f64,
}

impl QuadraticParams {
    #[allow(clippy::cast_precision_loss)]
    fn parse(params: &ComponentParams) -> Result<Self, BlueprintError> {
        let dim = params.get_usize("dim")?.unwrap_or(4);
        let init = params.get_f64("init")?.unwrap_or(1.0);
        let target = params.get_f64("target")?.unwrap_or(0.0);
        let learning_rate = params.get_f64("learning_rate")?.unwrap_or(0.1);
        let fold_shift = params.get_f64("fold_shift")?.unwrap_or(0.01);

        if dim == 0 {
            return Err(BlueprintError::InvalidParameter {
                key: "dim".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(learning_rate > 0.0 && learning_rate.is_finite()) {
            return Err(BlueprintError::InvalidParameter {
                key: "learning_rate".to_string(),
                reason: format!("must be positive, got {learning_rate}"),
            });
        }

        let fold = params.fold.unwrap_or(0) + params.inner_fold.unwrap_or(0);
        Ok(Self {
            dim,
            init,
            target,
            learning_rate,
            val_target: target + fold_shift * fold as f64,
        })
    }
}

/// Factory registered as `quadratic`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticFactory;

impl ComponentFactory for QuadraticFactory {
    fn name(&self) -> &str {
        "quadratic"
    }

    fn validate(&self, params: &ComponentParams) -> Result<(), BlueprintError> {
        QuadraticParams::parse(params).map(|_| ())
    }

    fn build(
        &self,
        experiment_id: &ExperimentId,
        plan: &ExecutionPlan,
        params: &ComponentParams,
        store: Arc<dyn StateStore>,
    ) -> Result<Box<dyn Job>, BlueprintError> {
        let p = QuadraticParams::parse(params)?;
        let mut model = ParameterVector::new(p.dim, p.init);
        if let ExecutionPlan::ReEval { .. } = plan {
            load_trained_model(&mut model, experiment_id, store.as_ref())?;
        }
        let components = JobComponents {
            model,
            trainer: Box::new(GradientDescentTrainer::new(p.learning_rate, p.target)),
            evaluator: Box::new(MseEvaluator::new(p.target, p.val_target)),
            early_stopper: params
                .early_stopping()?
                .as_ref()
                .map(early_stopping::from_config)
                .transpose()?,
        };
        Ok(Box::new(GymJob::new(
            experiment_id.clone(),
            plan.clone(),
            components,
            store,
        )))
    }
}
