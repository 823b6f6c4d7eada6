//! Early stopping strategies.
//!
//! Strategies are stateful: their state is checkpointed after every epoch in
//! which the criterion did *not* fire, so a resumed job continues with the
//! same history.

use gym_config::EarlyStoppingConfig;
use serde::{Deserialize, Serialize};

use crate::{
    component::{Checkpointable, ComponentError, StateSnapshot},
    metrics::EvaluationResults,
};

/// A stopping criterion evaluated once per epoch.
pub trait EarlyStopper: Checkpointable + Send {
    fn is_stopping_criterion_fulfilled(
        &mut self,
        results: &EvaluationResults,
        epoch: u64,
    ) -> Result<bool, ComponentError>;
}

/// Build the strategy described by `config`.
pub fn from_config(config: &EarlyStoppingConfig) -> Result<Box<dyn EarlyStopper>, ComponentError> {
    Ok(match config.clone() {
        EarlyStoppingConfig::LastKEpochsImprovement {
            min_relative_improvement,
            epochs_window,
            split_name,
            monitoring_key,
            is_increase_task,
        } => Box::new(LastKEpochsImprovement::new(
            min_relative_improvement,
            epochs_window,
            Monitor {
                split_name,
                monitoring_key,
                is_increase_task,
            },
        )?),
        EarlyStoppingConfig::Patience {
            patience,
            min_delta,
            split_name,
            monitoring_key,
            is_increase_task,
        } => Box::new(Patience::new(
            patience,
            min_delta,
            Monitor {
                split_name,
                monitoring_key,
                is_increase_task,
            },
        )),
    })
}

/// Which value a strategy watches and in which direction it should move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub split_name: String,
    pub monitoring_key: String,
    pub is_increase_task: bool,
}

impl Monitor {
    fn value(&self, results: &EvaluationResults) -> Result<f64, ComponentError> {
        let split = results.split(&self.split_name).ok_or_else(|| {
            ComponentError::Metric(format!(
                "evaluation results do not contain split '{}'",
                self.split_name
            ))
        })?;
        split.latest(&self.monitoring_key).ok_or_else(|| {
            ComponentError::Metric(format!(
                "monitoring key '{}' not present in metrics or losses of split '{}'",
                self.monitoring_key, self.split_name
            ))
        })
    }
}

/// Stops when the monitored value stopped improving by at least
/// `min_relative_improvement` between consecutive epochs across the whole
/// window of the last `epochs_window` epochs.
///
/// The window is a ring buffer indexed by `epoch % epochs_window`. It is
/// seeded with a synthetic sequence that improves slightly faster than the
/// threshold, so the criterion cannot fire before real values have
/// displaced the seed.
///
/// The window spans at least two epochs, since a single value has no
/// improvement to measure.
#[derive(Debug, Clone)]
pub struct LastKEpochsImprovement {
    min_relative_improvement: f64,
    epochs_window: usize,
    monitor: Monitor,
    monitoring_values: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct LastKEpochsState {
    monitoring_values: Vec<f64>,
}

impl LastKEpochsImprovement {
    pub fn new(
        min_relative_improvement: f64,
        epochs_window: usize,
        monitor: Monitor,
    ) -> Result<Self, ComponentError> {
        if epochs_window < 2 {
            return Err(ComponentError::InvalidConfig(format!(
                "epochs_window must be >= 2, got {epochs_window}"
            )));
        }
        // Slightly above the threshold to absorb float error.
        let seed_step = min_relative_improvement * 1.1;
        let mut monitoring_values = Vec::with_capacity(epochs_window);
        let mut value = 1.0;
        for _ in 0..epochs_window {
            monitoring_values.push(value);
            value += value * seed_step;
        }
        if !monitor.is_increase_task {
            monitoring_values.reverse();
        }
        Ok(Self {
            min_relative_improvement,
            epochs_window,
            monitor,
            monitoring_values,
        })
    }

    fn slot(&self, epoch: u64, offset: usize) -> f64 {
        let window = self.epochs_window as u64;
        self.monitoring_values[((epoch + offset as u64) % window) as usize]
    }

    fn window_stalled(&self, epoch: u64) -> bool {
        let diffs = (0..self.epochs_window - 1).map(|i| {
            let next = self.slot(epoch, i + 2);
            let base = self.slot(epoch, i + 1);
            let base = if base == 0.0 { f64::EPSILON } else { base };
            (next - base) / base
        });
        if self.monitor.is_increase_task {
            diffs.fold(f64::NEG_INFINITY, f64::max) < self.min_relative_improvement
        } else {
            diffs.fold(f64::INFINITY, f64::min) > -self.min_relative_improvement
        }
    }
}

impl EarlyStopper for LastKEpochsImprovement {
    fn is_stopping_criterion_fulfilled(
        &mut self,
        results: &EvaluationResults,
        epoch: u64,
    ) -> Result<bool, ComponentError> {
        let value = self.monitor.value(results)?;
        let idx = (epoch % self.epochs_window as u64) as usize;
        self.monitoring_values[idx] = value;
        Ok(self.window_stalled(epoch))
    }
}

impl Checkpointable for LastKEpochsImprovement {
    fn get_state(&self) -> Result<StateSnapshot, ComponentError> {
        Ok(serde_json::to_value(LastKEpochsState {
            monitoring_values: self.monitoring_values.clone(),
        })?)
    }

    fn set_state(&mut self, state: StateSnapshot) -> Result<(), ComponentError> {
        let state: LastKEpochsState = serde_json::from_value(state)?;
        if state.monitoring_values.len() != self.epochs_window {
            return Err(ComponentError::InvalidState(format!(
                "expected {} monitoring values, got {}",
                self.epochs_window,
                state.monitoring_values.len()
            )));
        }
        self.monitoring_values = state.monitoring_values;
        Ok(())
    }
}

/// Stops after `patience` consecutive epochs without an improvement larger
/// than `min_delta` over the best value seen so far.
#[derive(Debug, Clone)]
pub struct Patience {
    patience: usize,
    min_delta: f64,
    monitor: Monitor,
    state: PatienceState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PatienceState {
    best: Option<f64>,
    counter: usize,
}

impl Patience {
    #[must_use]
    pub fn new(patience: usize, min_delta: f64, monitor: Monitor) -> Self {
        Self {
            patience,
            min_delta,
            monitor,
            state: PatienceState::default(),
        }
    }
}

impl EarlyStopper for Patience {
    fn is_stopping_criterion_fulfilled(
        &mut self,
        results: &EvaluationResults,
        _epoch: u64,
    ) -> Result<bool, ComponentError> {
        let value = self.monitor.value(results)?;
        let improved = match self.state.best {
            None => true,
            Some(best) if self.monitor.is_increase_task => value - best > self.min_delta,
            Some(best) => best - value > self.min_delta,
        };
        if improved {
            self.state.best = Some(value);
            self.state.counter = 0;
            return Ok(false);
        }
        self.state.counter += 1;
        Ok(self.state.counter >= self.patience)
    }
}

impl Checkpointable for Patience {
    fn get_state(&self) -> Result<StateSnapshot, ComponentError> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn set_state(&mut self, state: StateSnapshot) -> Result<(), ComponentError> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }
}
