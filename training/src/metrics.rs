//! Evaluation results and measurement records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metrics and losses computed on one data split.
///
/// Values are histories: the last element is the most recent value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationBatchResult {
    pub split_name: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    pub losses: BTreeMap<String, Vec<f64>>,
}

impl EvaluationBatchResult {
    #[must_use]
    pub fn new(split_name: impl Into<String>) -> Self {
        Self {
            split_name: split_name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.entry(key.into()).or_default().push(value);
        self
    }

    #[must_use]
    pub fn with_loss(mut self, key: impl Into<String>, value: f64) -> Self {
        self.losses.entry(key.into()).or_default().push(value);
        self
    }

    /// Latest value for `key`, looking at metrics first, then losses.
    #[must_use]
    pub fn latest(&self, key: &str) -> Option<f64> {
        self.metrics
            .get(key)
            .or_else(|| self.losses.get(key))
            .and_then(|values| values.last().copied())
    }
}

/// The metrics record produced by one evaluation: one entry per split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationResults(pub Vec<EvaluationBatchResult>);

impl EvaluationResults {
    #[must_use]
    pub fn split(&self, split_name: &str) -> Option<&EvaluationBatchResult> {
        self.0.iter().find(|r| r.split_name == split_name)
    }

    /// Latest value of `key` on `split_name`.
    #[must_use]
    pub fn latest(&self, split_name: &str, key: &str) -> Option<f64> {
        self.split(split_name)?.latest(key)
    }
}

impl From<Vec<EvaluationBatchResult>> for EvaluationResults {
    fn from(results: Vec<EvaluationBatchResult>) -> Self {
        Self(results)
    }
}

/// A logged evaluation, tagged with the epoch (measurement id) it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub epoch: u64,
    pub results: EvaluationResults,
}
