//! Early stopping configuration.

use serde::{Deserialize, Serialize};

/// Early stopping strategy selection.
///
/// Tagged by `strategy` so it can live inline in a run table:
///
/// ```toml
/// [defaults.early_stopping]
/// strategy = "patience"
/// patience = 3
/// split_name = "val"
/// monitoring_key = "loss"
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum EarlyStoppingConfig {
    /// Stop when the monitored value improved by less than
    /// `min_relative_improvement` between every pair of consecutive epochs
    /// within the last `epochs_window` epochs.
    LastKEpochsImprovement {
        min_relative_improvement: f64,
        epochs_window: usize,
        split_name: String,
        monitoring_key: String,
        #[serde(default)]
        is_increase_task: bool,
    },
    /// Stop after `patience` consecutive epochs without an improvement
    /// larger than `min_delta`.
    Patience {
        patience: usize,
        #[serde(default)]
        min_delta: f64,
        split_name: String,
        monitoring_key: String,
        #[serde(default)]
        is_increase_task: bool,
    },
}

impl EarlyStoppingConfig {
    /// Check the parameters for values no strategy can work with.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::LastKEpochsImprovement {
                min_relative_improvement,
                epochs_window,
                ..
            } => {
                if *epochs_window < 2 {
                    return Err("epochs_window must be >= 2".to_string());
                }
                if !min_relative_improvement.is_finite() || *min_relative_improvement < 0.0 {
                    return Err("min_relative_improvement must be >= 0".to_string());
                }
            }
            Self::Patience {
                patience,
                min_delta,
                ..
            } => {
                if *patience == 0 {
                    return Err("patience must be >= 1".to_string());
                }
                if !min_delta.is_finite() || *min_delta < 0.0 {
                    return Err("min_delta must be >= 0".to_string());
                }
            }
        }
        Ok(())
    }

    /// Name of the evaluation split this strategy monitors.
    #[must_use]
    pub fn split_name(&self) -> &str {
        match self {
            Self::LastKEpochsImprovement { split_name, .. } | Self::Patience { split_name, .. } => {
                split_name
            }
        }
    }
}
