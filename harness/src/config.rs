//! Grid search and evaluation configuration files.

use std::{collections::HashSet, path::Path};

use gym_config::ValidationMode;
use serde::Deserialize;

/// Grid search file as written, before merging.
#[derive(Debug, Clone, Deserialize)]
struct RawGridSearchConfig {
    #[serde(default = "empty_table")]
    defaults: toml::Value,
    #[serde(default)]
    runs: Vec<toml::Value>,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::Table::new())
}

/// Pre-expanded grid search: one entry per hyperparameter configuration.
///
/// ```toml
/// [defaults]
/// learning_rate = 0.1
///
/// [[runs]]
/// name = "lr-0.1"
///
/// [[runs]]
/// name = "lr-0.3"
/// learning_rate = 0.3
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GridSearchConfig {
    pub runs: Vec<RunConfig>,
}

/// One configuration of the grid, with `[defaults]` already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub name: String,
    pub params: toml::Table,
}

/// Merge two TOML values, `overlay` wins. Tables merge recursively.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    let (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) = (base, overlay) else {
        return overlay.clone();
    };
    let mut merged = base_map.clone();
    for (key, value) in overlay_map {
        let value = match base_map.get(key) {
            Some(base_value) => merge_toml(base_value, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    toml::Value::Table(merged)
}

impl GridSearchConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawGridSearchConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if !raw.defaults.is_table() {
            return Err(ConfigError::MalformedBlueprint(
                "[defaults] must be a table".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut runs = Vec::with_capacity(raw.runs.len());
        for (i, run) in raw.runs.iter().enumerate() {
            let toml::Value::Table(mut params) = merge_toml(&raw.defaults, run) else {
                return Err(ConfigError::MalformedBlueprint(format!(
                    "run #{i} is not a table"
                )));
            };
            let name = match params.remove("name") {
                Some(toml::Value::String(name)) => name,
                Some(other) => {
                    return Err(ConfigError::MalformedBlueprint(format!(
                        "run #{i}: name must be a string, got {other}"
                    )));
                }
                None => {
                    return Err(ConfigError::MalformedBlueprint(format!(
                        "run #{i} has no name"
                    )));
                }
            };
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(ConfigError::MalformedBlueprint(format!(
                    "run name '{name}' is not a valid path segment"
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateRun(name));
            }
            runs.push(RunConfig { name, params });
        }

        if runs.is_empty() {
            return Err(ConfigError::MalformedBlueprint(
                "grid search has no [[runs]]".to_string(),
            ));
        }
        Ok(Self { runs })
    }
}

/// Fold layout for cross validation and nested cross validation.
///
/// ```toml
/// [cross_validation]
/// num_folds = 5
///
/// [nested_cv]
/// outer_folds = 5
/// inner_folds = 3
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub cross_validation: Option<CrossValidationConfig>,
    #[serde(default)]
    pub nested_cv: Option<NestedCvConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CrossValidationConfig {
    pub num_folds: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct NestedCvConfig {
    pub outer_folds: usize,
    pub inner_folds: usize,
}

impl EvaluationConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Number of folds for cross validation.
    pub fn num_folds(&self) -> Result<usize, ConfigError> {
        let cv = self
            .cross_validation
            .ok_or(ConfigError::MissingEvaluationConfig(
                ValidationMode::CrossValidation,
            ))?;
        check_folds("cross_validation.num_folds", cv.num_folds)?;
        Ok(cv.num_folds)
    }

    /// `(outer, inner)` fold counts for nested cross validation.
    pub fn nested_folds(&self) -> Result<(usize, usize), ConfigError> {
        let nested = self
            .nested_cv
            .ok_or(ConfigError::MissingEvaluationConfig(ValidationMode::NestedCv))?;
        check_folds("nested_cv.outer_folds", nested.outer_folds)?;
        check_folds("nested_cv.inner_folds", nested.inner_folds)?;
        Ok((nested.outer_folds, nested.inner_folds))
    }
}

fn check_folds(key: &str, folds: usize) -> Result<(), ConfigError> {
    if folds < 2 {
        return Err(ConfigError::InvalidFolds(format!(
            "{key} must be at least 2, got {folds}"
        )));
    }
    Ok(())
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("{0}")]
    InvalidValidationMode(String),
    #[error("validation mode {0} needs an evaluation config")]
    MissingEvaluationConfig(ValidationMode),
    #[error("malformed blueprint: {0}")]
    MalformedBlueprint(String),
    #[error("duplicate run name '{0}'")]
    DuplicateRun(String),
    #[error("invalid fold count: {0}")]
    InvalidFolds(String),
}
