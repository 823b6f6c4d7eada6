//! Job blueprints and the component factories they are built from.

use std::{collections::BTreeMap, sync::Arc};

use gym_config::{EarlyStoppingConfig, ExperimentId};

use crate::{
    component::{ComponentError, Model},
    job::{ExecutionPlan, Job},
    quadratic::QuadraticFactory,
    store::{MODEL_KEY, StateStore, StoreError},
};

/// An immutable recipe for one job.
///
/// `construct` only allocates fresh components; it never touches state
/// shared with other blueprints. A re-evaluation recipe reads the model
/// checkpoint of its own experiment.
pub trait JobBlueprint: Send + Sync {
    fn experiment_id(&self) -> &ExperimentId;

    /// Check the recipe without building anything.
    fn validate(&self) -> Result<(), BlueprintError> {
        Ok(())
    }

    fn construct(&self) -> Result<Box<dyn Job>, BlueprintError>;
}

/// Hyperparameters of one run plus the fold it trains on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentParams {
    pub values: toml::Table,
    pub fold: Option<usize>,
    pub inner_fold: Option<usize>,
}

impl ComponentParams {
    #[must_use]
    pub fn new(values: toml::Table) -> Self {
        Self {
            values,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_fold(mut self, fold: usize) -> Self {
        self.fold = Some(fold);
        self
    }

    #[must_use]
    pub fn with_inner_fold(mut self, inner_fold: usize) -> Self {
        self.inner_fold = Some(inner_fold);
        self
    }

    /// Float parameter; integers are accepted.
    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, BlueprintError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(toml::Value::Float(v)) => Ok(Some(*v)),
            #[allow(clippy::cast_precision_loss)]
            Some(toml::Value::Integer(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(invalid(key, format!("expected a number, got {other}"))),
        }
    }

    pub fn get_usize(&self, key: &str) -> Result<Option<usize>, BlueprintError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(v)) => usize::try_from(*v)
                .map(Some)
                .map_err(|_| invalid(key, format!("expected a non-negative integer, got {v}"))),
            Some(other) => Err(invalid(key, format!("expected an integer, got {other}"))),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>, BlueprintError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(toml::Value::String(v)) => Ok(Some(v)),
            Some(other) => Err(invalid(key, format!("expected a string, got {other}"))),
        }
    }

    /// The `early_stopping` table, if present.
    pub fn early_stopping(&self) -> Result<Option<EarlyStoppingConfig>, BlueprintError> {
        let Some(value) = self.values.get("early_stopping") else {
            return Ok(None);
        };
        let config: EarlyStoppingConfig = value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| invalid("early_stopping", e.message().to_string()))?;
        config
            .validate()
            .map_err(|e| invalid("early_stopping", e))?;
        Ok(Some(config))
    }
}

fn invalid(key: &str, reason: String) -> BlueprintError {
    BlueprintError::InvalidParameter {
        key: key.to_string(),
        reason,
    }
}

/// Builds the concrete components of a job from its parameters.
pub trait ComponentFactory: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, params: &ComponentParams) -> Result<(), BlueprintError>;

    /// Build the job for `plan`.
    ///
    /// A `ReEval` job scores whatever model it is handed and never reads
    /// checkpoints itself, so for that plan the factory must supply the
    /// trained model, e.g. through [`load_trained_model`].
    fn build(
        &self,
        experiment_id: &ExperimentId,
        plan: &ExecutionPlan,
        params: &ComponentParams,
        store: Arc<dyn StateStore>,
    ) -> Result<Box<dyn Job>, BlueprintError>;
}

/// Component factories keyed by blueprint name.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: BTreeMap<String, Arc<dyn ComponentFactory>>,
}

impl ComponentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in factories.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(QuadraticFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn ComponentFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ComponentFactory>, BlueprintError> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| BlueprintError::UnknownBlueprint {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Blueprint backed by a registered [`ComponentFactory`].
#[derive(Clone)]
pub struct StandardBlueprint {
    experiment_id: ExperimentId,
    plan: ExecutionPlan,
    factory: Arc<dyn ComponentFactory>,
    params: ComponentParams,
    store: Arc<dyn StateStore>,
}

impl StandardBlueprint {
    #[must_use]
    pub fn new(
        experiment_id: ExperimentId,
        plan: ExecutionPlan,
        factory: Arc<dyn ComponentFactory>,
        params: ComponentParams,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            experiment_id,
            plan,
            factory,
            params,
            store,
        }
    }

    #[must_use]
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    #[must_use]
    pub fn params(&self) -> &ComponentParams {
        &self.params
    }
}

impl JobBlueprint for StandardBlueprint {
    fn experiment_id(&self) -> &ExperimentId {
        &self.experiment_id
    }

    fn validate(&self) -> Result<(), BlueprintError> {
        self.experiment_id
            .segments()
            .map_err(BlueprintError::InvalidExperimentId)?;
        if let ExecutionPlan::ReEval { epochs } = &self.plan
            && epochs.is_empty()
        {
            return Err(BlueprintError::EmptyEpochList(self.experiment_id.clone()));
        }
        self.params.early_stopping()?;
        self.factory.validate(&self.params)
    }

    fn construct(&self) -> Result<Box<dyn Job>, BlueprintError> {
        self.factory.build(
            &self.experiment_id,
            &self.plan,
            &self.params,
            Arc::clone(&self.store),
        )
    }
}

/// Restore `model` from the last committed model checkpoint of `experiment_id`.
///
/// Returns the epoch it was restored from, or [`BlueprintError::Untrained`]
/// when the experiment never wrote a model checkpoint.
pub fn load_trained_model<M: Model>(
    model: &mut M,
    experiment_id: &ExperimentId,
    store: &dyn StateStore,
) -> Result<u64, BlueprintError> {
    let epoch = store.last_epoch(experiment_id)?;
    if !store.contains(MODEL_KEY, experiment_id, epoch)? {
        return Err(BlueprintError::Untrained(experiment_id.clone()));
    }
    model.set_state(store.load(MODEL_KEY, experiment_id, epoch)?)?;
    tracing::debug!("{} re-evaluates the model of epoch {}", experiment_id, epoch);
    Ok(epoch)
}

/// Errors that can occur validating or constructing a blueprint.
#[derive(Debug, thiserror::Error)]
pub enum BlueprintError {
    #[error("unknown blueprint '{name}'. Available: {available}")]
    UnknownBlueprint { name: String, available: String },
    #[error("invalid parameter '{key}': {reason}")]
    InvalidParameter { key: String, reason: String },
    #[error("{0}")]
    InvalidExperimentId(String),
    #[error("re-evaluation of {0} has an empty epoch list")]
    EmptyEpochList(ExperimentId),
    #[error("{0} has no trained model to re-evaluate")]
    Untrained(ExperimentId),
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    fn params(toml: &str) -> ComponentParams {
        ComponentParams::new(toml::from_str(toml).unwrap())
    }

    fn blueprint(id: &str, plan: ExecutionPlan, params: ComponentParams) -> StandardBlueprint {
        StandardBlueprint::new(
            ExperimentId::new(id),
            plan,
            Arc::new(QuadraticFactory),
            params,
            Arc::new(MemoryStateStore::new()),
        )
    }

    #[test]
    fn test_param_accessors() {
        let p = params(
            r#"
learning_rate = 0.5
dim = 3
name = "a"
"#,
        );
        assert_eq!(p.get_f64("learning_rate").unwrap(), Some(0.5));
        assert_eq!(p.get_f64("dim").unwrap(), Some(3.0));
        assert_eq!(p.get_usize("dim").unwrap(), Some(3));
        assert_eq!(p.get_str("name").unwrap(), Some("a"));
        assert_eq!(p.get_f64("missing").unwrap(), None);
        assert!(p.get_usize("learning_rate").is_err());
        assert!(p.get_f64("name").is_err());
    }

    #[test]
    fn test_early_stopping_param() {
        let p = params(
            r#"
[early_stopping]
strategy = "patience"
patience = 2
split_name = "val"
monitoring_key = "mse"
"#,
        );
        assert!(matches!(
            p.early_stopping().unwrap(),
            Some(EarlyStoppingConfig::Patience { patience: 2, .. })
        ));

        let p = params(
            r#"
[early_stopping]
strategy = "patience"
patience = 0
split_name = "val"
monitoring_key = "mse"
"#,
        );
        assert!(matches!(
            p.early_stopping().unwrap_err(),
            BlueprintError::InvalidParameter { .. }
        ));
        assert!(params("").early_stopping().unwrap().is_none());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ComponentRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["quadratic"]);
        assert!(registry.get("quadratic").is_ok());
        let err = registry.get("resnet").err().unwrap();
        assert!(err.to_string().contains("quadratic"));
    }

    #[test]
    fn test_blueprint_validate() {
        let ok = blueprint("gs/a", ExecutionPlan::Train { num_epochs: 2 }, params(""));
        assert!(ok.validate().is_ok());

        let bad_id = blueprint("gs/../a", ExecutionPlan::Train { num_epochs: 2 }, params(""));
        assert!(matches!(
            bad_id.validate(),
            Err(BlueprintError::InvalidExperimentId(_))
        ));

        let empty = blueprint("gs/a", ExecutionPlan::ReEval { epochs: vec![] }, params(""));
        assert!(matches!(
            empty.validate(),
            Err(BlueprintError::EmptyEpochList(_))
        ));

        let bad_lr = blueprint(
            "gs/a",
            ExecutionPlan::Train { num_epochs: 2 },
            params("learning_rate = -1.0"),
        );
        assert!(bad_lr.validate().is_err());
    }

    #[test]
    fn test_re_eval_needs_trained_model() {
        let bp = blueprint("gs/a", ExecutionPlan::ReEval { epochs: vec![1] }, params(""));
        assert!(bp.validate().is_ok());
        assert!(matches!(
            bp.construct().err().unwrap(),
            BlueprintError::Untrained(_)
        ));
    }

    #[test]
    fn test_construct_builds_fresh_jobs() {
        let bp = blueprint("gs/a", ExecutionPlan::Train { num_epochs: 1 }, params(""));
        let first = bp.construct().unwrap();
        let second = bp.construct().unwrap();
        assert_eq!(first.experiment_id(), second.experiment_id());
        assert_eq!(first.plan(), &ExecutionPlan::Train { num_epochs: 1 });
    }
}
