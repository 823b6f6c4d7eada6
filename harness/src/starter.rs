//! Top-level entry point: turns configuration files into blueprints and runs
//! them on a scheduler.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use gym_config::{Device, ExperimentId, RunMode, ValidationMode};
use gym_training::{
    BlueprintError, ComponentFactory, ComponentParams, ComponentRegistry, ExecutionPlan,
    FileStateStore, JobBlueprint, StandardBlueprint, StateStore, StatusSink,
};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

use crate::{
    config::{ConfigError, EvaluationConfig, GridSearchConfig},
    scheduler::{ScheduleResult, Scheduler, SchedulerError},
    state::Ledger,
    status::StatusBroker,
};

/// Name of the grid search config copy kept next to the checkpoints.
pub const GRID_SEARCH_FILE: &str = "grid_search.toml";
/// Name of the evaluation config copy kept next to the checkpoints.
pub const EVALUATION_FILE: &str = "evaluation.toml";
pub const LEDGER_FILE: &str = "ledger.json";

/// Everything a blueprint source needs to expand a grid search.
pub struct BlueprintRequest<'a> {
    pub grid_search_id: &'a str,
    pub validation_mode: ValidationMode,
    pub plan: &'a ExecutionPlan,
    pub grid_search: &'a GridSearchConfig,
    pub evaluation: Option<&'a EvaluationConfig>,
}

/// Expands a grid search into job blueprints.
pub trait BlueprintSource {
    fn create_blueprints(
        &self,
        request: &BlueprintRequest<'_>,
    ) -> Result<Vec<Arc<dyn JobBlueprint>>, ConfigError>;
}

/// Builds one [`StandardBlueprint`] per run, fold, or outer/inner fold pair.
///
/// Experiment ids:
/// - grid search: `<gs_id>/<run>`
/// - cross validation: `<gs_id>/<run>/fold_<i>`
/// - nested cross validation: `<gs_id>/<run>/outer_<i>/inner_<j>`
pub struct ConfigBlueprintSource {
    factory: Arc<dyn ComponentFactory>,
    store: Arc<dyn StateStore>,
}

impl ConfigBlueprintSource {
    #[must_use]
    pub fn new(factory: Arc<dyn ComponentFactory>, store: Arc<dyn StateStore>) -> Self {
        Self { factory, store }
    }

    fn blueprint(
        &self,
        experiment_id: ExperimentId,
        plan: &ExecutionPlan,
        params: ComponentParams,
    ) -> Arc<dyn JobBlueprint> {
        Arc::new(StandardBlueprint::new(
            experiment_id,
            plan.clone(),
            Arc::clone(&self.factory),
            params,
            Arc::clone(&self.store),
        ))
    }
}

impl BlueprintSource for ConfigBlueprintSource {
    fn create_blueprints(
        &self,
        request: &BlueprintRequest<'_>,
    ) -> Result<Vec<Arc<dyn JobBlueprint>>, ConfigError> {
        let evaluation = || {
            request
                .evaluation
                .ok_or(ConfigError::MissingEvaluationConfig(request.validation_mode))
        };

        let mut blueprints = Vec::new();
        for run in &request.grid_search.runs {
            let run_id = ExperimentId::new(request.grid_search_id).join(&run.name);
            let params = ComponentParams::new(run.params.clone());

            match request.validation_mode {
                ValidationMode::GridSearch => {
                    blueprints.push(self.blueprint(run_id, request.plan, params));
                }
                ValidationMode::CrossValidation => {
                    for fold in 0..evaluation()?.num_folds()? {
                        blueprints.push(self.blueprint(
                            run_id.join(format!("fold_{fold}")),
                            request.plan,
                            params.clone().with_fold(fold),
                        ));
                    }
                }
                ValidationMode::NestedCv => {
                    let (outer_folds, inner_folds) = evaluation()?.nested_folds()?;
                    for outer in 0..outer_folds {
                        for inner in 0..inner_folds {
                            blueprints.push(self.blueprint(
                                run_id
                                    .join(format!("outer_{outer}"))
                                    .join(format!("inner_{inner}")),
                                request.plan,
                                params.clone().with_fold(outer).with_inner_fold(inner),
                            ));
                        }
                    }
                }
            }
        }
        Ok(blueprints)
    }
}

/// Arguments of a gym run.
#[derive(Debug, Clone)]
pub struct StarterArgs {
    /// Name of the registered component factory.
    pub blueprint: String,
    pub run_mode: RunMode,
    /// Parsed when the starter is created.
    pub validation_mode: String,
    pub num_epochs: u64,
    pub gs_config: PathBuf,
    pub evaluation_config: Option<PathBuf>,
    pub num_workers: usize,
    pub devices: Vec<Device>,
    pub log_to_file: bool,
    pub log_dir: PathBuf,
    /// Checkpoints, config copies and the run ledger live here.
    pub state_dir: PathBuf,
    /// Epochs to re-evaluate; empty means `1..=num_epochs`.
    pub epochs: Vec<u64>,
    /// Run jobs one after another on the calling thread.
    pub sequential: bool,
}

/// Runs a grid search, cross validation or nested cross validation.
pub struct GymStarter {
    args: StarterArgs,
    validation_mode: ValidationMode,
    grid_search_id: String,
    registry: ComponentRegistry,
}

impl GymStarter {
    /// Validate the arguments and fix the grid search id.
    ///
    /// Training gets a fresh timestamped id. Any other run mode reuses the
    /// name of the directory holding the grid search config, which is where
    /// a training run stores its config copy.
    pub fn new(args: StarterArgs) -> Result<Self, StarterError> {
        let validation_mode: ValidationMode = args
            .validation_mode
            .parse()
            .map_err(ConfigError::InvalidValidationMode)?;

        let grid_search_id = if args.run_mode == RunMode::Train {
            chrono::Local::now().format("%Y-%m-%d--%H-%M-%S").to_string()
        } else {
            args.gs_config
                .parent()
                .and_then(Path::file_name)
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .ok_or_else(|| StarterError::GridSearchId(args.gs_config.clone()))?
        };

        Ok(Self {
            args,
            validation_mode,
            grid_search_id,
            registry: ComponentRegistry::with_builtin(),
        })
    }

    /// Replace the built-in component registry.
    #[must_use]
    pub fn with_registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn grid_search_id(&self) -> &str {
        &self.grid_search_id
    }

    #[must_use]
    pub fn validation_mode(&self) -> ValidationMode {
        self.validation_mode
    }

    #[must_use]
    pub fn args(&self) -> &StarterArgs {
        &self.args
    }

    #[must_use]
    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.args.state_dir.join(LEDGER_FILE))
    }

    /// Directory holding the checkpoints and config copies of this grid search.
    #[must_use]
    pub fn grid_search_dir(&self) -> PathBuf {
        self.args.state_dir.join(&self.grid_search_id)
    }

    /// Daily rolling log file writer for this grid search, if logging to file.
    ///
    /// The guard must be kept alive for as long as logs should be flushed.
    #[must_use]
    pub fn log_writer(&self) -> Option<(NonBlocking, WorkerGuard)> {
        if !self.args.log_to_file {
            return None;
        }
        let appender = tracing_appender::rolling::daily(
            &self.args.log_dir,
            format!("{}.log", self.grid_search_id),
        );
        Some(tracing_appender::non_blocking(appender))
    }

    /// Expand the configuration and run every job to a terminal status.
    ///
    /// `subscribers` receive all status events through a [`StatusBroker`]
    /// that lives for the duration of the run.
    pub async fn start(
        &self,
        subscribers: Vec<Arc<dyn StatusSink>>,
    ) -> Result<Vec<ScheduleResult>, StarterError> {
        let grid_search = GridSearchConfig::load(&self.args.gs_config)?;
        let evaluation = if self.validation_mode.needs_evaluation_config() {
            let path = self
                .args
                .evaluation_config
                .as_ref()
                .ok_or(ConfigError::MissingEvaluationConfig(self.validation_mode))?;
            Some(EvaluationConfig::load(path)?)
        } else {
            None
        };
        let factory = self.registry.get(&self.args.blueprint)?;

        if self.args.run_mode == RunMode::Train {
            self.save_configs()?;
        }

        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&self.args.state_dir));
        let plan = ExecutionPlan::new(self.args.run_mode, self.args.num_epochs, &self.args.epochs);
        let source = ConfigBlueprintSource::new(factory, store);
        let blueprints = source.create_blueprints(&BlueprintRequest {
            grid_search_id: &self.grid_search_id,
            validation_mode: self.validation_mode,
            plan: &plan,
            grid_search: &grid_search,
            evaluation: evaluation.as_ref(),
        })?;

        tracing::info!(
            "Started {} ({}, {}) with {} jobs",
            self.grid_search_id,
            self.validation_mode,
            self.args.run_mode,
            blueprints.len()
        );

        let broker = StatusBroker::start(subscribers);
        let mut scheduler = Scheduler::new(self.args.num_workers, self.args.devices.clone())?
            .with_sink(Arc::new(broker.sink()))
            .with_ledger(self.ledger());
        scheduler.submit(blueprints);

        let results = scheduler.run(!self.args.sequential).await;
        broker.stop().await;
        Ok(results?)
    }

    /// Copy the config files next to the checkpoints so a later re-evaluation
    /// can point at them.
    fn save_configs(&self) -> Result<(), StarterError> {
        let dir = self.grid_search_dir();
        std::fs::create_dir_all(&dir).map_err(|e| StarterError::Io(dir.clone(), e))?;

        let mut copies = vec![(&self.args.gs_config, GRID_SEARCH_FILE)];
        if let Some(path) = &self.args.evaluation_config {
            copies.push((path, EVALUATION_FILE));
        }
        for (source, name) in copies {
            let target = dir.join(name);
            std::fs::copy(source, &target).map_err(|e| StarterError::Io(target, e))?;
        }
        Ok(())
    }
}

/// Errors that stop a gym run before any job starts.
#[derive(Debug, thiserror::Error)]
pub enum StarterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Blueprint(#[from] BlueprintError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("cannot derive a grid search id from {0}")]
    GridSearchId(PathBuf),
    #[error("failed to write {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
