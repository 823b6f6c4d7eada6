//! The per-job state machine.
//!
//! A [`GymJob`] runs one experiment to a terminal status, either training
//! epoch by epoch with checkpoints (`Train`) or re-scoring the current model
//! over an explicit epoch list (`ReEval`). Resuming is driven entirely by the
//! [`StateStore`]: a job picks up after the last committed epoch.

use std::sync::Arc;

use gym_config::{Device, ExperimentId, RunMode};
use serde::{Deserialize, Serialize};

use crate::{
    component::{ComponentError, Evaluator, Model, Trainer},
    early_stopping::EarlyStopper,
    metrics::EvaluationResults,
    status::{StatusEvent, StatusSink},
    store::{EARLY_STOPPING_KEY, MODEL_KEY, StateStore, StoreError, TRAINER_KEY},
};

/// Execution status of a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Done,
    EarlyStopped,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::EarlyStopped | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::EarlyStopped => write!(f, "early_stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What a job does when executed. Fixed at construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionPlan {
    /// Train up to `num_epochs`, resuming after the last committed epoch.
    Train { num_epochs: u64 },
    /// Evaluate the in-memory model once per listed epoch. Writes no checkpoints.
    ReEval { epochs: Vec<u64> },
}

impl ExecutionPlan {
    /// Build the plan for `run_mode`. `epochs` is only used for `ReEval`
    /// and defaults to `1..=num_epochs` when empty.
    #[must_use]
    pub fn new(run_mode: RunMode, num_epochs: u64, epochs: &[u64]) -> Self {
        match run_mode {
            RunMode::Train => Self::Train { num_epochs },
            RunMode::ReEval if epochs.is_empty() => Self::ReEval {
                epochs: (1..=num_epochs).collect(),
            },
            RunMode::ReEval => Self::ReEval {
                epochs: epochs.to_vec(),
            },
        }
    }

    #[must_use]
    pub fn run_mode(&self) -> RunMode {
        match self {
            Self::Train { .. } => RunMode::Train,
            Self::ReEval { .. } => RunMode::ReEval,
        }
    }

    /// Epoch count used for progress reporting.
    #[must_use]
    pub fn total_epochs(&self) -> u64 {
        match self {
            Self::Train { num_epochs } => *num_epochs,
            Self::ReEval { epochs } => epochs.len() as u64,
        }
    }
}

/// The components a job is assembled from. Owned exclusively by the job.
pub struct JobComponents<M: Model> {
    pub model: M,
    pub trainer: Box<dyn Trainer<M>>,
    pub evaluator: Box<dyn Evaluator<M>>,
    pub early_stopper: Option<Box<dyn EarlyStopper>>,
}

/// Object-safe view of a job, independent of its model type.
pub trait Job: Send {
    fn experiment_id(&self) -> &ExperimentId;

    fn status(&self) -> JobStatus;

    fn plan(&self) -> &ExecutionPlan;

    /// Last epoch reached by the most recent execution.
    fn epoch(&self) -> u64;

    /// Run to a terminal status on `device`.
    ///
    /// Returns `Done` or `EarlyStopped`; a failure carries the epoch it
    /// occurred at. Re-executing with the same store resumes.
    fn execute(&mut self, device: Device, sink: &dyn StatusSink) -> Result<JobStatus, JobFailure>;
}

pub struct GymJob<M: Model> {
    experiment_id: ExperimentId,
    plan: ExecutionPlan,
    components: JobComponents<M>,
    store: Arc<dyn StateStore>,
    status: JobStatus,
    epoch: u64,
}

impl<M: Model> GymJob<M> {
    #[must_use]
    pub fn new(
        experiment_id: ExperimentId,
        plan: ExecutionPlan,
        components: JobComponents<M>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            experiment_id,
            plan,
            components,
            store,
            status: JobStatus::Pending,
            epoch: 0,
        }
    }

    #[must_use]
    pub fn model(&self) -> &M {
        &self.components.model
    }

    fn publish_evaluation(&self, sink: &dyn StatusSink, epoch: u64, results: &EvaluationResults) {
        sink.publish(StatusEvent::Evaluation {
            experiment_id: self.experiment_id.clone(),
            epoch,
            results: results.clone(),
        });
    }

    fn publish_progress(&self, sink: &dyn StatusSink, epoch: u64, num_epochs: u64) {
        sink.publish(StatusEvent::Progress {
            experiment_id: self.experiment_id.clone(),
            epoch,
            num_epochs,
        });
    }

    /// Evaluate the untrained model and persist it as epoch 0.
    fn run_baseline(&mut self, device: Device, sink: &dyn StatusSink) -> Result<(), JobError> {
        let id = &self.experiment_id;
        let c = &mut self.components;

        c.model.to_device(device)?;
        let results = c.evaluator.evaluate(&c.model, device)?;
        self.store.log_measurement_result(&results, id, 0)?;
        self.store
            .save(MODEL_KEY, id, &c.model.get_state()?, &results, 0)?;
        self.store.commit_epoch(id, 0)?;
        tracing::debug!("{} baseline checkpoint written", id);

        self.publish_evaluation(sink, 0, &results);
        Ok(())
    }

    /// Restore components from the checkpoint at `last_epoch`.
    ///
    /// Returns `false` when the early stopping criterion already fired at
    /// `last_epoch`, i.e. its state was never written.
    fn restore(&mut self, last_epoch: u64) -> Result<bool, JobError> {
        let id = &self.experiment_id;
        let c = &mut self.components;

        c.model
            .set_state(self.store.load(MODEL_KEY, id, last_epoch)?)?;
        c.trainer
            .set_state(self.store.load(TRAINER_KEY, id, last_epoch)?)?;

        if let Some(early_stopper) = c.early_stopper.as_mut() {
            if !self.store.contains(EARLY_STOPPING_KEY, id, last_epoch)? {
                return Ok(false);
            }
            early_stopper.set_state(self.store.load(EARLY_STOPPING_KEY, id, last_epoch)?)?;
        }
        tracing::info!("Resuming {} after epoch {}", id, last_epoch);
        Ok(true)
    }

    fn run_train(
        &mut self,
        num_epochs: u64,
        device: Device,
        sink: &dyn StatusSink,
        epoch: &mut u64,
    ) -> Result<JobStatus, JobError> {
        let last_epoch = self.store.last_epoch(&self.experiment_id)?;
        *epoch = last_epoch;

        if last_epoch == 0 {
            self.run_baseline(device, sink)?;
        } else if !self.restore(last_epoch)? {
            tracing::info!(
                "{} already early stopped at epoch {}",
                self.experiment_id,
                last_epoch
            );
            return Ok(JobStatus::EarlyStopped);
        }

        self.components.trainer.set_num_epochs(num_epochs);
        self.components.trainer.set_current_epoch(last_epoch + 1);

        while !self.components.trainer.is_done() {
            let current = self.components.trainer.current_epoch();
            *epoch = current;

            let id = &self.experiment_id;
            let c = &mut self.components;

            c.model.to_device(device)?;
            c.trainer.train_epoch(&mut c.model, device)?;
            let results = c.evaluator.evaluate(&c.model, device)?;

            self.store
                .save(MODEL_KEY, id, &c.model.get_state()?, &results, current)?;
            self.store
                .save(TRAINER_KEY, id, &c.trainer.get_state()?, &results, current)?;
            self.store.log_measurement_result(&results, id, current)?;

            let mut stopped = false;
            if let Some(early_stopper) = c.early_stopper.as_mut() {
                if early_stopper.is_stopping_criterion_fulfilled(&results, current)? {
                    stopped = true;
                } else {
                    self.store.save(
                        EARLY_STOPPING_KEY,
                        id,
                        &early_stopper.get_state()?,
                        &results,
                        current,
                    )?;
                }
            }
            self.store.commit_epoch(id, current)?;
            tracing::debug!("{} committed epoch {}", id, current);

            self.publish_evaluation(sink, current, &results);
            self.publish_progress(sink, current, num_epochs);

            if stopped {
                tracing::info!("{} early stopped at epoch {}", self.experiment_id, current);
                return Ok(JobStatus::EarlyStopped);
            }
        }

        Ok(JobStatus::Done)
    }

    fn run_re_eval(
        &mut self,
        epochs: &[u64],
        device: Device,
        sink: &dyn StatusSink,
        epoch: &mut u64,
    ) -> Result<JobStatus, JobError> {
        let total = epochs.len() as u64;
        for (i, &current) in epochs.iter().enumerate() {
            *epoch = current;
            let c = &mut self.components;
            c.model.to_device(device)?;
            let results = c.evaluator.evaluate(&c.model, device)?;
            self.store
                .log_re_eval_result(&results, &self.experiment_id, current)?;

            self.publish_evaluation(sink, current, &results);
            self.publish_progress(sink, i as u64 + 1, total);
        }
        Ok(JobStatus::Done)
    }
}

impl<M: Model> Job for GymJob<M> {
    fn experiment_id(&self) -> &ExperimentId {
        &self.experiment_id
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn execute(&mut self, device: Device, sink: &dyn StatusSink) -> Result<JobStatus, JobFailure> {
        self.status = JobStatus::Running;
        tracing::info!(
            "Started {} ({}) on {}",
            self.experiment_id,
            self.plan.run_mode(),
            device
        );

        let mut epoch = 0;
        let plan = self.plan.clone();
        let result = match &plan {
            ExecutionPlan::Train { num_epochs } => {
                self.run_train(*num_epochs, device, sink, &mut epoch)
            }
            ExecutionPlan::ReEval { epochs } => self.run_re_eval(epochs, device, sink, &mut epoch),
        };
        self.epoch = epoch;

        match result {
            Ok(status) => {
                self.status = status;
                tracing::info!("Finished {} ({})", self.experiment_id, status);
                Ok(status)
            }
            Err(e) => {
                self.status = JobStatus::Failed;
                tracing::error!("{} failed at epoch {}: {}", self.experiment_id, epoch, e);
                Err(JobFailure::new(&e, epoch))
            }
        }
    }
}

/// Category of a job failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Train, evaluate or early stopping step raised an error.
    Step,
    /// Reading or writing a checkpoint failed.
    Checkpoint,
    /// The blueprint could not build the job.
    Construct,
    /// The worker executing the job panicked.
    Panic,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step => write!(f, "step"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Construct => write!(f, "construct"),
            Self::Panic => write!(f, "panic"),
        }
    }
}

/// A failure reported upward by a job, with the epoch it occurred at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} failure at epoch {epoch}: {message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub epoch: u64,
    pub message: String,
}

impl JobFailure {
    fn new(error: &JobError, epoch: u64) -> Self {
        let kind = match error {
            JobError::Component(_) => FailureKind::Step,
            JobError::Store(_) => FailureKind::Checkpoint,
        };
        Self {
            kind,
            epoch,
            message: error.to_string(),
        }
    }

    #[must_use]
    pub fn construct(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Construct,
            epoch: 0,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn panic(epoch: u64, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panic,
            epoch,
            message: message.into(),
        }
    }
}

/// Errors that can occur while executing a job step.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::{
        component::{Checkpointable, EpochCounter, StateSnapshot},
        metrics::{EvaluationBatchResult, MeasurementRecord},
        status::NullStatusSink,
        store::MemoryStateStore,
    };

    struct Scalar {
        value: f64,
    }

    impl Checkpointable for Scalar {
        fn get_state(&self) -> Result<StateSnapshot, ComponentError> {
            Ok(json!({ "value": self.value }))
        }

        fn set_state(&mut self, state: StateSnapshot) -> Result<(), ComponentError> {
            self.value = state["value"]
                .as_f64()
                .ok_or_else(|| ComponentError::InvalidState("missing value".into()))?;
            Ok(())
        }
    }

    impl Model for Scalar {
        fn to_device(&mut self, _device: Device) -> Result<(), ComponentError> {
            Ok(())
        }
    }

    struct Halving {
        counter: EpochCounter,
        fail_at: Option<u64>,
    }

    impl Checkpointable for Halving {
        fn get_state(&self) -> Result<StateSnapshot, ComponentError> {
            Ok(serde_json::to_value(self.counter)?)
        }

        fn set_state(&mut self, state: StateSnapshot) -> Result<(), ComponentError> {
            self.counter = serde_json::from_value(state)?;
            Ok(())
        }
    }

    impl Trainer<Scalar> for Halving {
        fn train_epoch(&mut self, model: &mut Scalar, device: Device) -> Result<(), ComponentError> {
            if self.fail_at == Some(self.counter.current_epoch) {
                return Err(ComponentError::Device(device, "out of memory".into()));
            }
            model.value *= 0.5;
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

    struct ValueAsLoss;

    impl Evaluator<Scalar> for ValueAsLoss {
        fn evaluate(
            &mut self,
            model: &Scalar,
            _device: Device,
        ) -> Result<EvaluationResults, ComponentError> {
            Ok(EvaluationResults(vec![
                EvaluationBatchResult::new("val").with_loss("loss", model.value),
            ]))
        }
    }

    struct StopAt {
        epoch: u64,
        checks: u64,
    }

    impl Checkpointable for StopAt {
        fn get_state(&self) -> Result<StateSnapshot, ComponentError> {
            Ok(json!({ "checks": self.checks }))
        }

        fn set_state(&mut self, state: StateSnapshot) -> Result<(), ComponentError> {
            self.checks = state["checks"].as_u64().unwrap_or(0);
            Ok(())
        }
    }

    impl EarlyStopper for StopAt {
        fn is_stopping_criterion_fulfilled(
            &mut self,
            _results: &EvaluationResults,
            epoch: u64,
        ) -> Result<bool, ComponentError> {
            self.checks += 1;
            Ok(epoch == self.epoch)
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<StatusEvent>>);

    impl StatusSink for RecordingSink {
        fn publish(&self, event: StatusEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    /// Fails every `save` of `key` at `epoch`.
    struct FlakyStore {
        inner: MemoryStateStore,
        key: &'static str,
        epoch: u64,
    }

    impl StateStore for FlakyStore {
        fn save(
            &self,
            key: &str,
            experiment_id: &ExperimentId,
            state: &StateSnapshot,
            metrics: &EvaluationResults,
            epoch: u64,
        ) -> Result<(), StoreError> {
            if key == self.key && epoch == self.epoch {
                return Err(StoreError::Write("disk".into(), "no space left".into()));
            }
            self.inner.save(key, experiment_id, state, metrics, epoch)
        }

        fn load(&self, key: &str, id: &ExperimentId, epoch: u64) -> Result<StateSnapshot, StoreError> {
            self.inner.load(key, id, epoch)
        }

        fn contains(&self, key: &str, id: &ExperimentId, epoch: u64) -> Result<bool, StoreError> {
            self.inner.contains(key, id, epoch)
        }

        fn commit_epoch(&self, id: &ExperimentId, epoch: u64) -> Result<(), StoreError> {
            self.inner.commit_epoch(id, epoch)
        }

        fn last_epoch(&self, id: &ExperimentId) -> Result<u64, StoreError> {
            self.inner.last_epoch(id)
        }

        fn log_measurement_result(
            &self,
            results: &EvaluationResults,
            id: &ExperimentId,
            epoch: u64,
        ) -> Result<(), StoreError> {
            self.inner.log_measurement_result(results, id, epoch)
        }

        fn measurements(&self, id: &ExperimentId) -> Result<Vec<MeasurementRecord>, StoreError> {
            self.inner.measurements(id)
        }

        fn log_re_eval_result(
            &self,
            results: &EvaluationResults,
            id: &ExperimentId,
            epoch: u64,
        ) -> Result<(), StoreError> {
            self.inner.log_re_eval_result(results, id, epoch)
        }

        fn re_eval_measurements(
            &self,
            id: &ExperimentId,
        ) -> Result<Vec<MeasurementRecord>, StoreError> {
            self.inner.re_eval_measurements(id)
        }
    }

    fn job(
        plan: ExecutionPlan,
        store: Arc<dyn StateStore>,
        stop_at: Option<u64>,
        fail_at: Option<u64>,
    ) -> GymJob<Scalar> {
        GymJob::new(
            ExperimentId::new("gs/run"),
            plan,
            JobComponents {
                model: Scalar { value: 8.0 },
                trainer: Box::new(Halving {
                    counter: EpochCounter::default(),
                    fail_at,
                }),
                evaluator: Box::new(ValueAsLoss),
                early_stopper: stop_at
                    .map(|epoch| Box::new(StopAt { epoch, checks: 0 }) as Box<dyn EarlyStopper>),
            },
            store,
        )
    }

    fn measured_epochs(store: &dyn StateStore) -> Vec<u64> {
        store
            .measurements(&ExperimentId::new("gs/run"))
            .unwrap()
            .iter()
            .map(|m| m.epoch)
            .collect()
    }

    fn written(store: &MemoryStateStore) -> Vec<(String, u64)> {
        store
            .writes(&ExperimentId::new("gs/run"))
            .unwrap()
            .into_iter()
            .map(|w| (w.key, w.epoch))
            .collect()
    }

    #[test]
    fn test_train_budget_three() {
        let store = Arc::new(MemoryStateStore::new());
        let mut job = job(ExecutionPlan::Train { num_epochs: 3 }, store.clone(), None, None);

        let status = job.execute(Device::Cpu, &NullStatusSink).unwrap();

        assert_eq!(status, JobStatus::Done);
        assert_eq!(job.status(), JobStatus::Done);
        assert_eq!(job.epoch(), 3);
        assert!(job.components.trainer.is_done());
        assert_eq!(job.components.trainer.current_epoch(), 4);
        assert_eq!(measured_epochs(store.as_ref()), vec![0, 1, 2, 3]);
        assert_eq!(
            written(&store),
            vec![
                ("model".to_string(), 0),
                ("model".to_string(), 1),
                ("trainer".to_string(), 1),
                ("model".to_string(), 2),
                ("trainer".to_string(), 2),
                ("model".to_string(), 3),
                ("trainer".to_string(), 3),
            ]
        );
        assert_eq!(store.last_epoch(&ExperimentId::new("gs/run")).unwrap(), 3);
    }

    #[test]
    fn test_early_stop_skips_stopper_checkpoint() {
        let store = Arc::new(MemoryStateStore::new());
        let id = ExperimentId::new("gs/run");
        let mut job = job(ExecutionPlan::Train { num_epochs: 5 }, store.clone(), Some(2), None);

        let status = job.execute(Device::Cpu, &NullStatusSink).unwrap();

        assert_eq!(status, JobStatus::EarlyStopped);
        assert_eq!(measured_epochs(store.as_ref()), vec![0, 1, 2]);
        assert!(store.contains(EARLY_STOPPING_KEY, &id, 1).unwrap());
        assert!(!store.contains(EARLY_STOPPING_KEY, &id, 2).unwrap());
        assert!(store.contains(MODEL_KEY, &id, 2).unwrap());
        assert!(store.contains(TRAINER_KEY, &id, 2).unwrap());
        assert_eq!(store.last_epoch(&id).unwrap(), 2);
    }

    #[test]
    fn test_resume_after_early_stop_does_not_retrigger() {
        let store = Arc::new(MemoryStateStore::new());
        job(ExecutionPlan::Train { num_epochs: 5 }, store.clone(), Some(2), None)
            .execute(Device::Cpu, &NullStatusSink)
            .unwrap();
        let writes_before = written(&store).len();

        // The stopper would never fire again; the job must still stop.
        let mut resumed = job(ExecutionPlan::Train { num_epochs: 5 }, store.clone(), Some(99), None);
        let status = resumed.execute(Device::Cpu, &NullStatusSink).unwrap();

        assert_eq!(status, JobStatus::EarlyStopped);
        assert_eq!(written(&store).len(), writes_before);
        assert_eq!(measured_epochs(store.as_ref()), vec![0, 1, 2]);
    }

    #[test]
    fn test_re_eval_explicit_epochs() {
        let store = Arc::new(MemoryStateStore::new());
        let mut job = job(
            ExecutionPlan::ReEval {
                epochs: vec![1, 3, 5],
            },
            store.clone(),
            None,
            None,
        );

        let status = job.execute(Device::Cpu, &NullStatusSink).unwrap();

        assert_eq!(status, JobStatus::Done);
        let id = ExperimentId::new("gs/run");
        let re_evals: Vec<u64> = store
            .re_eval_measurements(&id)
            .unwrap()
            .iter()
            .map(|m| m.epoch)
            .collect();
        assert_eq!(re_evals, vec![1, 3, 5]);
        assert!(measured_epochs(store.as_ref()).is_empty());
        assert!(written(&store).is_empty());
        assert_eq!(store.last_epoch(&id).unwrap(), 0);
    }

    #[test]
    fn test_re_eval_leaves_training_measurements() {
        let store = Arc::new(MemoryStateStore::new());
        let id = ExperimentId::new("gs/run");
        let mut train = job(ExecutionPlan::Train { num_epochs: 3 }, store.clone(), None, None);
        train.execute(Device::Cpu, &NullStatusSink).unwrap();
        let trained = store.measurements(&id).unwrap();

        let mut re_eval = job(
            ExecutionPlan::ReEval { epochs: vec![1, 3] },
            store.clone(),
            None,
            None,
        );
        re_eval.execute(Device::Cpu, &NullStatusSink).unwrap();

        assert_eq!(store.measurements(&id).unwrap(), trained);
        assert_eq!(store.re_eval_measurements(&id).unwrap().len(), 2);
        assert_eq!(store.last_epoch(&id).unwrap(), 3);
    }

    #[test]
    fn test_zero_budget_runs_baseline_only() {
        let store = Arc::new(MemoryStateStore::new());
        let mut job = job(ExecutionPlan::Train { num_epochs: 0 }, store.clone(), Some(1), None);

        assert_eq!(job.execute(Device::Cpu, &NullStatusSink).unwrap(), JobStatus::Done);
        assert_eq!(measured_epochs(store.as_ref()), vec![0]);
        assert_eq!(written(&store), vec![("model".to_string(), 0)]);
    }

    #[test]
    fn test_resume_at_budget_is_done_immediately() {
        let store = Arc::new(MemoryStateStore::new());
        job(ExecutionPlan::Train { num_epochs: 2 }, store.clone(), None, None)
            .execute(Device::Cpu, &NullStatusSink)
            .unwrap();
        let writes_before = written(&store).len();

        let mut resumed = job(ExecutionPlan::Train { num_epochs: 2 }, store.clone(), None, None);
        assert_eq!(
            resumed.execute(Device::Cpu, &NullStatusSink).unwrap(),
            JobStatus::Done
        );
        assert_eq!(written(&store).len(), writes_before);
        assert_eq!(measured_epochs(store.as_ref()), vec![0, 1, 2]);
        assert!((resumed.model().value - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_step_failure_then_resume_matches_uninterrupted_run() {
        let store = Arc::new(MemoryStateStore::new());
        let id = ExperimentId::new("gs/run");
        let mut failing = job(ExecutionPlan::Train { num_epochs: 3 }, store.clone(), None, Some(2));

        let failure = failing.execute(Device::Cuda(0), &NullStatusSink).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Step);
        assert_eq!(failure.epoch, 2);
        assert!(failure.message.contains("cuda:0"));
        assert_eq!(failing.status(), JobStatus::Failed);
        assert_eq!(store.last_epoch(&id).unwrap(), 1);

        let mut resumed = job(ExecutionPlan::Train { num_epochs: 3 }, store.clone(), None, None);
        assert_eq!(
            resumed.execute(Device::Cpu, &NullStatusSink).unwrap(),
            JobStatus::Done
        );
        assert_eq!(measured_epochs(store.as_ref()), vec![0, 1, 2, 3]);

        let fresh_store = Arc::new(MemoryStateStore::new());
        let mut uninterrupted = job(ExecutionPlan::Train { num_epochs: 3 }, fresh_store, None, None);
        uninterrupted.execute(Device::Cpu, &NullStatusSink).unwrap();
        assert_eq!(
            resumed.model().get_state().unwrap(),
            uninterrupted.model().get_state().unwrap()
        );
    }

    #[test]
    fn test_checkpoint_failure_leaves_epoch_uncommitted() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStateStore::new(),
            key: TRAINER_KEY,
            epoch: 2,
        });
        let id = ExperimentId::new("gs/run");
        let mut job = job(ExecutionPlan::Train { num_epochs: 3 }, store.clone(), None, None);

        let failure = job.execute(Device::Cpu, &NullStatusSink).unwrap_err();

        assert_eq!(failure.kind, FailureKind::Checkpoint);
        assert_eq!(failure.epoch, 2);
        // The model checkpoint for epoch 2 landed but the epoch is not complete.
        assert!(store.contains(MODEL_KEY, &id, 2).unwrap());
        assert_eq!(store.last_epoch(&id).unwrap(), 1);
    }

    #[test]
    fn test_events_published() {
        let store = Arc::new(MemoryStateStore::new());
        let sink = RecordingSink::default();
        job(ExecutionPlan::Train { num_epochs: 2 }, store, None, None)
            .execute(Device::Cpu, &sink)
            .unwrap();

        let events = sink.0.lock().unwrap();
        let progress: Vec<(u64, u64)> = events
            .iter()
            .filter_map(|e| match e {
                StatusEvent::Progress {
                    epoch, num_epochs, ..
                } => Some((*epoch, *num_epochs)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
        let evaluations = events
            .iter()
            .filter(|e| matches!(e, StatusEvent::Evaluation { .. }))
            .count();
        assert_eq!(evaluations, 3);
    }

    #[test]
    fn test_execution_plan_from_run_mode() {
        assert_eq!(
            ExecutionPlan::new(RunMode::Train, 4, &[1]),
            ExecutionPlan::Train { num_epochs: 4 }
        );
        assert_eq!(
            ExecutionPlan::new(RunMode::ReEval, 3, &[]),
            ExecutionPlan::ReEval {
                epochs: vec![1, 2, 3]
            }
        );
        assert_eq!(
            ExecutionPlan::new(RunMode::ReEval, 3, &[2, 7]).run_mode(),
            RunMode::ReEval
        );
    }
}
