//! Scheduling of jobs onto a fixed pool of worker slots.

use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    sync::Arc,
};

use gym_config::{Device, ExperimentId};
use gym_training::{
    BlueprintError, JobBlueprint, JobFailure, JobStatus, NullStatusSink, StatusEvent, StatusSink,
};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    runner::Runner,
    state::{Ledger, StateError},
};

/// A worker index paired with the device it runs a job on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotAssignment {
    pub worker: usize,
    pub device: Device,
}

/// Free workers and devices of a scheduler.
///
/// Devices are handed out round-robin. Accelerators are leased to one job
/// at a time while the CPU is shared, so a pool over `n` distinct
/// accelerators and no CPU never has more than `n` slots out.
#[derive(Debug)]
pub struct SlotPool {
    devices: Vec<Device>,
    free_workers: BTreeSet<usize>,
    leased_devices: HashSet<Device>,
    cursor: usize,
    capacity: usize,
    leased: usize,
}

impl SlotPool {
    /// An empty device list means CPU only.
    #[must_use]
    pub fn new(num_workers: usize, devices: &[Device]) -> Self {
        let devices = if devices.is_empty() {
            vec![Device::Cpu]
        } else {
            devices.to_vec()
        };

        let capacity = if devices.iter().any(|d| !d.is_exclusive()) {
            num_workers
        } else {
            let distinct: HashSet<_> = devices.iter().collect();
            num_workers.min(distinct.len())
        };

        Self {
            devices,
            free_workers: (0..num_workers).collect(),
            leased_devices: HashSet::new(),
            cursor: 0,
            capacity,
            leased: 0,
        }
    }

    /// Maximum number of slots leased at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Number of slots currently leased.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.leased
    }

    /// Lease the lowest free worker and the next available device.
    pub fn lease(&mut self) -> Option<SlotAssignment> {
        let worker = *self.free_workers.first()?;

        for offset in 0..self.devices.len() {
            let index = (self.cursor + offset) % self.devices.len();
            let device = self.devices[index];
            if device.is_exclusive() && self.leased_devices.contains(&device) {
                continue;
            }

            self.cursor = (index + 1) % self.devices.len();
            self.free_workers.remove(&worker);
            if device.is_exclusive() {
                self.leased_devices.insert(device);
            }
            self.leased += 1;
            return Some(SlotAssignment { worker, device });
        }

        None
    }

    pub fn release(&mut self, slot: SlotAssignment) {
        if self.free_workers.insert(slot.worker) {
            self.leased -= 1;
        }
        if slot.device.is_exclusive() {
            self.leased_devices.remove(&slot.device);
        }
    }
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResult {
    pub experiment_id: ExperimentId,
    pub status: JobStatus,
    /// Slot the job ran on, if it got that far.
    pub slot: Option<SlotAssignment>,
    /// Last epoch reached.
    pub epoch: u64,
    pub failure: Option<JobFailure>,
}

impl ScheduleResult {
    #[must_use]
    pub fn failed(
        experiment_id: ExperimentId,
        slot: Option<SlotAssignment>,
        failure: JobFailure,
    ) -> Self {
        Self {
            experiment_id,
            status: JobStatus::Failed,
            slot,
            epoch: failure.epoch,
            failure: Some(failure),
        }
    }
}

/// Counts of terminal statuses over a set of results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleSummary {
    pub total: usize,
    pub done: usize,
    pub early_stopped: usize,
    pub failed: usize,
}

impl ScheduleSummary {
    #[must_use]
    pub fn from_results(results: &[ScheduleResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match result.status {
                JobStatus::Done => summary.done += 1,
                JobStatus::EarlyStopped => summary.early_stopped += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Pending | JobStatus::Running => {}
            }
        }
        summary
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.done + self.early_stopped == self.total
    }
}

struct Completion {
    index: usize,
    slot: SlotAssignment,
    result: ScheduleResult,
}

/// Dispatches submitted jobs onto worker slots and collects their results.
pub struct Scheduler {
    num_workers: usize,
    devices: Vec<Device>,
    pending: Vec<Arc<dyn JobBlueprint>>,
    sink: Arc<dyn StatusSink>,
    ledger: Option<Ledger>,
}

impl Scheduler {
    pub fn new(num_workers: usize, devices: Vec<Device>) -> Result<Self, SchedulerError> {
        if num_workers == 0 {
            return Err(SchedulerError::Config(
                "number of workers must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            num_workers,
            devices,
            pending: Vec::new(),
            sink: Arc::new(NullStatusSink),
            ledger: None,
        })
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Number of jobs submitted and not yet run.
    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue blueprints for the next [`Scheduler::run`], in order.
    pub fn submit(&mut self, blueprints: impl IntoIterator<Item = Arc<dyn JobBlueprint>>) {
        for blueprint in blueprints {
            self.sink.publish(StatusEvent::JobStatus {
                experiment_id: blueprint.experiment_id().clone(),
                status: JobStatus::Pending,
                epoch: 0,
            });
            self.pending.push(blueprint);
        }
    }

    /// Run every submitted job to a terminal status.
    ///
    /// Results come back in submission order. Job failures are reported in
    /// the results; an `Err` means nothing was started.
    pub async fn run(&mut self, parallel: bool) -> Result<Vec<ScheduleResult>, SchedulerError> {
        if !parallel {
            return self.run_sequential();
        }

        let blueprints = self.prepare()?;
        let ids: Vec<ExperimentId> = blueprints
            .iter()
            .map(|b| b.experiment_id().clone())
            .collect();
        let runner = Runner::new(self.sink.clone(), self.ledger.clone());
        let mut pool = SlotPool::new(self.num_workers, &self.devices);
        tracing::info!(
            "Scheduling {} jobs on {} slots ({} workers, devices: {:?})",
            blueprints.len(),
            pool.capacity(),
            self.num_workers,
            pool.devices()
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let mut queue: VecDeque<(usize, Arc<dyn JobBlueprint>)> =
            blueprints.into_iter().enumerate().collect();
        let mut results: Vec<Option<ScheduleResult>> = vec![None; ids.len()];
        let mut running = 0;

        loop {
            // Fill free slots in submission order
            while let Some((index, blueprint)) = queue.pop_front() {
                let Some(slot) = pool.lease() else {
                    queue.push_front((index, blueprint));
                    break;
                };
                running += 1;
                spawn_worker(index, blueprint, slot, runner.clone(), tx.clone());
            }

            if running == 0 {
                break;
            }

            let Some(completion) = rx.recv().await else {
                break;
            };
            running -= 1;
            pool.release(completion.slot);
            tracing::debug!(
                "{} released worker {} ({})",
                completion.result.experiment_id,
                completion.slot.worker,
                completion.slot.device
            );
            results[completion.index] = Some(completion.result);
        }

        Ok(collect_results(results, ids))
    }

    /// Run every submitted job on the calling thread, one after another.
    pub fn run_sequential(&mut self) -> Result<Vec<ScheduleResult>, SchedulerError> {
        let blueprints = self.prepare()?;
        let runner = Runner::new(self.sink.clone(), self.ledger.clone());
        let mut pool = SlotPool::new(1, &self.devices);
        tracing::info!("Running {} jobs sequentially", blueprints.len());

        let mut results = Vec::with_capacity(blueprints.len());
        for blueprint in blueprints {
            let Some(slot) = pool.lease() else {
                // A single worker is always free here.
                return Err(SchedulerError::Config("no free slot".to_string()));
            };
            results.push(runner.run(blueprint.as_ref(), slot));
            pool.release(slot);
        }
        Ok(results)
    }

    /// Take the pending jobs, validate them and register them in the ledger.
    fn prepare(&mut self) -> Result<Vec<Arc<dyn JobBlueprint>>, SchedulerError> {
        let blueprints = std::mem::take(&mut self.pending);

        let mut seen = HashSet::new();
        for blueprint in &blueprints {
            let id = blueprint.experiment_id();
            if !seen.insert(id.clone()) {
                return Err(SchedulerError::DuplicateExperiment(id.clone()));
            }
            blueprint
                .validate()
                .map_err(|source| SchedulerError::Blueprint {
                    experiment_id: id.clone(),
                    source,
                })?;
        }

        if let Some(ledger) = &self.ledger {
            let crashed = ledger.recover_crashed_runs()?;
            if !crashed.is_empty() {
                tracing::info!("Recovered {} crashed runs: {:?}", crashed.len(), crashed);
            }
            let ids: Vec<ExperimentId> = blueprints
                .iter()
                .map(|b| b.experiment_id().clone())
                .collect();
            ledger.initialize_jobs(&ids)?;
        }

        Ok(blueprints)
    }
}

fn spawn_worker(
    index: usize,
    blueprint: Arc<dyn JobBlueprint>,
    slot: SlotAssignment,
    runner: Runner,
    tx: mpsc::UnboundedSender<Completion>,
) {
    tokio::spawn(async move {
        let id = blueprint.experiment_id().clone();
        let worker = runner.clone();
        let outcome =
            tokio::task::spawn_blocking(move || worker.run(blueprint.as_ref(), slot)).await;

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let failure = JobFailure::panic(0, format!("worker task failed: {e}"));
                tracing::error!("{} failed: {}", id, failure);
                runner.sink().publish(StatusEvent::JobStatus {
                    experiment_id: id.clone(),
                    status: JobStatus::Failed,
                    epoch: 0,
                });
                ScheduleResult::failed(id, Some(slot), failure)
            }
        };

        let _ = tx.send(Completion {
            index,
            slot,
            result,
        });
    });
}

fn collect_results(
    results: Vec<Option<ScheduleResult>>,
    ids: Vec<ExperimentId>,
) -> Vec<ScheduleResult> {
    results
        .into_iter()
        .zip(ids)
        .map(|(result, id)| {
            result.unwrap_or_else(|| {
                ScheduleResult::failed(id, None, JobFailure::panic(0, "worker never reported"))
            })
        })
        .collect()
}

/// Errors that abort a scheduler run before any job starts.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    Config(String),
    #[error("experiment {0} was submitted more than once")]
    DuplicateExperiment(ExperimentId),
    #[error("invalid blueprint for {experiment_id}: {source}")]
    Blueprint {
        experiment_id: ExperimentId,
        source: BlueprintError,
    },
    #[error(transparent)]
    State(#[from] StateError),
}
