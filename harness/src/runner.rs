//! Execution of a single blueprint on a leased slot.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use gym_training::{JobBlueprint, JobFailure, JobStatus, StatusEvent, StatusSink};

use crate::{
    scheduler::{ScheduleResult, SlotAssignment},
    state::Ledger,
};

/// Builds and executes jobs, reporting status to the sink and the ledger.
///
/// Cheap to clone; each worker gets its own copy.
#[derive(Clone)]
pub struct Runner {
    sink: Arc<dyn StatusSink>,
    ledger: Option<Ledger>,
}

impl Runner {
    #[must_use]
    pub fn new(sink: Arc<dyn StatusSink>, ledger: Option<Ledger>) -> Self {
        Self { sink, ledger }
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn StatusSink> {
        &self.sink
    }

    #[must_use]
    pub fn ledger(&self) -> Option<&Ledger> {
        self.ledger.as_ref()
    }

    /// Construct the job of `blueprint` and run it to a terminal status on `slot`.
    ///
    /// Never panics: construction errors and panics inside the job become a
    /// `Failed` result for this job only.
    #[must_use]
    pub fn run(&self, blueprint: &dyn JobBlueprint, slot: SlotAssignment) -> ScheduleResult {
        let id = blueprint.experiment_id().clone();

        if let Some(ledger) = &self.ledger
            && let Err(e) = ledger.mark_started(&id, slot.worker, slot.device)
        {
            tracing::warn!("Failed to mark {} as started: {}", id, e);
        }
        self.sink.publish(StatusEvent::JobStatus {
            experiment_id: id.clone(),
            status: JobStatus::Running,
            epoch: 0,
        });
        tracing::info!("Dispatched {} to worker {} ({})", id, slot.worker, slot.device);

        let outcome = match catch_unwind(AssertUnwindSafe(|| blueprint.construct())) {
            Ok(Ok(mut job)) => {
                let sink = self.sink.as_ref();
                match catch_unwind(AssertUnwindSafe(|| job.execute(slot.device, sink))) {
                    Ok(Ok(status)) => Ok((status, job.epoch())),
                    Ok(Err(failure)) => Err(failure),
                    Err(panic) => Err(JobFailure::panic(job.epoch(), panic_message(&*panic))),
                }
            }
            Ok(Err(e)) => Err(JobFailure::construct(e.to_string())),
            Err(panic) => Err(JobFailure::panic(0, panic_message(&*panic))),
        };

        let result = match outcome {
            Ok((status, epoch)) => {
                if let Some(ledger) = &self.ledger
                    && let Err(e) = ledger.mark_finished(&id, status, epoch)
                {
                    tracing::warn!("Failed to mark {} as {}: {}", id, status, e);
                }
                ScheduleResult {
                    experiment_id: id,
                    status,
                    slot: Some(slot),
                    epoch,
                    failure: None,
                }
            }
            Err(failure) => {
                tracing::error!("{} failed: {}", id, failure);
                if let Some(ledger) = &self.ledger
                    && let Err(e) = ledger.mark_failed(&id, &failure)
                {
                    tracing::warn!("Failed to mark {} as failed: {}", id, e);
                }
                ScheduleResult::failed(id, Some(slot), failure)
            }
        };

        self.sink.publish(StatusEvent::JobStatus {
            experiment_id: result.experiment_id.clone(),
            status: result.status,
            epoch: result.epoch,
        });
        result
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use gym_config::{Device, ExperimentId};
    use gym_training::{
        BlueprintError, ComponentParams, ExecutionPlan, FailureKind, Job, MemoryStateStore,
        NullStatusSink, StandardBlueprint, quadratic::QuadraticFactory,
    };
    use tempfile::tempdir;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<StatusEvent>>);

    impl StatusSink for Recorder {
        fn publish(&self, event: StatusEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    struct Panicking(ExperimentId);

    impl JobBlueprint for Panicking {
        fn experiment_id(&self) -> &ExperimentId {
            &self.0
        }

        fn construct(&self) -> Result<Box<dyn Job>, BlueprintError> {
            panic!("blueprint exploded")
        }
    }

    fn slot() -> SlotAssignment {
        SlotAssignment {
            worker: 0,
            device: Device::Cpu,
        }
    }

    #[test]
    fn test_run_reports_status_events() {
        let recorder = Arc::new(Recorder::default());
        let runner = Runner::new(recorder.clone(), None);
        let blueprint = StandardBlueprint::new(
            ExperimentId::new("gs/a"),
            ExecutionPlan::Train { num_epochs: 2 },
            Arc::new(QuadraticFactory),
            ComponentParams::default(),
            Arc::new(MemoryStateStore::new()),
        );

        let result = runner.run(&blueprint, slot());

        assert_eq!(result.status, JobStatus::Done);
        assert_eq!(result.epoch, 2);
        let statuses: Vec<JobStatus> = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                StatusEvent::JobStatus { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![JobStatus::Running, JobStatus::Done]);
    }

    #[test]
    fn test_construct_panic_is_contained() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let runner = Runner::new(Arc::new(NullStatusSink), Some(ledger.clone()));

        let result = runner.run(&Panicking(ExperimentId::new("gs/p")), slot());

        assert_eq!(result.status, JobStatus::Failed);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Panic);
        assert!(failure.message.contains("blueprint exploded"));
        assert_eq!(
            ledger.load().unwrap().jobs["gs/p"].status,
            JobStatus::Failed
        );
    }
}
