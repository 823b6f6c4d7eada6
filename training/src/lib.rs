#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions
)]

pub mod blueprint;
pub mod component;
pub mod early_stopping;
pub mod job;
pub mod metrics;
pub mod quadratic;
pub mod status;
pub mod store;

pub use blueprint::{
    BlueprintError, ComponentFactory, ComponentParams, ComponentRegistry, JobBlueprint,
    StandardBlueprint, load_trained_model,
};
pub use component::{
    Checkpointable, ComponentError, EpochCounter, Evaluator, Model, StateSnapshot, Trainer,
};
pub use early_stopping::EarlyStopper;
pub use job::{
    ExecutionPlan, FailureKind, GymJob, Job, JobComponents, JobError, JobFailure, JobStatus,
};
pub use metrics::{EvaluationBatchResult, EvaluationResults, MeasurementRecord};
pub use status::{NullStatusSink, StatusEvent, StatusSink, TracingStatusSink};
pub use store::{FileStateStore, MemoryStateStore, StateStore, StoreError};
