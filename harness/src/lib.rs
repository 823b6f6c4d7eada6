#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]

//! Gym harness
//!
//! Expands grid searches into jobs, runs them on a fixed pool of worker
//! slots, mirrors their status into a run ledger and reports live progress.

pub mod config;
pub mod runner;
pub mod scheduler;
pub mod starter;
pub mod state;
pub mod status;

pub use config::{ConfigError, EvaluationConfig, GridSearchConfig, RunConfig};
pub use runner::Runner;
pub use scheduler::{
    ScheduleResult, ScheduleSummary, Scheduler, SchedulerError, SlotAssignment, SlotPool,
};
pub use starter::{
    BlueprintRequest, BlueprintSource, ConfigBlueprintSource, GymStarter, StarterArgs,
    StarterError,
};
pub use state::{JobRecord, Ledger, LedgerState, StateError};
pub use status::{BrokerSink, ProgressBoard, StatusBroker};
