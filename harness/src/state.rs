//! Persistent run ledger.
//!
//! Mirrors the status of every job of a harness run into a JSON file so the
//! `status` and `reset` commands can inspect it, and so jobs left `running`
//! by a dead harness process can be detected. Resume itself never reads the
//! ledger; it relies on the checkpoint store only.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use gym_config::{Device, ExperimentId};
use gym_training::{JobFailure, JobStatus};
use serde::{Deserialize, Serialize};

/// Ledger entry of one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRecord {
    pub status: JobStatus,
    /// Worker slot index while running, or of the last attempt.
    pub worker: Option<usize>,
    pub device: Option<Device>,
    /// Last epoch the job reported.
    pub epoch: Option<u64>,
    /// Harness process ID while running (for crash detection).
    pub pid: Option<u32>,
    /// Number of times the job was started.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub errors: Vec<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// All jobs known to the ledger, keyed by experiment id.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerState {
    pub jobs: BTreeMap<String, JobRecord>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// File-locked access to the ledger file.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub path: PathBuf,
}

impl Ledger {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load the ledger, or an empty one if the file doesn't exist.
    pub fn load(&self) -> Result<LedgerState, StateError> {
        if !self.path.exists() {
            return Ok(LedgerState::default());
        }

        let file = File::open(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let empty = file.metadata().map(|m| m.len()).unwrap_or(0) == 0;
        let state = if empty {
            LedgerState::default()
        } else {
            serde_json::from_reader(BufReader::new(&file))
                .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?
        };

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;
        Ok(state)
    }

    /// Read-modify-write under an exclusive lock held for the whole operation.
    pub fn update<F>(&self, f: F) -> Result<LedgerState, StateError>
    where
        F: FnOnce(&mut LedgerState),
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let mut state: LedgerState = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            serde_json::from_reader(BufReader::new(&file))
                .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?
        } else {
            LedgerState::default()
        };

        f(&mut state);

        file.set_len(0)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StateError::Io(self.path.clone(), e))?;
        serde_json::to_writer_pretty(BufWriter::new(&file), &state)
            .map_err(|e| StateError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;
        Ok(state)
    }

    /// Register jobs as pending. Existing entries are reset to pending unless running.
    pub fn initialize_jobs(&self, ids: &[ExperimentId]) -> Result<(), StateError> {
        self.update(|state| {
            for id in ids {
                let record = state.jobs.entry(id.to_string()).or_default();
                if record.status != JobStatus::Running {
                    record.status = JobStatus::Pending;
                }
            }
        })?;
        Ok(())
    }

    pub fn mark_started(
        &self,
        id: &ExperimentId,
        worker: usize,
        device: Device,
    ) -> Result<(), StateError> {
        self.update(|state| {
            let record = state.jobs.entry(id.to_string()).or_default();
            record.status = JobStatus::Running;
            record.worker = Some(worker);
            record.device = Some(device);
            record.pid = Some(std::process::id());
            record.attempts += 1;
            record.started_at = Some(now_timestamp());
            record.finished_at = None;
        })?;
        Ok(())
    }

    /// Record a `Done` or `EarlyStopped` outcome.
    pub fn mark_finished(
        &self,
        id: &ExperimentId,
        status: JobStatus,
        epoch: u64,
    ) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(record) = state.jobs.get_mut(id.as_str()) {
                record.status = status;
                record.epoch = Some(epoch);
                record.pid = None;
                record.finished_at = Some(now_timestamp());
            }
        })?;
        Ok(())
    }

    pub fn mark_failed(&self, id: &ExperimentId, failure: &JobFailure) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(record) = state.jobs.get_mut(id.as_str()) {
                record.status = JobStatus::Failed;
                record.pid = None;
                record.epoch = Some(failure.epoch);
                record.errors.push(failure.to_string());
                record.finished_at = Some(now_timestamp());
            }
        })?;
        Ok(())
    }

    /// Reset a job to pending. Returns whether the job was found.
    pub fn reset_job(&self, id: &str) -> Result<bool, StateError> {
        let mut found = false;
        self.update(|state| {
            if let Some(record) = state.jobs.get_mut(id) {
                *record = JobRecord::default();
                found = true;
            }
        })?;
        Ok(found)
    }

    /// Mark jobs left running by a dead harness process as failed.
    pub fn recover_crashed_runs(&self) -> Result<Vec<String>, StateError> {
        let mut crashed = Vec::new();

        self.update(|state| {
            for (id, record) in &mut state.jobs {
                if record.status == JobStatus::Running && !record.pid.is_some_and(is_process_alive)
                {
                    record.status = JobStatus::Failed;
                    record.pid = None;
                    record
                        .errors
                        .push("harness process died while running".to_string());
                    crashed.push(id.clone());
                }
            }
        })?;

        Ok(crashed)
    }
}

fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks that the process exists.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with the ledger file.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read/write ledger {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock ledger {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse ledger {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write ledger {0}: {1}")]
    Write(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use gym_training::FailureKind;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_lifecycle() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let id = ExperimentId::new("gs/a");

        ledger.initialize_jobs(std::slice::from_ref(&id)).unwrap();
        assert_eq!(ledger.load().unwrap().jobs["gs/a"].status, JobStatus::Pending);

        ledger.mark_started(&id, 1, Device::Cuda(0)).unwrap();
        let record = ledger.load().unwrap().jobs["gs/a"].clone();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.worker, Some(1));
        assert_eq!(record.device, Some(Device::Cuda(0)));
        assert_eq!(record.pid, Some(std::process::id()));
        assert_eq!(record.attempts, 1);

        ledger.mark_finished(&id, JobStatus::EarlyStopped, 3).unwrap();
        let record = ledger.load().unwrap().jobs["gs/a"].clone();
        assert_eq!(record.status, JobStatus::EarlyStopped);
        assert_eq!(record.epoch, Some(3));
        assert!(record.pid.is_none());
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_mark_failed_and_reset() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let id = ExperimentId::new("gs/b");
        ledger.initialize_jobs(std::slice::from_ref(&id)).unwrap();
        ledger.mark_started(&id, 0, Device::Cpu).unwrap();

        let failure = JobFailure {
            kind: FailureKind::Step,
            epoch: 4,
            message: "boom".to_string(),
        };
        ledger.mark_failed(&id, &failure).unwrap();
        let record = ledger.load().unwrap().jobs["gs/b"].clone();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.epoch, Some(4));
        assert_eq!(record.errors.len(), 1);
        assert!(record.errors[0].contains("boom"));

        assert!(ledger.reset_job("gs/b").unwrap());
        assert!(!ledger.reset_job("gs/missing").unwrap());
        let record = ledger.load().unwrap().jobs["gs/b"].clone();
        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.errors.is_empty());
    }

    #[test]
    fn test_recover_crashed_runs() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        ledger
            .update(|state| {
                state.jobs.insert(
                    "dead".to_string(),
                    JobRecord {
                        status: JobStatus::Running,
                        pid: None,
                        ..Default::default()
                    },
                );
                state.jobs.insert(
                    "alive".to_string(),
                    JobRecord {
                        status: JobStatus::Running,
                        pid: Some(std::process::id()),
                        ..Default::default()
                    },
                );
            })
            .unwrap();

        let crashed = ledger.recover_crashed_runs().unwrap();

        assert_eq!(crashed, vec!["dead".to_string()]);
        let state = ledger.load().unwrap();
        assert_eq!(state.jobs["dead"].status, JobStatus::Failed);
        assert_eq!(state.jobs["alive"].status, JobStatus::Running);
    }

    #[test]
    fn test_initialize_keeps_history() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let id = ExperimentId::new("gs/c");
        ledger.initialize_jobs(std::slice::from_ref(&id)).unwrap();
        ledger.mark_started(&id, 0, Device::Cpu).unwrap();
        ledger.mark_finished(&id, JobStatus::Done, 2).unwrap();

        ledger.initialize_jobs(std::slice::from_ref(&id)).unwrap();
        let record = ledger.load().unwrap().jobs["gs/c"].clone();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 1);
    }
}
