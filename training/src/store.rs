//! Checkpoint storage keyed by experiment, component and epoch.
//!
//! An epoch becomes visible to [`StateStore::last_epoch`] only through an
//! explicit [`StateStore::commit_epoch`], which the job issues after every
//! component of the epoch record has been written. A crash between writes
//! therefore leaves the previous epoch as the resume point.

use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use gym_config::ExperimentId;
use serde::{Deserialize, Serialize};

use crate::{
    component::StateSnapshot,
    metrics::{EvaluationResults, MeasurementRecord},
};

pub const MODEL_KEY: &str = "model";
pub const TRAINER_KEY: &str = "trainer";
pub const EARLY_STOPPING_KEY: &str = "early_stopping";

/// Durable, epoch-versioned key/value storage for job checkpoints.
///
/// Must be safe for concurrent use across distinct experiment ids. Every
/// call is atomic: a write either fully lands or is not observable.
pub trait StateStore: Send + Sync {
    /// Store the state of component `key` for `epoch`, together with the
    /// metrics it was evaluated at.
    fn save(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        state: &StateSnapshot,
        metrics: &EvaluationResults,
        epoch: u64,
    ) -> Result<(), StoreError>;

    fn load(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<StateSnapshot, StoreError>;

    fn contains(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<bool, StoreError>;

    /// Mark `epoch` as the last complete epoch of the experiment.
    fn commit_epoch(&self, experiment_id: &ExperimentId, epoch: u64) -> Result<(), StoreError>;

    /// Last committed epoch, `0` if nothing was committed yet.
    fn last_epoch(&self, experiment_id: &ExperimentId) -> Result<u64, StoreError>;

    /// Record evaluation results under `epoch` (the measurement id). A
    /// second write for the same epoch replaces the first.
    fn log_measurement_result(
        &self,
        results: &EvaluationResults,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<(), StoreError>;

    /// All measurements of an experiment, one per epoch, ordered by epoch.
    fn measurements(&self, experiment_id: &ExperimentId)
    -> Result<Vec<MeasurementRecord>, StoreError>;

    /// Record the re-evaluation of the checkpoint at `epoch`. Re-evaluations
    /// live in their own namespace and never replace training measurements.
    fn log_re_eval_result(
        &self,
        results: &EvaluationResults,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<(), StoreError>;

    /// All re-evaluations of an experiment, one per epoch, ordered by epoch.
    fn re_eval_measurements(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<MeasurementRecord>, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFile {
    epoch: u64,
    state: StateSnapshot,
    metrics: EvaluationResults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitIndex {
    last_epoch: u64,
}

/// File-backed store.
///
/// Layout under `root`, with the experiment id used as a relative path:
///
/// ```text
/// <experiment_id>/checkpoint.json            last committed epoch
/// <experiment_id>/epoch_<n>/<key>.json       component state + metrics
/// <experiment_id>/measurements/epoch_<n>.json
/// <experiment_id>/measurements/re_eval/epoch_<n>.json
/// ```
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiment_dir(&self, experiment_id: &ExperimentId) -> Result<PathBuf, StoreError> {
        let segments = experiment_id
            .segments()
            .map_err(|e| StoreError::InvalidId(experiment_id.clone(), e))?;
        Ok(segments
            .into_iter()
            .fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    fn checkpoint_path(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<PathBuf, StoreError> {
        Ok(self
            .experiment_dir(experiment_id)?
            .join(format!("epoch_{epoch}"))
            .join(format!("{key}.json")))
    }

    fn index_path(&self, experiment_id: &ExperimentId) -> Result<PathBuf, StoreError> {
        Ok(self.experiment_dir(experiment_id)?.join("checkpoint.json"))
    }

    fn measurements_dir(&self, experiment_id: &ExperimentId) -> Result<PathBuf, StoreError> {
        Ok(self.experiment_dir(experiment_id)?.join("measurements"))
    }

    fn re_eval_dir(&self, experiment_id: &ExperimentId) -> Result<PathBuf, StoreError> {
        Ok(self.measurements_dir(experiment_id)?.join("re_eval"))
    }
}

/// Write `value` as JSON to a temporary sibling, sync it, then rename over `path`.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
    }
    let tmp = path.with_extension("json.tmp");
    let json =
        serde_json::to_vec_pretty(value).map_err(|e| StoreError::Write(tmp.clone(), e.to_string()))?;

    let mut file = File::create(&tmp).map_err(|e| StoreError::Io(tmp.clone(), e))?;
    file.write_all(&json)
        .map_err(|e| StoreError::Io(tmp.clone(), e))?;
    file.sync_all().map_err(|e| StoreError::Io(tmp.clone(), e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| StoreError::Io(path.to_path_buf(), e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
    let file = File::open(path).map_err(|e| StoreError::Io(path.to_path_buf(), e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| StoreError::Parse(path.to_path_buf(), e.to_string()))
}

fn write_measurement(
    dir: &Path,
    results: &EvaluationResults,
    epoch: u64,
) -> Result<(), StoreError> {
    atomic_write_json(
        &dir.join(format!("epoch_{epoch}.json")),
        &MeasurementRecord {
            epoch,
            results: results.clone(),
        },
    )
}

/// Measurement files directly inside `dir`, sorted by epoch. Subdirectories are skipped.
fn read_measurements(dir: &Path) -> Result<Vec<MeasurementRecord>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Io(dir.to_path_buf(), e)),
    };

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::Io(dir.to_path_buf(), e))?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            records.push(read_json::<MeasurementRecord>(&path)?);
        }
    }
    records.sort_by_key(|r| r.epoch);
    Ok(records)
}

impl StateStore for FileStateStore {
    fn save(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        state: &StateSnapshot,
        metrics: &EvaluationResults,
        epoch: u64,
    ) -> Result<(), StoreError> {
        let path = self.checkpoint_path(key, experiment_id, epoch)?;
        atomic_write_json(
            &path,
            &CheckpointFile {
                epoch,
                state: state.clone(),
                metrics: metrics.clone(),
            },
        )
    }

    fn load(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<StateSnapshot, StoreError> {
        let path = self.checkpoint_path(key, experiment_id, epoch)?;
        if !path.exists() {
            return Err(StoreError::NotFound {
                key: key.to_string(),
                experiment_id: experiment_id.clone(),
                epoch,
            });
        }
        let checkpoint: CheckpointFile = read_json(&path)?;
        Ok(checkpoint.state)
    }

    fn contains(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<bool, StoreError> {
        Ok(self.checkpoint_path(key, experiment_id, epoch)?.exists())
    }

    fn commit_epoch(&self, experiment_id: &ExperimentId, epoch: u64) -> Result<(), StoreError> {
        let path = self.index_path(experiment_id)?;
        atomic_write_json(&path, &CommitIndex { last_epoch: epoch })
    }

    fn last_epoch(&self, experiment_id: &ExperimentId) -> Result<u64, StoreError> {
        let path = self.index_path(experiment_id)?;
        if !path.exists() {
            return Ok(0);
        }
        let index: CommitIndex = read_json(&path)?;
        Ok(index.last_epoch)
    }

    fn log_measurement_result(
        &self,
        results: &EvaluationResults,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<(), StoreError> {
        write_measurement(&self.measurements_dir(experiment_id)?, results, epoch)
    }

    fn measurements(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        read_measurements(&self.measurements_dir(experiment_id)?)
    }

    fn log_re_eval_result(
        &self,
        results: &EvaluationResults,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<(), StoreError> {
        write_measurement(&self.re_eval_dir(experiment_id)?, results, epoch)
    }

    fn re_eval_measurements(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        read_measurements(&self.re_eval_dir(experiment_id)?)
    }
}

/// A checkpoint write observed by [`MemoryStateStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointWrite {
    pub experiment_id: ExperimentId,
    pub key: String,
    pub epoch: u64,
}

#[derive(Debug, Default)]
struct MemoryInner {
    checkpoints: HashMap<(ExperimentId, String, u64), CheckpointFile>,
    committed: HashMap<ExperimentId, u64>,
    measurements: HashMap<ExperimentId, BTreeMap<u64, EvaluationResults>>,
    re_evals: HashMap<ExperimentId, BTreeMap<u64, EvaluationResults>>,
    writes: Vec<CheckpointWrite>,
}

fn to_records(by_epoch: Option<&BTreeMap<u64, EvaluationResults>>) -> Vec<MeasurementRecord> {
    by_epoch
        .into_iter()
        .flatten()
        .map(|(&epoch, results)| MeasurementRecord {
            epoch,
            results: results.clone(),
        })
        .collect()
}

/// In-process store. Keeps one measurement per epoch like [`FileStateStore`]
/// and records every checkpoint write, in order.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Checkpoint writes of one experiment, in write order.
    pub fn writes(&self, experiment_id: &ExperimentId) -> Result<Vec<CheckpointWrite>, StoreError> {
        Ok(self
            .lock()?
            .writes
            .iter()
            .filter(|w| &w.experiment_id == experiment_id)
            .cloned()
            .collect())
    }
}

impl StateStore for MemoryStateStore {
    fn save(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        state: &StateSnapshot,
        metrics: &EvaluationResults,
        epoch: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.checkpoints.insert(
            (experiment_id.clone(), key.to_string(), epoch),
            CheckpointFile {
                epoch,
                state: state.clone(),
                metrics: metrics.clone(),
            },
        );
        inner.writes.push(CheckpointWrite {
            experiment_id: experiment_id.clone(),
            key: key.to_string(),
            epoch,
        });
        Ok(())
    }

    fn load(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<StateSnapshot, StoreError> {
        self.lock()?
            .checkpoints
            .get(&(experiment_id.clone(), key.to_string(), epoch))
            .map(|c| c.state.clone())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
                experiment_id: experiment_id.clone(),
                epoch,
            })
    }

    fn contains(
        &self,
        key: &str,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .checkpoints
            .contains_key(&(experiment_id.clone(), key.to_string(), epoch)))
    }

    fn commit_epoch(&self, experiment_id: &ExperimentId, epoch: u64) -> Result<(), StoreError> {
        self.lock()?.committed.insert(experiment_id.clone(), epoch);
        Ok(())
    }

    fn last_epoch(&self, experiment_id: &ExperimentId) -> Result<u64, StoreError> {
        Ok(self
            .lock()?
            .committed
            .get(experiment_id)
            .copied()
            .unwrap_or(0))
    }

    fn log_measurement_result(
        &self,
        results: &EvaluationResults,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<(), StoreError> {
        self.lock()?
            .measurements
            .entry(experiment_id.clone())
            .or_default()
            .insert(epoch, results.clone());
        Ok(())
    }

    fn measurements(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        Ok(to_records(self.lock()?.measurements.get(experiment_id)))
    }

    fn log_re_eval_result(
        &self,
        results: &EvaluationResults,
        experiment_id: &ExperimentId,
        epoch: u64,
    ) -> Result<(), StoreError> {
        self.lock()?
            .re_evals
            .entry(experiment_id.clone())
            .or_default()
            .insert(epoch, results.clone());
        Ok(())
    }

    fn re_eval_measurements(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        Ok(to_records(self.lock()?.re_evals.get(experiment_id)))
    }
}

/// Errors that can occur reading or writing checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid experiment id {0}: {1}")]
    InvalidId(ExperimentId, String),
    #[error("no '{key}' checkpoint for {experiment_id} at epoch {epoch}")]
    NotFound {
        key: String,
        experiment_id: ExperimentId,
        epoch: u64,
    },
    #[error("failed to read/write {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to serialize {0}: {1}")]
    Write(PathBuf, String),
    #[error("state store lock poisoned")]
    Poisoned,
}
