//! Run modes, validation modes, devices and experiment identifiers.

use serde::{Deserialize, Serialize};

/// Which execution path a job takes.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Train epoch by epoch with checkpoints and early stopping.
    #[default]
    Train,
    /// Re-score an already trained model over an explicit epoch list.
    ReEval,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::ReEval => write!(f, "re_eval"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "train" => Ok(Self::Train),
            "re_eval" | "reeval" => Ok(Self::ReEval),
            _ => Err(format!("unknown run mode '{s}'. Use: train, re_eval")),
        }
    }
}

/// How the grid search configuration is turned into jobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    GridSearch,
    CrossValidation,
    NestedCv,
}

impl ValidationMode {
    /// Whether this mode needs an evaluation (fold) configuration.
    #[must_use]
    pub fn needs_evaluation_config(self) -> bool {
        !matches!(self, Self::GridSearch)
    }
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GridSearch => write!(f, "grid_search"),
            Self::CrossValidation => write!(f, "cross_validation"),
            Self::NestedCv => write!(f, "nested_cv"),
        }
    }
}

impl std::str::FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "grid_search" | "gs" => Ok(Self::GridSearch),
            "cross_validation" | "cv" => Ok(Self::CrossValidation),
            "nested_cv" | "nested_cross_validation" => Ok(Self::NestedCv),
            _ => Err(format!(
                "unknown validation mode '{s}'. Use: grid_search, cross_validation, nested_cv"
            )),
        }
    }
}

/// A compute device a job can be placed on.
///
/// `cpu` is shared by every worker; accelerators are leased to one job at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
}

impl Device {
    /// Whether two running jobs must never share this device.
    #[must_use]
    pub fn is_exclusive(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "cpu" {
            return Ok(Self::Cpu);
        }
        // Bare integers are GPU ordinals.
        let id = s.strip_prefix("cuda:").unwrap_or(&s);
        id.parse()
            .map(Self::Cuda)
            .map_err(|_| format!("invalid device '{s}'. Use: cpu, cuda:<id> or <id>"))
    }
}

impl Serialize for Device {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Globally unique identifier of an experiment.
///
/// Ties a job to its checkpoint namespace and its status stream. Path-like:
/// segments are separated by `/`, e.g. `2024-01-01--12-00-00/lr-0.1/fold_2`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a path segment.
    #[must_use]
    pub fn join(&self, segment: impl std::fmt::Display) -> Self {
        Self(format!("{}/{segment}", self.0))
    }

    /// Split into path segments, rejecting empty, `.` and `..` segments.
    pub fn segments(&self) -> Result<Vec<&str>, String> {
        let segments: Vec<&str> = self.0.split('/').collect();
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            return Err(format!("invalid segment '{bad}' in experiment id '{}'", self.0));
        }
        Ok(segments)
    }
}

impl std::fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ExperimentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An explicit, not necessarily contiguous, list of epochs.
///
/// Parsed from a comma separated list where each entry is either a single
/// epoch or an inclusive range:
/// - `"1,3,5"` → 1, 3, 5
/// - `"1..=3,10"` → 1, 2, 3, 10
///
/// Ranges are expanded eagerly, so a list holds at most
/// [`MAX_EPOCH_LIST_LEN`] epochs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EpochList(pub Vec<u64>);

pub const MAX_EPOCH_LIST_LEN: usize = 100_000;

impl std::str::FromStr for EpochList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut epochs = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((start, end)) = part.split_once("..=") {
                let start: u64 = start
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid range start in '{part}'"))?;
                let end: u64 = end
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid range end in '{part}'"))?;
                if end < start {
                    return Err(format!("empty range '{part}'"));
                }
                let room = (MAX_EPOCH_LIST_LEN - epochs.len()) as u64;
                if end - start >= room {
                    return Err(format!("range '{part}' exceeds {MAX_EPOCH_LIST_LEN} epochs"));
                }
                epochs.extend(start..=end);
            } else {
                if epochs.len() == MAX_EPOCH_LIST_LEN {
                    return Err(format!("more than {MAX_EPOCH_LIST_LEN} epochs"));
                }
                epochs.push(
                    part.parse()
                        .map_err(|_| format!("invalid epoch '{part}'"))?,
                );
            }
        }
        if epochs.is_empty() {
            return Err("empty epoch list".to_string());
        }
        Ok(Self(epochs))
    }
}

impl std::fmt::Display for EpochList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl Serialize for EpochList {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EpochList {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<u64>::deserialize(deserializer).map(Self)
    }
}
