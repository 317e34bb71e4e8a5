use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use trellis_reason::{TaskKind, UnionMode};

use crate::{Error, Result};

/// Reasoning-model families selectable at run time.
///
/// | Token | Family | Negation | De Morgan unions |
/// |-------|--------|----------|------------------|
/// | `vec` | GQE | no | no |
/// | `box` | Query2box | no | no |
/// | `beta` | BetaE | yes | yes |
/// | `ns` | neural-symbolic | yes | no |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Gqe,
    Query2Box,
    BetaE,
    NeuralSymbolic,
}

impl ModelFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Gqe => "vec",
            ModelFamily::Query2Box => "box",
            ModelFamily::BetaE => "beta",
            ModelFamily::NeuralSymbolic => "ns",
        }
    }

    /// Point and box geometries have no way to represent a complement.
    pub fn supports_negation(self) -> bool {
        !matches!(self, ModelFamily::Gqe | ModelFamily::Query2Box)
    }

    /// De Morgan union evaluation needs a closed-under-negation geometry.
    pub fn supports_de_morgan(self) -> bool {
        matches!(self, ModelFamily::BetaE)
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vec" => Ok(ModelFamily::Gqe),
            "box" => Ok(ModelFamily::Query2Box),
            "beta" => Ok(ModelFamily::BetaE),
            "ns" => Ok(ModelFamily::NeuralSymbolic),
            other => Err(Error::Config(format!(
                "unknown model family '{other}' (expected vec, box, beta, or ns)"
            ))),
        }
    }
}

/// Full configuration of a run.
///
/// Snapshotted as `config.json` next to every checkpoint, so a run
/// directory is self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub do_train: bool,
    pub do_valid: bool,
    pub do_test: bool,

    pub data_path: PathBuf,
    pub tasks: Vec<TaskKind>,
    pub union_mode: UnionMode,
    pub family: ModelFamily,

    pub hidden_dim: usize,
    pub gamma: f64,
    pub negative_sample_size: usize,
    pub batch_size: usize,
    pub test_batch_size: usize,

    pub learning_rate: f64,
    pub max_steps: u64,
    /// Defaults to `max_steps / 2` when unset.
    pub warm_up_steps: Option<u64>,
    pub save_checkpoint_steps: u64,
    pub valid_steps: u64,
    pub log_steps: u64,
    pub test_log_steps: u64,

    pub seed: u64,
    /// One weight per task; all tasks weigh 1.0 when unset.
    pub loss_weights: Option<Vec<f64>>,
    /// Pretrained embedding bundle spliced into the model before training.
    pub pretrain: Option<PathBuf>,
    pub prefix: PathBuf,
    /// Resume source and fixed run directory; fresh start when unset.
    pub checkpoint_path: Option<PathBuf>,

    pub use_rule: bool,
    pub rule_len: usize,
    pub rule_thr: f64,
    pub max_neighbor: usize,

    pub regime_ee: bool,
    pub regime_es: bool,
    pub regime_se: bool,

    // Filled from stats.txt after loading, never set by hand.
    #[serde(default)]
    pub num_entities: usize,
    #[serde(default)]
    pub num_relations: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            do_train: false,
            do_valid: false,
            do_test: false,
            data_path: PathBuf::new(),
            tasks: TaskKind::ALL.to_vec(),
            union_mode: UnionMode::Dnf,
            family: ModelFamily::Gqe,
            hidden_dim: 500,
            gamma: 12.0,
            negative_sample_size: 128,
            batch_size: 1024,
            test_batch_size: 1,
            learning_rate: 0.0001,
            max_steps: 1_000_000,
            warm_up_steps: None,
            save_checkpoint_steps: 1000,
            valid_steps: 10_000,
            log_steps: 100,
            test_log_steps: 10_000,
            seed: 0,
            loss_weights: None,
            pretrain: None,
            prefix: PathBuf::from("logs"),
            checkpoint_path: None,
            use_rule: false,
            rule_len: 3,
            rule_thr: 0.5,
            max_neighbor: 64,
            regime_ee: false,
            regime_es: false,
            regime_se: false,
            num_entities: 0,
            num_relations: 0,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskKind>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_family(mut self, family: ModelFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_union_mode(mut self, mode: UnionMode) -> Self {
        self.union_mode = mode;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Warm-up threshold actually in effect.
    pub fn effective_warm_up(&self) -> u64 {
        self.warm_up_steps.unwrap_or(self.max_steps / 2)
    }

    /// Per-task loss weights; every task weighs 1.0 when none are set.
    ///
    /// Call after [`RunConfig::validate`], which checks the counts line up.
    pub fn task_loss_weights(&self) -> Vec<(TaskKind, f64)> {
        match &self.loss_weights {
            Some(weights) => self.tasks.iter().copied().zip(weights.iter().copied()).collect(),
            None => self.tasks.iter().map(|task| (*task, 1.0)).collect(),
        }
    }

    /// The directory this run writes to.
    ///
    /// An explicit checkpoint path pins the directory (and marks the run as
    /// a resume); otherwise a fresh timestamped directory is derived.
    pub fn run_dir(&self) -> PathBuf {
        if let Some(path) = &self.checkpoint_path {
            return path.clone();
        }
        let dataset = self
            .data_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let tasks: Vec<&str> = self.tasks.iter().map(|task| task.as_str()).collect();
        let stamp = chrono::Local::now().format("%Y.%m.%d-%H.%M.%S").to_string();
        self.prefix
            .join(dataset)
            .join(tasks.join("."))
            .join(self.family.as_str())
            .join(stamp)
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Eager configuration checks, run before any data is read.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Config("task list is empty".to_string()));
        }
        if let Some(weights) = &self.loss_weights {
            if weights.len() != self.tasks.len() {
                return Err(Error::Config(format!(
                    "{} loss weights for {} tasks",
                    weights.len(),
                    self.tasks.len()
                )));
            }
        }
        if !self.family.supports_negation() {
            if let Some(task) = self.tasks.iter().find(|task| task.has_negation()) {
                return Err(Error::Config(format!(
                    "task {task} uses negation, which the {} family cannot express",
                    self.family
                )));
            }
        }
        if self.union_mode == UnionMode::DeMorgan && !self.family.supports_de_morgan() {
            return Err(Error::Config(format!(
                "De Morgan union evaluation requires the beta family, not {}",
                self.family
            )));
        }
        if self.do_train {
            if self.max_steps == 0 {
                return Err(Error::Config("max_steps must be positive".to_string()));
            }
            if self.batch_size == 0 {
                return Err(Error::Config("batch_size must be positive".to_string()));
            }
        }
        if (self.do_valid || self.do_test) && self.test_batch_size == 0 {
            return Err(Error::Config("test_batch_size must be positive".to_string()));
        }
        Ok(())
    }
}
