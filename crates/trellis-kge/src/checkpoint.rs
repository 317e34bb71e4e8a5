use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::model::ModelState;
use crate::optim::OptimizerState;
use crate::{Error, Result};

pub const CHECKPOINT_FILE: &str = "checkpoint";
pub const CONFIG_FILE: &str = "config.json";

/// Everything needed to continue a run exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Step the run will execute next after resuming.
    pub step: u64,
    pub learning_rate: f64,
    /// Resolved warm-up boundary; pushed to `max_steps` once the decay
    /// has fired so a resumed run cannot decay twice.
    pub warm_up_steps: u64,
    pub optimizer: OptimizerState,
    pub model: ModelState,
}

/// Writes and reads run state under one directory.
///
/// Both files go through a temporary sibling and a rename, so a crash
/// mid-save leaves the previous checkpoint intact.
pub struct CheckpointManager {
    dir: PathBuf,
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_path().exists()
    }

    /// Persist the configuration and the run state.
    pub fn save(&self, config: &RunConfig, snapshot: &RunSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        atomic_write(&self.dir.join(CONFIG_FILE), &serde_json::to_vec_pretty(config)?)?;
        atomic_write(&self.checkpoint_path(), &bincode::serialize(snapshot)?)?;
        Ok(())
    }

    pub fn load(&self) -> Result<RunSnapshot> {
        let path = self.checkpoint_path();
        if !path.exists() {
            return Err(Error::MissingArtifact(path));
        }
        Ok(bincode::deserialize(&fs::read(path)?)?)
    }
}
