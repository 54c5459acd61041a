//! Checkpoint layout and training-state persistence.
//!
//! A checkpoint directory holds three artifacts: the model record and the
//! optimizer record (byte layout owned by the burn recorder) plus a JSON
//! sidecar with the orchestrator's own state. Loading distinguishes a missing
//! checkpoint (expected when resuming a fresh run) from a corrupt one.

use std::fs;
use std::path::{Path, PathBuf};

use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Recorder used for model and optimizer records. Full precision, so a
/// resumed run continues bit-for-bit where the checkpoint left off.
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// File layout of one checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    dir: PathBuf,
}

impl CheckpointPaths {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Model record path (recorder appends its extension).
    pub fn model_file(&self) -> PathBuf {
        self.dir.join("model")
    }

    /// Optimizer record path (recorder appends its extension).
    pub fn optimizer_file(&self) -> PathBuf {
        self.dir.join("optimizer")
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.join("train_state.json")
    }
}

/// Orchestrator state carried across a resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainState {
    /// Next iteration to execute
    pub it: usize,
    /// Best evaluation accuracy seen so far
    pub best_eval_acc: f64,
    /// Iteration that produced the best accuracy
    pub best_it: usize,
    /// When this state was written
    pub timestamp: String,
}

impl Default for TrainState {
    fn default() -> Self {
        Self {
            it: 0,
            best_eval_acc: 0.0,
            best_it: 0,
            timestamp: String::new(),
        }
    }
}

impl TrainState {
    pub fn save(&self, paths: &CheckpointPaths) -> Result<()> {
        paths.ensure_dir()?;
        let mut stamped = self.clone();
        stamped.timestamp = chrono::Utc::now().to_rfc3339();
        let json = serde_json::to_string_pretty(&stamped)?;
        fs::write(paths.state_file(), json)?;
        Ok(())
    }

    /// Load the state sidecar. A missing file maps to [`Error::NotFound`];
    /// anything unreadable or unparsable maps to [`Error::Serialization`].
    pub fn load(paths: &CheckpointPaths) -> Result<Self> {
        let path = paths.state_file();
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let json = fs::read_to_string(&path)
            .map_err(|e| Error::Serialization(format!("unreadable checkpoint state: {e}")))?;
        let state = serde_json::from_str(&json)
            .map_err(|e| Error::Serialization(format!("corrupt checkpoint state: {e}")))?;
        Ok(state)
    }
}

/// Manages the checkpoints of one run directory: a `latest` checkpoint that
/// is overwritten at every save, plus per-iteration directories retained up
/// to a limit.
pub struct CheckpointManager {
    dir: PathBuf,
    keep_last_n: Option<usize>,
}

impl CheckpointManager {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            keep_last_n: Some(3),
        }
    }

    /// Configure how many per-iteration checkpoints to keep (`None` keeps all).
    pub fn keep_last_n(mut self, n: Option<usize>) -> Self {
        self.keep_last_n = n;
        self
    }

    pub fn latest_paths(&self) -> CheckpointPaths {
        CheckpointPaths::new(self.dir.join("latest"))
    }

    pub fn iteration_paths(&self, it: usize) -> CheckpointPaths {
        CheckpointPaths::new(self.dir.join(format!("iter_{it:08}")))
    }

    /// All per-iteration checkpoints, oldest first.
    pub fn list_iterations(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if let Some(it) = extract_iteration_from_dirname(name) {
                found.push((it, path));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Remove the oldest per-iteration checkpoints beyond the retention
    /// limit.
    pub fn prune(&self) -> Result<()> {
        let Some(keep) = self.keep_last_n else {
            return Ok(());
        };
        let checkpoints = self.list_iterations()?;
        if checkpoints.len() <= keep {
            return Ok(());
        }
        let excess = checkpoints.len() - keep;
        for (_, path) in checkpoints.into_iter().take(excess) {
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!("failed to remove old checkpoint {:?}: {}", path, e);
            }
        }
        Ok(())
    }
}

/// Extract the iteration number from a checkpoint directory name.
pub fn extract_iteration_from_dirname(name: &str) -> Option<usize> {
    // Expected format: "iter_00000123"
    name.strip_prefix("iter_").and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_save_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let paths = CheckpointPaths::new(tmp.path());

        let state = TrainState {
            it: 123,
            best_eval_acc: 0.87,
            best_it: 100,
            timestamp: String::new(),
        };
        state.save(&paths).unwrap();

        let loaded = TrainState::load(&paths).unwrap();
        assert_eq!(loaded.it, 123);
        assert_eq!(loaded.best_it, 100);
        assert!((loaded.best_eval_acc - 0.87).abs() < 1e-12);
        assert!(!loaded.timestamp.is_empty());
    }

    #[test]
    fn test_missing_state_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let paths = CheckpointPaths::new(tmp.path().join("nothing-here"));
        assert!(matches!(TrainState::load(&paths), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_extract_iteration_from_dirname() {
        assert_eq!(extract_iteration_from_dirname("iter_00000005"), Some(5));
        assert_eq!(extract_iteration_from_dirname("iter_12345678"), Some(12345678));
        assert_eq!(extract_iteration_from_dirname("latest"), None);
        assert_eq!(extract_iteration_from_dirname("iter_abc"), None);
    }

    #[test]
    fn test_manager_prunes_old_checkpoints() {
        let tmp = TempDir::new().unwrap();
        let manager = CheckpointManager::new(tmp.path()).keep_last_n(Some(2));

        for it in [4usize, 8, 12, 16] {
            let paths = manager.iteration_paths(it);
            TrainState {
                it,
                ..Default::default()
            }
            .save(&paths)
            .unwrap();
        }
        manager.prune().unwrap();

        let kept: Vec<usize> = manager
            .list_iterations()
            .unwrap()
            .into_iter()
            .map(|(it, _)| it)
            .collect();
        assert_eq!(kept, vec![12, 16]);
    }

    #[test]
    fn test_manager_keep_all() {
        let tmp = TempDir::new().unwrap();
        let manager = CheckpointManager::new(tmp.path()).keep_last_n(None);
        for it in [1usize, 2, 3, 4, 5] {
            TrainState::default().save(&manager.iteration_paths(it)).unwrap();
        }
        manager.prune().unwrap();
        assert_eq!(manager.list_iterations().unwrap().len(), 5);
    }

    #[test]
    fn test_corrupt_state_is_serialization_error() {
        let tmp = TempDir::new().unwrap();
        let paths = CheckpointPaths::new(tmp.path());
        paths.ensure_dir().unwrap();
        fs::write(paths.state_file(), b"{ definitely not json").unwrap();
        assert!(matches!(
            TrainState::load(&paths),
            Err(Error::Serialization(_))
        ));
    }
}
