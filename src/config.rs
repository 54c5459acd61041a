//! Run configuration and validation.
//!
//! Every configuration error is surfaced before any worker or device
//! resources are allocated.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::algorithm::AlgorithmConfig;
use crate::backend;
use crate::data::synthetic::SyntheticSpec;
use crate::dist::LaunchPlan;
use crate::error::{Error, Result};

/// Optimizer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimKind {
    Sgd,
    Adam,
}

impl FromStr for OptimKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(OptimKind::Sgd),
            "adam" => Ok(OptimKind::Adam),
            other => Err(Error::Config(format!(
                "unknown optimizer '{other}' (expected sgd or adam)"
            ))),
        }
    }
}

/// Distributed-launch parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistConfig {
    /// Number of nodes participating in the run
    pub world_size: usize,
    /// This node's rank
    pub node_rank: usize,
    /// Workers (devices) driven per node
    pub devices_per_node: usize,
    /// Rendezvous identifier shared by all workers
    pub dist_url: String,
    /// Launch one worker per device even when a single node suffices
    pub multiprocessing_distributed: bool,
    /// Pin a single-worker run to a specific device index
    pub device: Option<usize>,
    /// Request GPU-accelerated training
    pub gpu: bool,
    /// Seconds to wait for all peers at the rendezvous
    pub join_timeout_secs: u64,
}

impl Default for DistConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            node_rank: 0,
            devices_per_node: 1,
            dist_url: "local://semivat".to_string(),
            multiprocessing_distributed: false,
            device: None,
            gpu: false,
            join_timeout_secs: 60,
        }
    }
}

/// Full configuration of one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    // Saving & loading
    pub save_dir: PathBuf,
    pub save_name: String,
    pub overwrite: bool,
    pub resume: bool,
    pub load_path: Option<PathBuf>,

    // Iteration budget
    pub num_train_iter: usize,
    /// Number of reporting epochs (must divide `num_train_iter`)
    pub epoch: usize,
    pub num_warmup_iter: usize,
    pub num_eval_iter: usize,

    // Batch composition
    pub batch_size: usize,
    /// Ratio of unlabeled to labeled samples per mini-batch
    pub uratio: usize,
    pub eval_batch_size: usize,
    /// Overall unsupervised loss weight
    pub ulb_loss_ratio: f64,

    // Optimizer
    pub optim: OptimKind,
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Gradient norm clipping; 0 disables
    pub clip_grad: f64,

    // Backbone
    pub base_filters: usize,
    pub hidden_size: usize,

    // Algorithm and its options
    pub algorithm: AlgorithmConfig,

    // Dataset
    pub data: SyntheticSpec,

    // Distributed launch
    pub dist: DistConfig,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("./saved_models"),
            save_name: "vat_run".to_string(),
            overwrite: false,
            resume: false,
            load_path: None,
            num_train_iter: 10240,
            epoch: 10,
            num_warmup_iter: 0,
            num_eval_iter: 512,
            batch_size: 32,
            uratio: 1,
            eval_batch_size: 256,
            ulb_loss_ratio: 1.0,
            optim: OptimKind::Sgd,
            lr: 3e-2,
            momentum: 0.9,
            weight_decay: 5e-4,
            clip_grad: 0.0,
            base_filters: 16,
            hidden_size: 128,
            algorithm: AlgorithmConfig::Vat(Default::default()),
            data: SyntheticSpec::default(),
            dist: DistConfig::default(),
            seed: 1,
        }
    }
}

impl TrainConfig {
    /// Validate everything that can fail without touching the filesystem or
    /// any device.
    pub fn validate(&self) -> Result<()> {
        if self.num_train_iter == 0 || self.epoch == 0 {
            return Err(Error::Config(
                "iteration and epoch budgets must be positive".to_string(),
            ));
        }
        if self.num_train_iter % self.epoch != 0 {
            return Err(Error::Config(format!(
                "total training iterations {} are not divisible by {} epochs",
                self.num_train_iter, self.epoch
            )));
        }
        if self.num_eval_iter == 0 {
            return Err(Error::Config(
                "evaluation interval must be positive".to_string(),
            ));
        }
        if self.resume && self.load_path.is_none() {
            return Err(Error::Config(
                "resume requires --load-path".to_string(),
            ));
        }
        if self.uratio == 0 {
            return Err(Error::Config("uratio must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }

        if self.dist.world_size == 0 || self.dist.devices_per_node == 0 {
            return Err(Error::Config(
                "world size and devices per node must be positive".to_string(),
            ));
        }
        if self.dist.node_rank >= self.dist.world_size {
            return Err(Error::Config(format!(
                "node rank {} is out of bounds for world size {}",
                self.dist.node_rank, self.dist.world_size
            )));
        }
        if self.is_distributed() && self.batch_size % self.dist.devices_per_node != 0 {
            return Err(Error::Config(format!(
                "batch size {} is not divisible across {} devices per node",
                self.batch_size, self.dist.devices_per_node
            )));
        }

        if self.dist.gpu {
            if !backend::accelerated_build() {
                return Err(Error::Device(
                    "GPU training requested but this build has no CUDA support".to_string(),
                ));
            }
            if !backend::is_gpu_available() {
                return Err(Error::Device(
                    "GPU training requested but no GPU is available".to_string(),
                ));
            }
        }

        self.algorithm.validate()?;
        self.data.validate()?;
        Ok(())
    }

    /// Resolve the save path and enforce the overwrite rule. Removes a stale
    /// run directory when overwriting is allowed.
    pub fn prepare_save_dir(&self) -> Result<PathBuf> {
        let path = self.save_path();
        if path.exists() && !self.resume {
            if !self.overwrite {
                return Err(Error::AlreadyExists(format!(
                    "model directory {} (pass --overwrite to replace it)",
                    path.display()
                )));
            }
            std::fs::remove_dir_all(&path)?;
        }
        Ok(path)
    }

    pub fn save_path(&self) -> PathBuf {
        self.save_dir.join(&self.save_name)
    }

    pub fn is_distributed(&self) -> bool {
        self.dist.multiprocessing_distributed || self.dist.world_size > 1
    }

    /// Each worker's labeled batch share.
    pub fn per_device_batch_size(&self) -> usize {
        if self.is_distributed() {
            self.batch_size / self.dist.devices_per_node
        } else {
            self.batch_size
        }
    }

    pub fn launch_plan(&self) -> LaunchPlan {
        if self.is_distributed() {
            LaunchPlan::Distributed {
                nodes: self.dist.world_size,
                node_rank: self.dist.node_rank,
                devices_per_node: self.dist.devices_per_node,
            }
        } else {
            LaunchPlan::Single {
                device_index: self.dist.device.unwrap_or(0),
            }
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.dist.join_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_indivisible_epoch_budget_rejected() {
        let cfg = TrainConfig {
            num_train_iter: 100,
            epoch: 7,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_resume_without_load_path_rejected() {
        let cfg = TrainConfig {
            resume: true,
            load_path: None,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_indivisible_device_batch_rejected() {
        let mut cfg = TrainConfig {
            batch_size: 10,
            ..Default::default()
        };
        cfg.dist.multiprocessing_distributed = true;
        cfg.dist.devices_per_node = 4;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_per_device_batch_size() {
        let mut cfg = TrainConfig {
            batch_size: 32,
            ..Default::default()
        };
        assert_eq!(cfg.per_device_batch_size(), 32);
        cfg.dist.multiprocessing_distributed = true;
        cfg.dist.devices_per_node = 4;
        assert_eq!(cfg.per_device_batch_size(), 8);
    }

    #[test]
    fn test_launch_plan_selection() {
        let mut cfg = TrainConfig::default();
        assert_eq!(cfg.launch_plan(), LaunchPlan::Single { device_index: 0 });

        cfg.dist.multiprocessing_distributed = true;
        cfg.dist.devices_per_node = 2;
        assert_eq!(
            cfg.launch_plan(),
            LaunchPlan::Distributed {
                nodes: 1,
                node_rank: 0,
                devices_per_node: 2
            }
        );
    }

    #[test]
    fn test_config_json_round_trip() {
        let cfg = TrainConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_train_iter, cfg.num_train_iter);
        assert_eq!(back.algorithm.name(), "vat");
    }

    #[test]
    fn test_optim_kind_parsing() {
        assert_eq!(OptimKind::from_str("SGD").unwrap(), OptimKind::Sgd);
        assert_eq!(OptimKind::from_str("adam").unwrap(), OptimKind::Adam);
        assert!(OptimKind::from_str("rmsprop").is_err());
    }
}
