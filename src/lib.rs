//! # semivat
//!
//! Semi-supervised classifier training with virtual adversarial
//! regularization, built on the Burn framework.
//!
//! A small labeled set and a larger unlabeled set are combined: supervised
//! cross-entropy on the labeled batches, plus a consistency penalty that
//! searches each unlabeled batch for the bounded perturbation direction the
//! model is most sensitive to. Training runs single-worker or with one
//! worker per device, synchronized through an in-memory collective group.
//!
//! ## Modules
//!
//! - `algorithm`: the per-iteration step contract, the VAT regularizer, and
//!   normalization-mode control around adversarial probing
//! - `train`: orchestrated training loop, LR schedule, checkpoint/resume
//! - `dist`: rendezvous groups, worker launch, gradient averaging
//! - `data`: labeled / unlabeled / eval batch sources
//! - `model`: the convolutional backbone and the model capability traits
//! - `config`, `metrics`, `logging`, `backend`, `error`: run configuration
//!   and the ambient plumbing

pub mod algorithm;
pub mod backend;
pub mod config;
pub mod data;
pub mod dist;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod train;

// Re-export commonly used items for convenience
pub use algorithm::{Algorithm, AlgorithmConfig, BatchNormController, StepContext, VatOptions};
pub use backend::TrainingBackend;
pub use config::{DistConfig, OptimKind, TrainConfig};
pub use data::{LabeledBatch, UnlabeledBatch};
pub use dist::{LaunchPlan, ProcessGroup, ReplicaSync, Topology};
pub use error::{Error, Result};
pub use metrics::{MemorySink, MetricSink, RankGated, Scalars, TracingSink};
pub use model::{ConvClassifier, ConvClassifierConfig};
pub use train::{run_worker, Orchestrator, RunPlan, WarmupCosineSchedule, WorkerOutput};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
