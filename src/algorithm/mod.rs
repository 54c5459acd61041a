//! Per-iteration training algorithms.
//!
//! Every semi-supervised method implements [`Algorithm`]: one `train_step`
//! combining a supervised loss, a warmup-scaled unsupervised loss and any
//! auxiliary regularizers into a single objective, followed by exactly one
//! atomic parameter update. Algorithms are selected through the closed
//! [`AlgorithmConfig`] registry, each variant carrying its own option struct.

pub mod bn_control;
pub mod supervised;
pub mod vat;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::data::{LabeledBatch, UnlabeledBatch};
use crate::dist::ReplicaSync;
use crate::error::Result;
use crate::metrics::Scalars;
use crate::train::checkpoint::CheckpointPaths;

pub use bn_control::BatchNormController;
pub use supervised::SupervisedOptions;
pub use vat::VatOptions;

/// Everything a step needs from the orchestrator, threaded explicitly.
pub struct StepContext<'a> {
    /// Current iteration (0-based)
    pub it: usize,
    /// Total iteration budget
    pub num_train_iter: usize,
    /// Learning rate scheduled for this iteration
    pub lr: f64,
    /// Gradient synchronization across replicas, when distributed
    pub sync: Option<&'a ReplicaSync>,
}

/// Uniform per-iteration interface implemented by every method.
pub trait Algorithm<B: AutodiffBackend> {
    /// Run one training iteration and return its named scalar diagnostics.
    fn train_step(
        &mut self,
        labeled: LabeledBatch<B>,
        unlabeled: UnlabeledBatch<B>,
        ctx: &StepContext<'_>,
    ) -> Result<Scalars>;

    /// Inference-mode logits for evaluation batches.
    fn eval_logits(&self, images: Tensor<B::InnerBackend, 4>) -> Tensor<B::InnerBackend, 2>;

    /// Persist model and optimizer state.
    fn save_checkpoint(&self, paths: &CheckpointPaths) -> Result<()>;

    /// Restore model and optimizer state.
    fn load_checkpoint(&mut self, paths: &CheckpointPaths) -> Result<()>;

    /// Flattened copy of all float parameters, for replica checks and tests.
    fn parameter_vector(&self) -> Vec<f32>;

    /// Optional pre-training stage, run before the main loop.
    fn warmup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Optional post-training stage, run after the main loop.
    fn finetune(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One atomic parameter update: backward pass, gradient extraction, optional
/// cross-replica averaging, then the optimizer step at the scheduled rate.
/// No partial update is observable between these stages.
pub(crate) fn apply_update<B, M, O>(
    model: M,
    optimizer: &mut O,
    loss: Tensor<B, 1>,
    ctx: &StepContext<'_>,
) -> Result<M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let grads = loss.backward();
    let grads = GradientsParams::from_grads(grads, &model);
    let grads = match ctx.sync {
        Some(sync) => sync.all_reduce_grads(&model, grads)?,
        None => grads,
    };
    Ok(optimizer.step(ctx.lr, model, grads))
}

/// Closed registry of training algorithms with their option schemas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum AlgorithmConfig {
    #[serde(rename = "vat")]
    Vat(VatOptions),
    #[serde(rename = "fullysupervised")]
    FullySupervised(SupervisedOptions),
}

impl AlgorithmConfig {
    /// Names accepted by the CLI's `--algorithm` option.
    pub fn registered_names() -> &'static [&'static str] {
        &["vat", "fullysupervised"]
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmConfig::Vat(_) => "vat",
            AlgorithmConfig::FullySupervised(_) => "fullysupervised",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            AlgorithmConfig::Vat(opts) => opts.validate(),
            AlgorithmConfig::FullySupervised(_) => Ok(()),
        }
    }

    /// Resolve a CLI algorithm name, attaching the options the variant
    /// registers. Options belonging to other variants are ignored.
    pub fn from_name(name: &str, vat: VatOptions) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "vat" => Ok(AlgorithmConfig::Vat(vat)),
            "fullysupervised" => Ok(AlgorithmConfig::FullySupervised(SupervisedOptions::default())),
            other => Err(crate::error::Error::Config(format!(
                "unknown algorithm '{other}' (registered: {})",
                Self::registered_names().join(", ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_round_trip() {
        let config = AlgorithmConfig::Vat(VatOptions::default());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"name\":\"vat\""));
        let back: AlgorithmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name(), "vat");
    }

    #[test]
    fn test_registered_names_cover_variants() {
        let names = AlgorithmConfig::registered_names();
        assert!(names.contains(&"vat"));
        assert!(names.contains(&"fullysupervised"));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut opts = VatOptions::default();
        opts.vat_eps = -1.0;
        assert!(AlgorithmConfig::Vat(opts).validate().is_err());
    }
}
