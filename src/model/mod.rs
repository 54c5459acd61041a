//! Classifier backbone and the model capability consumed by the training
//! core.
//!
//! The training code never inspects architecture internals; it sees a model
//! only through [`DifferentiableClassifier`] (forward passes, optionally via
//! the penultimate token embedding) and [`NormFreeze`] (normalization-mode
//! control for adversarial probing).

pub mod cnn;
pub mod norm;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

pub use cnn::{ConvClassifier, ConvClassifierConfig};
pub use norm::{FreezableBatchNorm, FreezableBatchNormConfig};

/// The differentiable-model capability.
///
/// `embed_logits` exposes the penultimate token map (`[batch, tokens,
/// channels]`) together with the logits of the same pass;
/// `logits_from_tokens` re-enters the network after the embedding with the
/// same head as the clean pass, which is what embedding-space adversarial
/// probing perturbs.
pub trait DifferentiableClassifier<B: Backend> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
    fn embed_logits(&self, images: Tensor<B, 4>) -> (Tensor<B, 3>, Tensor<B, 2>);
    fn logits_from_tokens(&self, tokens: Tensor<B, 3>) -> Tensor<B, 2>;
}

/// Normalization-mode control over every norm layer of a model.
pub trait NormFreeze: Sized {
    /// Whether the model's norm layers currently use frozen statistics.
    fn norms_frozen(&self) -> bool;
    /// Return the model with every norm layer set to the given mode.
    fn with_norms_frozen(self, frozen: bool) -> Self;
}
