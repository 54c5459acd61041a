//! Batch normalization with controllable statistics.
//!
//! Burn's built-in `BatchNorm` always runs in training mode under an autodiff
//! backend, which makes adversarial probing corrupt the running statistics.
//! This variant adds an explicit `frozen` flag: while frozen, forward passes
//! normalize with the stored running statistics and leave them untouched,
//! but gradients still flow through the input. When a replica-sync group is
//! attached, batch statistics are all-reduce-averaged across replicas before
//! they are applied or accumulated.

use std::sync::Arc;

use burn::config::Config;
use burn::module::{Ignored, Module, Param, RunningState};
use burn::nn::Initializer;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::dist::ProcessGroup;

/// Configuration for [`FreezableBatchNorm`].
#[derive(Config, Debug)]
pub struct FreezableBatchNormConfig {
    /// Number of channels
    pub num_features: usize,

    /// Momentum for the running-statistics update
    #[config(default = 0.1)]
    pub momentum: f64,

    /// Numerical stability epsilon
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

impl FreezableBatchNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FreezableBatchNorm<B> {
        FreezableBatchNorm {
            gamma: Initializer::Ones.init([self.num_features], device),
            beta: Initializer::Zeros.init([self.num_features], device),
            running_mean: RunningState::new(Tensor::zeros([self.num_features], device)),
            running_var: RunningState::new(Tensor::ones([self.num_features], device)),
            momentum: self.momentum,
            epsilon: self.epsilon,
            frozen: false,
            sync: Ignored(None),
        }
    }
}

/// Batch normalization over `[batch, channels, height, width]` inputs.
#[derive(Module, Debug)]
pub struct FreezableBatchNorm<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
    running_mean: RunningState<Tensor<B, 1>>,
    running_var: RunningState<Tensor<B, 1>>,
    momentum: f64,
    epsilon: f64,
    frozen: bool,
    sync: Ignored<Option<Arc<ProcessGroup>>>,
}

impl<B: Backend> FreezableBatchNorm<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.frozen || !B::ad_enabled() {
            self.forward_stored(input)
        } else {
            self.forward_batch(input)
        }
    }

    /// Normalize with the stored running statistics; never updates them.
    fn forward_stored(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = input.dims()[1];
        let mean = self.running_mean.value().detach().reshape([1, channels, 1, 1]);
        let var = self.running_var.value().detach().reshape([1, channels, 1, 1]);
        self.affine(input.sub(mean).div(var.add_scalar(self.epsilon).sqrt()), channels)
    }

    /// Normalize with this batch's statistics and fold them into the running
    /// values.
    fn forward_batch(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = input.dims();
        let flat = input
            .clone()
            .swap_dims(0, 1)
            .reshape([channels, batch * height * width]);

        let mut mean = flat.clone().mean_dim(1);
        let mut mean_sq = flat.powf_scalar(2.0).mean_dim(1);
        if let Some(group) = self.sync.0.as_ref() {
            mean = sync_channel_stat(group, mean);
            mean_sq = sync_channel_stat(group, mean_sq);
        }
        let var = mean_sq.sub(mean.clone().powf_scalar(2.0));

        let momentum = self.momentum;
        let running_mean = self.running_mean.value();
        self.running_mean.update(
            running_mean
                .mul_scalar(1.0 - momentum)
                .add(mean.clone().detach().reshape([channels]).mul_scalar(momentum)),
        );
        let running_var = self.running_var.value();
        self.running_var.update(
            running_var
                .mul_scalar(1.0 - momentum)
                .add(var.clone().detach().reshape([channels]).mul_scalar(momentum)),
        );

        let mean = mean.reshape([1, channels, 1, 1]);
        let var = var.reshape([1, channels, 1, 1]);
        self.affine(input.sub(mean).div(var.add_scalar(self.epsilon).sqrt()), channels)
    }

    fn affine(&self, normalized: Tensor<B, 4>, channels: usize) -> Tensor<B, 4> {
        normalized
            .mul(self.gamma.val().reshape([1, channels, 1, 1]))
            .add(self.beta.val().reshape([1, channels, 1, 1]))
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn with_frozen(mut self, frozen: bool) -> Self {
        self.frozen = frozen;
        self
    }

    pub fn with_sync_group(mut self, group: Option<Arc<ProcessGroup>>) -> Self {
        self.sync = Ignored(group);
        self
    }

    /// Current running statistics (mean, variance).
    pub fn running_stats(&self) -> (Tensor<B, 1>, Tensor<B, 1>) {
        (self.running_mean.value(), self.running_var.value())
    }
}

/// Average a per-channel statistic across all replicas. The reduced value
/// re-enters the graph as a constant. A collective failure here means the
/// group is gone; the run cannot continue.
fn sync_channel_stat<B: Backend>(group: &ProcessGroup, stat: Tensor<B, 2>) -> Tensor<B, 2> {
    let device = stat.device();
    let dims = stat.dims();
    let mut values = match stat.detach().into_data().to_vec::<f32>() {
        Ok(values) => values,
        Err(err) => panic!("batch-norm statistic readback failed: {err:?}"),
    };
    if let Err(err) = group.all_reduce_mean(&mut values) {
        panic!("batch-norm statistic sync failed: {err}");
    }
    Tensor::from_data(TensorData::new(values, dims), &device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn stats_vec(norm: &FreezableBatchNorm<TestBackend>) -> (Vec<f32>, Vec<f32>) {
        let (mean, var) = norm.running_stats();
        (
            mean.into_data().to_vec::<f32>().unwrap(),
            var.into_data().to_vec::<f32>().unwrap(),
        )
    }

    #[test]
    fn test_training_forward_updates_running_stats() {
        let device = Default::default();
        let norm = FreezableBatchNormConfig::new(2).init::<TestBackend>(&device);
        let (mean_before, _) = stats_vec(&norm);

        let input = Tensor::<TestBackend, 4>::ones([2, 2, 3, 3], &device).mul_scalar(5.0);
        let _ = norm.forward(input);

        let (mean_after, _) = stats_vec(&norm);
        assert_ne!(mean_before, mean_after);
        // Momentum 0.1 pulls the zero-initialized mean toward 5.
        assert!((mean_after[0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_frozen_forward_preserves_running_stats() {
        let device = Default::default();
        let norm = FreezableBatchNormConfig::new(2)
            .init::<TestBackend>(&device)
            .with_frozen(true);
        let (mean_before, var_before) = stats_vec(&norm);

        let input = Tensor::<TestBackend, 4>::ones([2, 2, 3, 3], &device).mul_scalar(5.0);
        let _ = norm.forward(input);

        let (mean_after, var_after) = stats_vec(&norm);
        assert_eq!(mean_before, mean_after);
        assert_eq!(var_before, var_after);
    }

    #[test]
    fn test_frozen_normalizes_with_stored_stats() {
        let device = Default::default();
        let norm = FreezableBatchNormConfig::new(1)
            .init::<TestBackend>(&device)
            .with_frozen(true);

        // Running mean 0, var 1: frozen output equals the input.
        let input = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, -2.0, 0.5, 3.0], [1, 1, 2, 2]),
            &device,
        );
        let output = norm.forward(input.clone());
        let input_vec = input.into_data().to_vec::<f32>().unwrap();
        let output_vec = output.into_data().to_vec::<f32>().unwrap();
        for (a, b) in input_vec.iter().zip(output_vec.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_freeze_round_trip() {
        let device = Default::default();
        let norm = FreezableBatchNormConfig::new(2).init::<TestBackend>(&device);
        assert!(!norm.is_frozen());
        let norm = norm.with_frozen(true);
        assert!(norm.is_frozen());
        let norm = norm.with_frozen(false);
        assert!(!norm.is_frozen());
    }
}
