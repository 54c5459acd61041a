//! Convolutional classifier backbone.
//!
//! Three conv blocks (conv + freezable batch norm + ReLU + max pool) feed a
//! token-pooled linear head. The penultimate feature map doubles as the token
//! embedding (`[batch, tokens, channels]`) perturbed by embedding-space
//! adversarial probing.

use std::sync::Arc;

use burn::config::Config;
use burn::module::Module;
use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    pool::{MaxPool2d, MaxPool2dConfig},
    Linear, LinearConfig, PaddingConfig2d, Relu,
};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::dist::ProcessGroup;
use crate::model::norm::{FreezableBatchNorm, FreezableBatchNormConfig};
use crate::model::{DifferentiableClassifier, NormFreeze};

/// Configuration for the [`ConvClassifier`].
#[derive(Config, Debug)]
pub struct ConvClassifierConfig {
    /// Number of output classes
    pub num_classes: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = 3)]
    pub in_channels: usize,

    /// Base number of convolutional filters
    #[config(default = 16)]
    pub base_filters: usize,

    /// Width of the hidden classifier layer
    #[config(default = 128)]
    pub hidden_size: usize,
}

impl ConvClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvClassifier<B> {
        let base = self.base_filters;
        ConvClassifier {
            conv1: ConvBlock::new(self.in_channels, base, device),
            conv2: ConvBlock::new(base, base * 2, device),
            conv3: ConvBlock::new(base * 2, base * 4, device),
            fc1: LinearConfig::new(base * 4, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            relu: Relu::new(),
            num_classes: self.num_classes,
        }
    }
}

/// Conv2d + batch norm + ReLU + 2x2 max pool.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: FreezableBatchNorm<B>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            norm: FreezableBatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Image classifier with a token-pooled head.
#[derive(Module, Debug)]
pub struct ConvClassifier<B: Backend> {
    conv1: ConvBlock<B>,
    conv2: ConvBlock<B>,
    conv3: ConvBlock<B>,
    fc1: Linear<B>,
    fc2: Linear<B>,
    relu: Relu,
    num_classes: usize,
}

impl<B: Backend> ConvClassifier<B> {
    fn features(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(x);
        let x = self.conv2.forward(x);
        self.conv3.forward(x)
    }

    /// Penultimate representation as `[batch, tokens, channels]`.
    pub fn embed(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let features = self.features(x);
        let [batch, channels, height, width] = features.dims();
        features
            .reshape([batch, channels, height * width])
            .swap_dims(1, 2)
    }

    /// Forward pass producing class logits.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let tokens = self.embed(x);
        self.head(tokens)
    }

    fn head(&self, tokens: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, _tokens, channels] = tokens.dims();
        let pooled = tokens.mean_dim(1).reshape([batch, channels]);
        let x = self.fc1.forward(pooled);
        let x = self.relu.forward(x);
        self.fc2.forward(x)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Attach (or detach) the replica group used to synchronize batch-norm
    /// statistics across workers.
    pub fn with_sync_group(mut self, group: Option<Arc<ProcessGroup>>) -> Self {
        self.conv1.norm = self.conv1.norm.with_sync_group(group.clone());
        self.conv2.norm = self.conv2.norm.with_sync_group(group.clone());
        self.conv3.norm = self.conv3.norm.with_sync_group(group);
        self
    }
}

impl<B: Backend> DifferentiableClassifier<B> for ConvClassifier<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }

    fn embed_logits(&self, images: Tensor<B, 4>) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let tokens = self.embed(images);
        let logits = self.head(tokens.clone());
        (tokens, logits)
    }

    fn logits_from_tokens(&self, tokens: Tensor<B, 3>) -> Tensor<B, 2> {
        self.head(tokens)
    }
}

impl<B: Backend> NormFreeze for ConvClassifier<B> {
    fn norms_frozen(&self) -> bool {
        self.conv1.norm.is_frozen()
    }

    fn with_norms_frozen(mut self, frozen: bool) -> Self {
        self.conv1.norm = self.conv1.norm.with_frozen(frozen);
        self.conv2.norm = self.conv2.norm.with_frozen(frozen);
        self.conv3.norm = self.conv3.norm.with_frozen(frozen);
        self
    }
}
