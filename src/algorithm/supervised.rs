//! Fully supervised baseline.
//!
//! Trains on the labeled batches only and ignores the unlabeled source.
//! Useful as a registry baseline when judging what the unsupervised signal
//! buys.

use burn::module::{AutodiffModule, Module};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::Optimizer;
use burn::record::{Record, Recorder};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

use crate::algorithm::{apply_update, Algorithm, StepContext};
use crate::data::{LabeledBatch, UnlabeledBatch};
use crate::dist::parameter_vector;
use crate::error::{Error, Result};
use crate::metrics::Scalars;
use crate::model::ConvClassifier;
use crate::train::checkpoint::{CheckpointPaths, CheckpointRecorder};

/// The baseline registers no options of its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisedOptions {}

/// Supervised cross-entropy training.
pub struct FullySupervised<B: AutodiffBackend, O> {
    model: ConvClassifier<B>,
    optimizer: Option<O>,
    device: B::Device,
}

impl<B, O> FullySupervised<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ConvClassifier<B>, B>,
{
    pub fn new(model: ConvClassifier<B>, optimizer: O, device: B::Device) -> Self {
        Self {
            model,
            optimizer: Some(optimizer),
            device,
        }
    }
}

impl<B, O> Algorithm<B> for FullySupervised<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ConvClassifier<B>, B>,
    O::Record: Record<B>,
{
    fn train_step(
        &mut self,
        labeled: LabeledBatch<B>,
        _unlabeled: UnlabeledBatch<B>,
        ctx: &StepContext<'_>,
    ) -> Result<Scalars> {
        let logits = self.model.forward(labeled.images);
        let sup_loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, labeled.targets);

        let model = self.model.clone();
        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| Error::Training("optimizer state unavailable".to_string()))?;
        self.model = apply_update(model, optimizer, sup_loss.clone(), ctx)?;

        let value = sup_loss.into_scalar().elem::<f64>();
        let mut scalars = Scalars::new();
        scalars.insert("train/sup_loss".to_string(), value);
        scalars.insert("train/total_loss".to_string(), value);
        Ok(scalars)
    }

    fn eval_logits(&self, images: Tensor<B::InnerBackend, 4>) -> Tensor<B::InnerBackend, 2> {
        self.model.valid().forward(images)
    }

    fn save_checkpoint(&self, paths: &CheckpointPaths) -> Result<()> {
        paths.ensure_dir()?;
        self.model
            .clone()
            .save_file(paths.model_file(), &CheckpointRecorder::new())
            .map_err(|e| Error::Serialization(format!("failed to save model: {e:?}")))?;
        let optimizer = self
            .optimizer
            .as_ref()
            .ok_or_else(|| Error::Training("optimizer state unavailable".to_string()))?;
        CheckpointRecorder::new()
            .record(optimizer.to_record(), paths.optimizer_file())
            .map_err(|e| Error::Serialization(format!("failed to save optimizer: {e:?}")))?;
        Ok(())
    }

    fn load_checkpoint(&mut self, paths: &CheckpointPaths) -> Result<()> {
        self.model = self
            .model
            .clone()
            .load_file(paths.model_file(), &CheckpointRecorder::new(), &self.device)
            .map_err(|e| Error::Serialization(format!("failed to load model: {e:?}")))?;
        let record = CheckpointRecorder::new()
            .load(paths.optimizer_file(), &self.device)
            .map_err(|e| Error::Serialization(format!("failed to load optimizer: {e:?}")))?;
        let optimizer = self
            .optimizer
            .take()
            .ok_or_else(|| Error::Training("optimizer state unavailable".to_string()))?;
        self.optimizer = Some(optimizer.load_record(record));
        Ok(())
    }

    fn parameter_vector(&self) -> Vec<f32> {
        parameter_vector::<B, _>(&self.model)
    }
}
