//! Virtual Adversarial Training.
//!
//! For each unlabeled batch, a power iteration searches for the bounded input
//! direction that maximizes the KL divergence between the model's clean
//! prediction and its perturbed prediction, then the model is penalized for
//! its sensitivity along that direction. The search runs with frozen
//! normalization statistics and its probe gradients never reach the optimizer.

use burn::module::{AutodiffModule, Module};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::Optimizer;
use burn::record::{Record, Recorder};
use burn::tensor::activation;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor, TensorData};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::algorithm::{apply_update, Algorithm, BatchNormController, StepContext};
use crate::data::{LabeledBatch, UnlabeledBatch};
use crate::dist::parameter_vector;
use crate::error::{Error, Result};
use crate::metrics::Scalars;
use crate::model::{ConvClassifier, DifferentiableClassifier};
use crate::train::checkpoint::{CheckpointPaths, CheckpointRecorder};

/// Options registered by the VAT algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VatOptions {
    /// Perturbation magnitude applied along the adversarial direction
    pub vat_eps: f64,
    /// Seed scale of the power-iteration probe
    pub vat_xi: f64,
    /// Number of power-iteration rounds
    pub vat_iters: usize,
    /// Perturb the penultimate embedding instead of the raw input
    pub vat_embed: bool,
    /// Fraction of training over which the unsupervised weight ramps to 1
    pub unsup_warm_up: f64,
    /// Entropy minimization weight
    pub ent_loss_ratio: f64,
}

impl Default for VatOptions {
    fn default() -> Self {
        Self {
            vat_eps: 6.0,
            vat_xi: 1e-6,
            vat_iters: 1,
            vat_embed: false,
            unsup_warm_up: 0.4,
            ent_loss_ratio: 0.06,
        }
    }
}

impl VatOptions {
    pub fn validate(&self) -> Result<()> {
        if self.vat_eps <= 0.0 {
            return Err(Error::InvalidArgument(
                "vat_eps must be positive".to_string(),
            ));
        }
        if self.vat_xi <= 0.0 {
            return Err(Error::InvalidArgument(
                "vat_xi must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.unsup_warm_up) {
            return Err(Error::InvalidArgument(
                "unsup_warm_up must lie in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Normalize each example's perturbation to unit L2 norm over all non-batch
/// dimensions. Only rank-3 (sequence) and rank-4 (image) tensors are
/// meaningful perturbation targets; anything else is rejected outright.
pub fn l2_normalize<B: Backend, const D: usize>(d: Tensor<B, D>) -> Result<Tensor<B, D>> {
    if D != 3 && D != 4 {
        return Err(Error::InvalidArgument(format!(
            "unsupported perturbation rank {D}: expected rank 3 or 4"
        )));
    }
    let dims = d.dims();
    let flat = d.flatten::<2>(1, D - 1);
    let norm = flat
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .add_scalar(1e-16);
    Ok(flat.div(norm).reshape(dims))
}

/// `KL(q ‖ p)` from logits: softmax(q)-weighted difference of log-softmaxes,
/// summed over classes and averaged over the batch. Directional.
pub fn kl_div_with_logits<B: Backend>(q_logit: Tensor<B, 2>, p_logit: Tensor<B, 2>) -> Tensor<B, 1> {
    let q = activation::softmax(q_logit.clone(), 1);
    let logq = activation::log_softmax(q_logit, 1);
    let logp = activation::log_softmax(p_logit, 1);

    let qlogq = q.clone().mul(logq).sum_dim(1).mean();
    let qlogp = q.mul(logp).sum_dim(1).mean();
    qlogq.sub(qlogp)
}

/// Entropy of the predicted distribution, averaged over the batch.
pub fn entropy_loss<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1> {
    let p = activation::softmax(logits.clone(), 1);
    let logp = activation::log_softmax(logits, 1);
    p.mul(logp).sum_dim(1).mean().neg()
}

/// Linear ramp of the unsupervised loss weight over the first
/// `warm_up` share of training, then held at 1.
pub fn unsup_warmup_coefficient(it: usize, warm_up: f64, num_train_iter: usize) -> f64 {
    if warm_up <= 0.0 {
        return 1.0;
    }
    (it as f64 / (warm_up * num_train_iter as f64)).clamp(0.0, 1.0)
}

/// Parameters of one adversarial-direction search.
#[derive(Debug, Clone)]
pub struct PerturbationSearch {
    pub eps: f64,
    pub xi: f64,
    pub num_iters: usize,
    /// Seeds the random probe direction; derived from the run seed and the
    /// iteration so a resumed run replays the identical search.
    pub seed: u64,
}

fn normal_like<B: Backend, const D: usize>(
    dims: [usize; D],
    rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Tensor<B, D> {
    let count = dims.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_data(TensorData::new(values, dims), device)
}

/// Power-iteration search for the worst-case bounded perturbation of
/// `target`, followed by the consistency loss at `target + r_adv`.
///
/// `forward` evaluates the frozen model at a perturbed target; `ul_y` is the
/// detached reference prediction. Each probe round differentiates the KL with
/// respect to the perturbation only: the probe's parameter gradients live in
/// a gradient container that is dropped on the spot, so they cannot leak into
/// the optimizer step. The returned loss is differentiable with respect to
/// the model parameters but not the final perturbation.
pub fn adversarial_loss<B, const D: usize, F>(
    forward: F,
    target: Tensor<B, D>,
    ul_y: Tensor<B, 2>,
    search: &PerturbationSearch,
) -> Result<Tensor<B, 1>>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, D>) -> Tensor<B, 2>,
{
    let device = target.device();
    let mut rng = ChaCha8Rng::seed_from_u64(search.seed);
    let mut d: Tensor<B::InnerBackend, D> = normal_like(target.dims(), &mut rng, &device);

    for _ in 0..search.num_iters {
        let probe = l2_normalize(d)?.mul_scalar(search.xi);
        let probe = Tensor::<B, D>::from_inner(probe).require_grad();
        let y_hat = forward(target.clone().add(probe.clone()));
        let delta_kl = kl_div_with_logits(ul_y.clone(), y_hat);
        let grads = delta_kl.backward();
        d = probe.grad(&grads).ok_or_else(|| {
            Error::Training("adversarial probe received no gradient".to_string())
        })?;
    }

    let r_adv = l2_normalize(d)?.mul_scalar(search.eps);
    let y_hat = forward(target.add(Tensor::from_inner(r_adv)));
    Ok(kl_div_with_logits(ul_y, y_hat))
}

/// The VAT training algorithm.
pub struct Vat<B: AutodiffBackend, O> {
    model: ConvClassifier<B>,
    optimizer: Option<O>,
    opts: VatOptions,
    /// Overall unsupervised loss weight (`ulb_loss_ratio`)
    lambda_u: f64,
    bn: BatchNormController,
    seed: u64,
    device: B::Device,
}

impl<B, O> Vat<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ConvClassifier<B>, B>,
{
    pub fn new(
        model: ConvClassifier<B>,
        optimizer: O,
        opts: VatOptions,
        lambda_u: f64,
        seed: u64,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            optimizer: Some(optimizer),
            opts,
            lambda_u,
            bn: BatchNormController::new(),
            seed,
            device,
        }
    }

}

impl<B, O> Algorithm<B> for Vat<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ConvClassifier<B>, B>,
    O::Record: Record<B>,
{
    fn train_step(
        &mut self,
        labeled: LabeledBatch<B>,
        unlabeled: UnlabeledBatch<B>,
        ctx: &StepContext<'_>,
    ) -> Result<Scalars> {
        let logits_lb = self.model.forward(labeled.images);
        let sup_loss = CrossEntropyLossConfig::new()
            .init(&logits_lb.device())
            .forward(logits_lb, labeled.targets);

        let search = PerturbationSearch {
            eps: self.opts.vat_eps,
            xi: self.opts.vat_xi,
            num_iters: self.opts.vat_iters,
            seed: self.seed.wrapping_add(ctx.it as u64),
        };

        // The reference prediction and every probing pass run with frozen
        // normalization statistics.
        let frozen = self.bn.freeze(self.model.clone());
        let (ul_y, unsup_loss) = if self.opts.vat_embed {
            let (tokens, ul_y) = frozen.embed_logits(unlabeled.images);
            let reference = ul_y.clone().detach();
            let loss = adversarial_loss(
                |tokens| frozen.logits_from_tokens(tokens),
                tokens.detach(),
                reference,
                &search,
            )?;
            (ul_y, loss)
        } else {
            let ul_y = frozen.logits(unlabeled.images.clone());
            let reference = ul_y.clone().detach();
            let loss = adversarial_loss(
                |images| frozen.logits(images),
                unlabeled.images,
                reference,
                &search,
            )?;
            (ul_y, loss)
        };
        self.model = self.bn.unfreeze(frozen);

        let ent_loss = entropy_loss(ul_y);
        let warmup = unsup_warmup_coefficient(ctx.it, self.opts.unsup_warm_up, ctx.num_train_iter);
        let total_loss = sup_loss
            .clone()
            .add(unsup_loss.clone().mul_scalar(self.lambda_u * warmup))
            .add(ent_loss.clone().mul_scalar(self.opts.ent_loss_ratio));

        let model = self.model.clone();
        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| Error::Training("optimizer state unavailable".to_string()))?;
        self.model = apply_update(model, optimizer, total_loss.clone(), ctx)?;

        let mut scalars = Scalars::new();
        scalars.insert(
            "train/sup_loss".to_string(),
            sup_loss.into_scalar().elem::<f64>(),
        );
        scalars.insert(
            "train/unsup_loss".to_string(),
            unsup_loss.into_scalar().elem::<f64>(),
        );
        scalars.insert(
            "train/loss_entmin".to_string(),
            ent_loss.into_scalar().elem::<f64>(),
        );
        scalars.insert(
            "train/total_loss".to_string(),
            total_loss.into_scalar().elem::<f64>(),
        );
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

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;
    type InnerBackend = NdArray;

    fn logits_pair(device: &<InnerBackend as Backend>::Device) -> (Tensor<InnerBackend, 2>, Tensor<InnerBackend, 2>) {
        let q = Tensor::from_data(
            TensorData::new(vec![1.0f32, -0.5, 0.25, 2.0, 0.0, -1.0], [2, 3]),
            device,
        );
        let p = Tensor::from_data(
            TensorData::new(vec![0.2f32, 0.4, -0.3, -1.0, 0.5, 0.7], [2, 3]),
            device,
        );
        (q, p)
    }

    #[test]
    fn test_kl_zero_for_equal_logits() {
        let device = Default::default();
        let (q, _) = logits_pair(&device);
        let kl: f64 = kl_div_with_logits(q.clone(), q).into_scalar().elem();
        assert!(kl.abs() < 1e-6);
    }

    #[test]
    fn test_kl_non_negative_and_directional() {
        let device = Default::default();
        let (q, p) = logits_pair(&device);
        let forward: f64 = kl_div_with_logits(q.clone(), p.clone()).into_scalar().elem();
        let backward: f64 = kl_div_with_logits(p, q).into_scalar().elem();
        assert!(forward > 0.0);
        assert!(backward > 0.0);
        assert!((forward - backward).abs() > 1e-6);
    }

    #[test]
    fn test_l2_normalize_unit_norm_rank4() {
        let device = Default::default();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let d = normal_like::<InnerBackend, 4>([3, 2, 4, 4], &mut rng, &device);
        let normalized = l2_normalize(d).unwrap();
        let norms = normalized
            .powf_scalar(2.0)
            .flatten::<2>(1, 3)
            .sum_dim(1)
            .sqrt()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        for norm in norms {
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_l2_normalize_unit_norm_rank3() {
        let device = Default::default();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let d = normal_like::<InnerBackend, 3>([2, 5, 6], &mut rng, &device);
        let normalized = l2_normalize(d).unwrap();
        let norms = normalized
            .powf_scalar(2.0)
            .flatten::<2>(1, 2)
            .sum_dim(1)
            .sqrt()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        for norm in norms {
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_l2_normalize_rejects_other_ranks() {
        let device = Default::default();
        let d = Tensor::<InnerBackend, 2>::ones([2, 3], &device);
        assert!(l2_normalize(d).is_err());
    }

    #[test]
    fn test_entropy_loss_peaks_for_uniform_prediction() {
        let device = Default::default();
        let uniform = Tensor::<InnerBackend, 2>::zeros([1, 4], &device);
        let peaked = Tensor::<InnerBackend, 2>::from_data(
            TensorData::new(vec![20.0f32, 0.0, 0.0, 0.0], [1, 4]),
            &device,
        );
        let h_uniform: f64 = entropy_loss(uniform).into_scalar().elem();
        let h_peaked: f64 = entropy_loss(peaked).into_scalar().elem();
        assert!((h_uniform - (4.0f64).ln()).abs() < 1e-4);
        assert!(h_peaked < 1e-3);
    }

    #[test]
    fn test_warmup_coefficient_schedule() {
        assert_eq!(unsup_warmup_coefficient(0, 0.4, 1000), 0.0);
        assert!((unsup_warmup_coefficient(200, 0.4, 1000) - 0.5).abs() < 1e-12);
        assert_eq!(unsup_warmup_coefficient(400, 0.4, 1000), 1.0);
        assert_eq!(unsup_warmup_coefficient(999, 0.4, 1000), 1.0);
        // Zero warmup fraction means no ramp at all.
        assert_eq!(unsup_warmup_coefficient(0, 0.0, 1000), 1.0);
    }

    #[test]
    fn test_adversarial_loss_deterministic_under_fixed_seed() {
        let device = Default::default();
        let config = crate::model::ConvClassifierConfig::new(4)
            .with_in_channels(1)
            .with_base_filters(4);
        <TestBackend as Backend>::seed(11);
        let model = config.init::<TestBackend>(&device);

        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let images = normal_like::<TestBackend, 4>([2, 1, 16, 16], &mut rng, &device);
        let ul_y = model.forward(images.clone()).detach();

        let search = PerturbationSearch {
            eps: 6.0,
            xi: 1e-6,
            num_iters: 1,
            seed: 42,
        };
        let first: f64 = adversarial_loss(|x| model.forward(x), images.clone(), ul_y.clone(), &search)
            .unwrap()
            .into_scalar()
            .elem();
        let second: f64 = adversarial_loss(|x| model.forward(x), images, ul_y, &search)
            .unwrap()
            .into_scalar()
            .elem();
        assert!(first >= 0.0);
        assert_eq!(first, second);
    }
}
