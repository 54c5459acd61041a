//! Worker assembly: data, model, optimizer, algorithm, orchestrator.

pub mod checkpoint;
pub mod orchestrator;
pub mod scheduler;

use std::sync::Arc;

use burn::grad_clipping::GradientClippingConfig;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, Optimizer, SgdConfig};
use burn::record::Record;
use burn::tensor::backend::{AutodiffBackend, Backend};

use crate::algorithm::supervised::FullySupervised;
use crate::algorithm::vat::Vat;
use crate::algorithm::{Algorithm, AlgorithmConfig};
use crate::config::{OptimKind, TrainConfig};
use crate::data::synthetic;
use crate::data::{build_rank_aware, eval_batches, LabeledCycler, Shard, UnlabeledCycler};
use crate::dist::{ProcessGroup, ReplicaSync, Topology};
use crate::error::Result;
use crate::metrics::{MetricSink, RankGated, Scalars};
use crate::model::{ConvClassifier, ConvClassifierConfig};

pub use checkpoint::{CheckpointPaths, TrainState};
pub use orchestrator::{Loaders, Orchestrator, RunPlan};
pub use scheduler::WarmupCosineSchedule;

/// What one worker hands back after training.
pub struct WorkerOutput {
    /// Final evaluation summary (populated on rank 0)
    pub result: Scalars,
    /// Flattened final model parameters, for replica-consistency checks
    pub parameters: Vec<f32>,
}

/// Run one worker end to end: rank-aware data construction, model and
/// optimizer build, then the orchestrated training loop.
pub fn run_worker<B, S>(
    cfg: &TrainConfig,
    topo: Topology,
    group: Option<Arc<ProcessGroup>>,
    sink: S,
    device: B::Device,
) -> Result<WorkerOutput>
where
    B: AutodiffBackend,
    S: MetricSink,
{
    // Identical seed on every rank: replicas initialize the same parameters
    // and shuffle the same labeled permutation before sharding.
    B::seed(cfg.seed);

    let data = build_rank_aware(group.as_deref(), || synthetic::generate(&cfg.data))?;
    let image_dims = [cfg.data.in_channels, cfg.data.image_size, cfg.data.image_size];
    let shard = Shard {
        rank: topo.rank,
        world_size: topo.world_size,
    };
    let per_device = cfg.per_device_batch_size();
    let labeled = LabeledCycler::new(data.labeled, image_dims, per_device, cfg.seed, shard)?;
    let unlabeled = UnlabeledCycler::new(
        data.unlabeled,
        image_dims,
        per_device * cfg.uratio,
        cfg.seed.wrapping_add(1),
        shard,
    )?;
    let eval = eval_batches::<B::InnerBackend>(&data.eval, image_dims, cfg.eval_batch_size, &device);

    let sync = group.clone().map(ReplicaSync::new);
    let algorithm = build_algorithm::<B>(cfg, group, &device)?;

    let plan = RunPlan {
        num_train_iter: cfg.num_train_iter,
        epoch: cfg.epoch,
        num_eval_iter: cfg.num_eval_iter,
        resume: cfg.resume,
        load_dir: cfg.load_path.clone(),
        save_dir: cfg.save_path(),
    };
    let scheduler = WarmupCosineSchedule::new(cfg.lr, cfg.num_warmup_iter, cfg.num_train_iter);
    let sink = RankGated::new(topo.rank, sink);

    let mut orchestrator = Orchestrator::new(
        plan,
        algorithm,
        scheduler,
        Loaders {
            labeled,
            unlabeled,
            eval,
        },
        sink,
        topo,
        sync,
        device,
    )?;

    let result = orchestrator.run()?;
    Ok(WorkerOutput {
        result,
        parameters: orchestrator.parameter_vector(),
    })
}

/// Instantiate the configured algorithm with the configured optimizer.
pub fn build_algorithm<B: AutodiffBackend>(
    cfg: &TrainConfig,
    group: Option<Arc<ProcessGroup>>,
    device: &B::Device,
) -> Result<Box<dyn Algorithm<B>>> {
    let model = ConvClassifierConfig::new(cfg.data.num_classes)
        .with_in_channels(cfg.data.in_channels)
        .with_base_filters(cfg.base_filters)
        .with_hidden_size(cfg.hidden_size)
        .init::<B>(device)
        .with_sync_group(group.clone());

    // Replicas may race the backend RNG during initialization; rank 0's
    // parameters are the ones every replica starts from.
    let model = match &group {
        Some(g) => ReplicaSync::new(g.clone()).broadcast_parameters(model)?,
        None => model,
    };

    match cfg.optim {
        OptimKind::Sgd => {
            let mut optim = SgdConfig::new()
                .with_momentum(Some(
                    MomentumConfig::new()
                        .with_momentum(cfg.momentum)
                        .with_nesterov(true),
                ))
                .with_weight_decay(Some(WeightDecayConfig::new(cfg.weight_decay)));
            if cfg.clip_grad > 0.0 {
                optim = optim
                    .with_gradient_clipping(Some(GradientClippingConfig::Norm(cfg.clip_grad as f32)));
            }
            Ok(boxed_algorithm(
                cfg,
                model,
                optim.init::<B, ConvClassifier<B>>(),
                device,
            ))
        }
        OptimKind::Adam => {
            let mut optim =
                AdamConfig::new().with_weight_decay(Some(WeightDecayConfig::new(cfg.weight_decay)));
            if cfg.clip_grad > 0.0 {
                optim = optim
                    .with_grad_clipping(Some(GradientClippingConfig::Norm(cfg.clip_grad as f32)));
            }
            Ok(boxed_algorithm(
                cfg,
                model,
                optim.init::<B, ConvClassifier<B>>(),
                device,
            ))
        }
    }
}

fn boxed_algorithm<B, O>(
    cfg: &TrainConfig,
    model: ConvClassifier<B>,
    optimizer: O,
    device: &B::Device,
) -> Box<dyn Algorithm<B>>
where
    B: AutodiffBackend,
    O: Optimizer<ConvClassifier<B>, B> + 'static,
    O::Record: Record<B>,
{
    match &cfg.algorithm {
        AlgorithmConfig::Vat(opts) => Box::new(Vat::new(
            model,
            optimizer,
            opts.clone(),
            cfg.ulb_loss_ratio,
            cfg.seed,
            device.clone(),
        )),
        AlgorithmConfig::FullySupervised(_) => {
            Box::new(FullySupervised::new(model, optimizer, device.clone()))
        }
    }
}
