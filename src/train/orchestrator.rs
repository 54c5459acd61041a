//! The top-level training loop.
//!
//! Drives the active algorithm's `train_step` across a fixed iteration
//! budget, partitioned into equal epochs for reporting cadence. Handles the
//! learning-rate schedule, resume-from-checkpoint, periodic rank-0 evaluation
//! and checkpointing, and the optional warmup/finetune stages around the
//! main loop.

use std::path::PathBuf;

use burn::nn::loss::CrossEntropyLossConfig;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use tracing::{debug, info, warn};

use crate::algorithm::{Algorithm, StepContext};
use crate::data::{LabeledBatch, LabeledCycler, UnlabeledCycler};
use crate::dist::{ReplicaSync, Topology};
use crate::error::{Error, Result};
use crate::metrics::{accuracy, MetricSink, Scalars};
use crate::train::checkpoint::{CheckpointManager, CheckpointPaths, TrainState};
use crate::train::scheduler::WarmupCosineSchedule;

/// The three batch sources feeding one worker.
pub struct Loaders<B: AutodiffBackend> {
    pub labeled: LabeledCycler,
    pub unlabeled: UnlabeledCycler,
    pub eval: Vec<LabeledBatch<B::InnerBackend>>,
}

/// Loop parameters, validated before any worker resources are committed.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub num_train_iter: usize,
    /// Number of reporting epochs; must divide the iteration budget evenly
    pub epoch: usize,
    pub num_eval_iter: usize,
    pub resume: bool,
    pub load_dir: Option<PathBuf>,
    pub save_dir: PathBuf,
}

impl RunPlan {
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
        if self.resume && self.load_dir.is_none() {
            return Err(Error::Config(
                "resume requires a load path".to_string(),
            ));
        }
        Ok(())
    }

    fn iters_per_epoch(&self) -> usize {
        self.num_train_iter / self.epoch
    }
}

pub struct Orchestrator<B: AutodiffBackend, S: MetricSink> {
    plan: RunPlan,
    algorithm: Box<dyn Algorithm<B>>,
    scheduler: WarmupCosineSchedule,
    loaders: Loaders<B>,
    sink: S,
    topo: Topology,
    sync: Option<ReplicaSync>,
    state: TrainState,
    device: B::Device,
}

impl<B, S> Orchestrator<B, S>
where
    B: AutodiffBackend,
    S: MetricSink,
{
    /// Validates the plan before anything heavier happens.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan: RunPlan,
        algorithm: Box<dyn Algorithm<B>>,
        scheduler: WarmupCosineSchedule,
        loaders: Loaders<B>,
        sink: S,
        topo: Topology,
        sync: Option<ReplicaSync>,
        device: B::Device,
    ) -> Result<Self> {
        plan.validate()?;
        Ok(Self {
            plan,
            algorithm,
            scheduler,
            loaders,
            sink,
            topo,
            sync,
            state: TrainState::default(),
            device,
        })
    }

    /// Run training to the end of the iteration budget and return the final
    /// evaluation summary.
    pub fn run(&mut self) -> Result<Scalars> {
        self.maybe_resume();

        self.algorithm.warmup()?;

        let iters_per_epoch = self.plan.iters_per_epoch();
        let start = self.state.it;
        if start > 0 {
            info!("continuing from iteration {}", start);
        }

        for it in start..self.plan.num_train_iter {
            let lr = self.scheduler.lr_at(it);
            let labeled = self.loaders.labeled.batch_at::<B>(it, &self.device);
            let unlabeled = self.loaders.unlabeled.batch_at::<B>(it, &self.device);
            let ctx = StepContext {
                it,
                num_train_iter: self.plan.num_train_iter,
                lr,
                sync: self.sync.as_ref(),
            };

            let scalars = self.algorithm.train_step(labeled, unlabeled, &ctx)?;
            self.state.it = it + 1;
            self.sink.log_scalars(it, &scalars);

            if (it + 1) % self.plan.num_eval_iter == 0 && self.topo.rank == 0 {
                let eval = self.evaluate();
                self.track_best(&eval, it);
                self.sink.log_scalars(it, &eval);
                self.save_checkpoint()?;
            }

            if (it + 1) % iters_per_epoch == 0 {
                debug!(
                    "epoch {}/{} complete at iteration {}",
                    (it + 1) / iters_per_epoch,
                    self.plan.epoch,
                    it + 1
                );
            }
        }

        self.algorithm.finetune()?;

        if self.topo.rank == 0 {
            let eval = self.evaluate();
            self.track_best(&eval, self.plan.num_train_iter.saturating_sub(1));
            self.save_checkpoint()?;
        }

        let mut result = Scalars::new();
        result.insert("eval/best_acc".to_string(), self.state.best_eval_acc);
        result.insert("eval/best_it".to_string(), self.state.best_it as f64);
        Ok(result)
    }

    fn maybe_resume(&mut self) {
        if !self.plan.resume {
            return;
        }
        let Some(load_dir) = self.plan.load_dir.clone() else {
            return;
        };
        let paths = CheckpointPaths::new(load_dir);

        let loaded = TrainState::load(&paths).and_then(|state| {
            self.algorithm.load_checkpoint(&paths)?;
            Ok(state)
        });
        match loaded {
            Ok(state) => {
                info!(
                    "resumed from checkpoint at iteration {} ({})",
                    state.it,
                    paths.dir().display()
                );
                self.state = state;
            }
            Err(Error::NotFound(path)) => {
                info!("resume checkpoint {} does not exist; starting fresh", path);
            }
            Err(err) => {
                warn!(
                    "failed to load checkpoint ({err}); resume disabled, restarting from iteration 0"
                );
            }
        }
    }

    fn evaluate(&self) -> Scalars {
        let mut total_loss = 0.0;
        let mut correct = 0.0;
        let mut total = 0usize;

        for batch in &self.loaders.eval {
            let logits = self.algorithm.eval_logits(batch.images.clone());
            let loss = CrossEntropyLossConfig::new()
                .init(&logits.device())
                .forward(logits.clone(), batch.targets.clone());
            total_loss += loss.into_scalar().elem::<f64>();
            let count = batch.targets.dims()[0];
            correct += accuracy(logits, batch.targets.clone()) * count as f64;
            total += count;
        }

        let batches = self.loaders.eval.len().max(1);
        let mut scalars = Scalars::new();
        scalars.insert("eval/loss".to_string(), total_loss / batches as f64);
        scalars.insert(
            "eval/acc".to_string(),
            if total > 0 { correct / total as f64 } else { 0.0 },
        );
        scalars
    }

    fn track_best(&mut self, eval: &Scalars, it: usize) {
        let acc = eval.get("eval/acc").copied().unwrap_or(0.0);
        if acc > self.state.best_eval_acc {
            self.state.best_eval_acc = acc;
            self.state.best_it = it;
            info!("new best accuracy {:.2}% at iteration {}", acc * 100.0, it);
        }
    }

    fn save_checkpoint(&self) -> Result<()> {
        let manager = CheckpointManager::new(&self.plan.save_dir);
        for paths in [
            manager.latest_paths(),
            manager.iteration_paths(self.state.it),
        ] {
            self.algorithm.save_checkpoint(&paths)?;
            self.state.save(&paths)?;
        }
        manager.prune()
    }

    /// Current orchestrator state (iteration counter, best accuracy).
    pub fn state(&self) -> &TrainState {
        &self.state
    }

    /// Flattened model parameters, for replica-consistency checks and tests.
    pub fn parameter_vector(&self) -> Vec<f32> {
        self.algorithm.parameter_vector()
    }
}
