//! Semi-supervised adversarial training CLI.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use semivat::algorithm::AlgorithmConfig;
use semivat::backend::{self, TrainingBackend};
use semivat::config::{DistConfig, OptimKind, TrainConfig};
use semivat::data::synthetic::SyntheticSpec;
use semivat::dist;
use semivat::logging::{self, LogConfig};
use semivat::metrics::TracingSink;
use semivat::train::run_worker;
use semivat::VatOptions;

/// Semi-supervised classifier training with virtual adversarial
/// regularization.
#[derive(Parser, Debug)]
#[command(name = "semivat")]
#[command(version)]
#[command(about = "Semi-supervised adversarial training with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a classifier
    Train(TrainArgs),

    /// List the registered training algorithms
    Algorithms,
}

#[derive(Args, Debug)]
struct TrainArgs {
    // ------------------------------------------------------------------
    // Saving & loading
    // ------------------------------------------------------------------
    /// Directory that receives run directories
    #[arg(long, default_value = "./saved_models")]
    save_dir: PathBuf,

    /// Name of this run's directory
    #[arg(long, default_value = "vat_run")]
    save_name: String,

    /// Replace an existing run directory
    #[arg(short, long, default_value = "false")]
    overwrite: bool,

    /// Resume from --load-path
    #[arg(long, default_value = "false")]
    resume: bool,

    /// Checkpoint directory to resume from
    #[arg(long)]
    load_path: Option<PathBuf>,

    // ------------------------------------------------------------------
    // Iteration budget
    // ------------------------------------------------------------------
    /// Total number of training iterations
    #[arg(long, default_value = "10240")]
    num_train_iter: usize,

    /// Number of reporting epochs (must divide the iteration budget)
    #[arg(long, default_value = "10")]
    epoch: usize,

    /// Linear learning-rate warmup iterations
    #[arg(long, default_value = "0")]
    num_warmup_iter: usize,

    /// Evaluation (and checkpoint) frequency in iterations
    #[arg(long, default_value = "512")]
    num_eval_iter: usize,

    // ------------------------------------------------------------------
    // Batch composition
    // ------------------------------------------------------------------
    /// Labeled batch size per node
    #[arg(short, long, default_value = "32")]
    batch_size: usize,

    /// Ratio of unlabeled to labeled samples in each mini-batch
    #[arg(long, default_value = "1")]
    uratio: usize,

    /// Evaluation batch size
    #[arg(long, default_value = "256")]
    eval_batch_size: usize,

    /// Unsupervised loss weight
    #[arg(long, default_value = "1.0")]
    ulb_loss_ratio: f64,

    // ------------------------------------------------------------------
    // Optimizer
    // ------------------------------------------------------------------
    /// Optimizer (sgd or adam)
    #[arg(long, default_value = "sgd")]
    optim: String,

    /// Peak learning rate
    #[arg(long, default_value = "0.03")]
    lr: f64,

    /// SGD momentum
    #[arg(long, default_value = "0.9")]
    momentum: f64,

    /// Weight decay
    #[arg(long, default_value = "0.0005")]
    weight_decay: f64,

    /// Gradient norm clipping (0 disables)
    #[arg(long, default_value = "0.0")]
    clip_grad: f64,

    // ------------------------------------------------------------------
    // Backbone
    // ------------------------------------------------------------------
    /// Base number of convolutional filters
    #[arg(long, default_value = "16")]
    base_filters: usize,

    /// Width of the hidden classifier layer
    #[arg(long, default_value = "128")]
    hidden_size: usize,

    // ------------------------------------------------------------------
    // Algorithm
    // ------------------------------------------------------------------
    /// Training algorithm
    #[arg(short, long, default_value = "vat")]
    algorithm: String,

    /// VAT perturbation magnitude
    #[arg(long, default_value = "6.0")]
    vat_eps: f64,

    /// VAT power-iteration seed scale
    #[arg(long, default_value = "0.000001")]
    vat_xi: f64,

    /// VAT power-iteration rounds
    #[arg(long, default_value = "1")]
    vat_iters: usize,

    /// Perturb the penultimate embedding instead of the raw input
    #[arg(long, default_value = "false")]
    vat_embed: bool,

    /// Warmup fraction of the unsupervised loss weight
    #[arg(long, default_value = "0.4")]
    unsup_warm_up: f64,

    /// Entropy minimization weight
    #[arg(long, default_value = "0.06")]
    ent_loss_ratio: f64,

    // ------------------------------------------------------------------
    // Dataset
    // ------------------------------------------------------------------
    /// Number of classes
    #[arg(long, default_value = "10")]
    num_classes: usize,

    /// Number of labeled training samples
    #[arg(long, default_value = "40")]
    num_labels: usize,

    /// Number of unlabeled training samples
    #[arg(long, default_value = "2000")]
    unlabeled_size: usize,

    /// Number of evaluation samples
    #[arg(long, default_value = "500")]
    eval_size: usize,

    /// Image side length
    #[arg(long, default_value = "32")]
    image_size: usize,

    /// Image channels
    #[arg(long, default_value = "3")]
    in_channels: usize,

    // ------------------------------------------------------------------
    // Distributed launch
    // ------------------------------------------------------------------
    /// Number of nodes
    #[arg(long, default_value = "1")]
    world_size: usize,

    /// This node's rank
    #[arg(long, default_value = "0")]
    rank: usize,

    /// Rendezvous identifier shared by all workers
    #[arg(long, default_value = "local://semivat")]
    dist_url: String,

    /// Workers (devices) per node
    #[arg(long, default_value = "1")]
    devices_per_node: usize,

    /// Launch one worker per device on this node
    #[arg(long, default_value = "false")]
    multiprocessing_distributed: bool,

    /// Device index for a single-worker run
    #[arg(long)]
    device: Option<usize>,

    /// Use GPU acceleration
    #[arg(long, default_value = "false")]
    gpu: bool,

    /// Seconds to wait for peers at the rendezvous
    #[arg(long, default_value = "60")]
    join_timeout: u64,

    /// Random seed
    #[arg(long, default_value = "1")]
    seed: u64,
}

impl TrainArgs {
    fn into_config(self) -> Result<TrainConfig> {
        let vat = VatOptions {
            vat_eps: self.vat_eps,
            vat_xi: self.vat_xi,
            vat_iters: self.vat_iters,
            vat_embed: self.vat_embed,
            unsup_warm_up: self.unsup_warm_up,
            ent_loss_ratio: self.ent_loss_ratio,
        };
        let algorithm = AlgorithmConfig::from_name(&self.algorithm, vat)?;

        Ok(TrainConfig {
            save_dir: self.save_dir,
            save_name: self.save_name,
            overwrite: self.overwrite,
            resume: self.resume,
            load_path: self.load_path,
            num_train_iter: self.num_train_iter,
            epoch: self.epoch,
            num_warmup_iter: self.num_warmup_iter,
            num_eval_iter: self.num_eval_iter,
            batch_size: self.batch_size,
            uratio: self.uratio,
            eval_batch_size: self.eval_batch_size,
            ulb_loss_ratio: self.ulb_loss_ratio,
            optim: OptimKind::from_str(&self.optim)?,
            lr: self.lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            clip_grad: self.clip_grad,
            base_filters: self.base_filters,
            hidden_size: self.hidden_size,
            algorithm,
            data: SyntheticSpec {
                num_classes: self.num_classes,
                image_size: self.image_size,
                in_channels: self.in_channels,
                num_labels: self.num_labels,
                unlabeled_size: self.unlabeled_size,
                eval_size: self.eval_size,
                noise_std: 0.15,
                seed: self.seed,
            },
            dist: DistConfig {
                world_size: self.world_size,
                node_rank: self.rank,
                devices_per_node: self.devices_per_node,
                dist_url: self.dist_url,
                multiprocessing_distributed: self.multiprocessing_distributed,
                device: self.device,
                gpu: self.gpu,
                join_timeout_secs: self.join_timeout,
            },
            seed: self.seed,
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    logging::init_logging(&log_config);

    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Algorithms => {
            println!("{}", "Registered algorithms:".green().bold());
            for name in AlgorithmConfig::registered_names() {
                println!("  {}", name);
            }
            Ok(())
        }
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let config = args.into_config()?;
    config.validate()?;
    let save_path = config.prepare_save_dir()?;

    println!("{}", "Initializing Training...".green().bold());
    println!("  Backend: {}", backend::backend_name());
    println!("  Algorithm: {}", config.algorithm.name());
    println!("  Run directory: {}", save_path.display());

    let plan = config.launch_plan();
    let node_rank = config.dist.node_rank;
    let outputs = dist::launch(&plan, &config.dist.dist_url, config.join_timeout(), |topo, group| {
        let _span = logging::worker_span(topo.rank).entered();
        info!("worker online (device index {})", topo.local_device_index);
        run_worker::<TrainingBackend, _>(
            &config,
            topo,
            group,
            TracingSink::default(),
            backend::device_for(topo.local_device_index),
        )
    })?;

    if node_rank == 0 {
        if let Some(output) = outputs.first() {
            println!("{}", "Training complete.".green().bold());
            for (key, value) in &output.result {
                println!("  Model result - {} : {:.4}", key, value);
            }
        }
    }
    Ok(())
}
