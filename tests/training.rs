//! End-to-end training-loop properties on the CPU backend.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use burn::backend::{Autodiff, NdArray};
use once_cell::sync::Lazy;
use tempfile::TempDir;

use semivat::config::TrainConfig;
use semivat::data::synthetic::SyntheticSpec;
use semivat::dist::{launch, Topology};
use semivat::train::run_worker;
use semivat::train::RunPlan;
use semivat::MemorySink;

type TestBackend = Autodiff<NdArray>;

// The backend RNG is process-global; training runs must not interleave.
static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const TIMEOUT: Duration = Duration::from_secs(20);

fn tiny_config(save_dir: &Path, save_name: &str) -> TrainConfig {
    let mut cfg = TrainConfig::default();
    cfg.save_dir = save_dir.to_path_buf();
    cfg.save_name = save_name.to_string();
    cfg.overwrite = true;
    cfg.num_train_iter = 8;
    cfg.epoch = 2;
    cfg.num_warmup_iter = 2;
    cfg.num_eval_iter = 4;
    cfg.batch_size = 8;
    cfg.uratio = 1;
    cfg.eval_batch_size = 8;
    cfg.lr = 0.02;
    cfg.base_filters = 4;
    cfg.hidden_size = 16;
    cfg.data = SyntheticSpec {
        num_classes: 4,
        image_size: 16,
        in_channels: 1,
        num_labels: 16,
        unlabeled_size: 32,
        eval_size: 8,
        noise_std: 0.15,
        seed: 5,
    };
    cfg.seed = 5;
    cfg
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

#[test]
fn single_worker_run_produces_results() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    let cfg = tiny_config(tmp.path(), "smoke");
    cfg.validate().unwrap();

    let output = run_worker::<TestBackend, _>(
        &cfg,
        Topology::single(0),
        None,
        MemorySink::new(),
        Default::default(),
    )
    .unwrap();

    let best_acc = output.result["eval/best_acc"];
    assert!((0.0..=1.0).contains(&best_acc));
    assert!(output.result.contains_key("eval/best_it"));
    assert!(!output.parameters.is_empty());

    // Both the rolling and the per-iteration checkpoints exist.
    assert!(tmp.path().join("smoke/latest/train_state.json").exists());
    assert!(tmp.path().join("smoke/iter_00000008/train_state.json").exists());
}

#[test]
fn resume_matches_uninterrupted_run() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();

    // Uninterrupted run over the full budget; a checkpoint lands at
    // iteration 4 on the way through.
    let cfg_full = tiny_config(tmp.path(), "full");
    let full = run_worker::<TestBackend, _>(
        &cfg_full,
        Topology::single(0),
        None,
        MemorySink::new(),
        Default::default(),
    )
    .unwrap();

    let checkpoint = tmp.path().join("full/iter_00000004");
    assert!(checkpoint.join("train_state.json").exists());

    // Second run resumes from the mid-run checkpoint and finishes the same
    // budget.
    let mut cfg_resumed = tiny_config(tmp.path(), "resumed");
    cfg_resumed.resume = true;
    cfg_resumed.load_path = Some(checkpoint);
    let sink = MemorySink::new();
    let resumed = run_worker::<TestBackend, _>(
        &cfg_resumed,
        Topology::single(0),
        None,
        sink.clone(),
        Default::default(),
    )
    .unwrap();

    // The resumed loop really started at iteration 4.
    let train_steps: Vec<usize> = sink
        .records()
        .iter()
        .filter(|(_, scalars)| scalars.contains_key("train/total_loss"))
        .map(|(step, _)| *step)
        .collect();
    assert_eq!(train_steps, vec![4, 5, 6, 7]);

    let diff = max_abs_diff(&full.parameters, &resumed.parameters);
    assert!(
        diff < 1e-5,
        "resumed parameters diverged from the uninterrupted run (max diff {diff})"
    );
}

#[test]
fn corrupt_checkpoint_restarts_from_zero() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();

    let broken = tmp.path().join("broken-checkpoint");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("train_state.json"), b"not json at all").unwrap();

    let mut cfg = tiny_config(tmp.path(), "degraded");
    cfg.resume = true;
    cfg.load_path = Some(broken);

    // The load fails, resume is disabled, and the run still completes the
    // full budget from iteration 0.
    let sink = MemorySink::new();
    let output = run_worker::<TestBackend, _>(
        &cfg,
        Topology::single(0),
        None,
        sink.clone(),
        Default::default(),
    )
    .unwrap();
    assert!(output.result.contains_key("eval/best_acc"));

    let train_records = sink
        .records()
        .iter()
        .filter(|(_, scalars)| scalars.contains_key("train/total_loss"))
        .count();
    assert_eq!(train_records, cfg.num_train_iter);
}

#[test]
fn only_rank_zero_emits_metrics_and_replicas_agree() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();

    let mut cfg = tiny_config(tmp.path(), "dist");
    cfg.dist.multiprocessing_distributed = true;
    cfg.dist.devices_per_node = 2;
    cfg.dist.dist_url = "test://rank-gating".to_string();
    cfg.validate().unwrap();

    let sinks = [MemorySink::new(), MemorySink::new()];
    let plan = cfg.launch_plan();
    let outputs = launch(&plan, &cfg.dist.dist_url, TIMEOUT, |topo, group| {
        run_worker::<TestBackend, _>(
            &cfg,
            topo,
            group,
            sinks[topo.rank].clone(),
            Default::default(),
        )
    })
    .unwrap();
    assert_eq!(outputs.len(), 2);

    // Every iteration produced a training record on rank 0; rank 1 ran the
    // same number of iterations in silence.
    let rank0_train_records = sinks[0]
        .records()
        .iter()
        .filter(|(_, scalars)| scalars.contains_key("train/total_loss"))
        .count();
    assert_eq!(rank0_train_records, cfg.num_train_iter);
    assert_eq!(sinks[1].len(), 0);

    // Gradient averaging and the initial broadcast keep the replicas
    // identical.
    let diff = max_abs_diff(&outputs[0].parameters, &outputs[1].parameters);
    assert!(diff < 1e-5, "replicas diverged (max diff {diff})");
}

#[test]
fn orchestrator_rejects_indivisible_budget() {
    let plan = RunPlan {
        num_train_iter: 100,
        epoch: 7,
        num_eval_iter: 10,
        resume: false,
        load_dir: None,
        save_dir: "unused".into(),
    };
    let err = plan.validate().unwrap_err();
    assert!(matches!(err, semivat::Error::Config(_)));
}
