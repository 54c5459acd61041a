//! Per-iteration scalar reporting.
//!
//! Training steps return a map of named scalar diagnostics. Sinks consume
//! them together with the step index; the rank-gating wrapper turns every
//! non-zero rank's sink into a no-op so replicas run silently.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor};
use tracing::info;

/// Named scalar diagnostics for one training iteration
pub type Scalars = BTreeMap<String, f64>;

/// Consumer of per-iteration scalars.
pub trait MetricSink {
    fn log_scalars(&mut self, step: usize, scalars: &Scalars);
}

/// Gates an inner sink so only rank 0 emits records.
pub struct RankGated<S: MetricSink> {
    rank: usize,
    inner: S,
}

impl<S: MetricSink> RankGated<S> {
    pub fn new(rank: usize, inner: S) -> Self {
        Self { rank, inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: MetricSink> MetricSink for RankGated<S> {
    fn log_scalars(&mut self, step: usize, scalars: &Scalars) {
        if self.rank == 0 {
            self.inner.log_scalars(step, scalars);
        }
    }
}

/// Production sink: writes scalars through `tracing` every `log_every` steps.
pub struct TracingSink {
    log_every: usize,
}

impl TracingSink {
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every: log_every.max(1),
        }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(50)
    }
}

impl MetricSink for TracingSink {
    fn log_scalars(&mut self, step: usize, scalars: &Scalars) {
        if step % self.log_every != 0 {
            return;
        }
        let line = scalars
            .iter()
            .map(|(k, v)| format!("{} = {:.4}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        info!("iter {}: {}", step, line);
    }
}

/// In-memory sink recording every emission. Shared via `Arc` so tests and
/// multi-worker runs can inspect what each rank produced.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<(usize, Scalars)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<(usize, Scalars)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MetricSink for MemorySink {
    fn log_scalars(&mut self, step: usize, scalars: &Scalars) {
        if let Ok(mut records) = self.records.lock() {
            records.push((step, scalars.clone()));
        }
    }
}

/// Compute accuracy from logits and integer targets.
pub fn accuracy<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> f64 {
    let predictions = output.argmax(1).squeeze::<1>(1);
    let correct_tensor = predictions.equal(targets.clone()).int().sum();
    let correct: i64 = correct_tensor.into_scalar().elem();
    let total = targets.dims()[0];

    if total > 0 {
        correct as f64 / total as f64
    } else {
        0.0
    }
}
