//! Batch sources for semi-supervised training.
//!
//! Three independent sources feed the loop: labeled training batches,
//! unlabeled training batches (typically `uratio` times larger), and
//! evaluation batches. Training sources cycle forever over a per-epoch
//! shuffled permutation; the permutation is a pure function of
//! `(seed, epoch)`, so any iteration's batch can be reconstructed after a
//! resume and every rank shuffles identically before taking its shard.

pub mod synthetic;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dist::ProcessGroup;
use crate::error::{Error, Result};
use synthetic::Sample;

/// A batch of labeled images.
#[derive(Debug, Clone)]
pub struct LabeledBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// A batch of unlabeled images.
#[derive(Debug, Clone)]
pub struct UnlabeledBatch<B: Backend> {
    pub images: Tensor<B, 4>,
}

/// A worker's slice of the data: rank `rank` takes every `world_size`-th
/// element of the shuffled order.
#[derive(Debug, Clone, Copy)]
pub struct Shard {
    pub rank: usize,
    pub world_size: usize,
}

impl Shard {
    pub fn whole() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

fn epoch_order(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
    order.shuffle(&mut rng);
    order
}

/// Indices feeding batch number `step` of an infinite shuffled cycle.
fn cycle_indices(
    len: usize,
    batch_size: usize,
    seed: u64,
    shard: Shard,
    step: usize,
) -> Vec<usize> {
    let shard_len = len / shard.world_size;
    let batches_per_epoch = shard_len / batch_size;
    let epoch = step / batches_per_epoch;
    let pos = step % batches_per_epoch;

    let order = epoch_order(len, seed, epoch);
    order
        .into_iter()
        .skip(shard.rank)
        .step_by(shard.world_size)
        .skip(pos * batch_size)
        .take(batch_size)
        .collect()
}

fn images_tensor<B: Backend>(
    rows: &[&[f32]],
    dims: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    let [c, h, w] = dims;
    let mut flat = Vec::with_capacity(rows.len() * c * h * w);
    for row in rows {
        flat.extend_from_slice(row);
    }
    Tensor::from_data(TensorData::new(flat, [rows.len(), c, h, w]), device)
}

/// Infinitely cycling labeled batch source.
pub struct LabeledCycler {
    samples: Vec<Sample>,
    image_dims: [usize; 3],
    batch_size: usize,
    seed: u64,
    shard: Shard,
}

impl LabeledCycler {
    pub fn new(
        samples: Vec<Sample>,
        image_dims: [usize; 3],
        batch_size: usize,
        seed: u64,
        shard: Shard,
    ) -> Result<Self> {
        let shard_len = samples.len() / shard.world_size;
        if shard_len < batch_size {
            return Err(Error::Dataset(format!(
                "shard of {} sample(s) cannot fill batches of {}",
                shard_len, batch_size
            )));
        }
        Ok(Self {
            samples,
            image_dims,
            batch_size,
            seed,
            shard,
        })
    }

    pub fn batches_per_epoch(&self) -> usize {
        (self.samples.len() / self.shard.world_size) / self.batch_size
    }

    /// Materialize the batch for iteration `step` on `device`.
    pub fn batch_at<B: Backend>(&self, step: usize, device: &B::Device) -> LabeledBatch<B> {
        let indices = cycle_indices(
            self.samples.len(),
            self.batch_size,
            self.seed,
            self.shard,
            step,
        );
        let rows: Vec<&[f32]> = indices
            .iter()
            .map(|&i| self.samples[i].pixels.as_slice())
            .collect();
        let labels: Vec<i64> = indices.iter().map(|&i| self.samples[i].label as i64).collect();
        let count = labels.len();

        LabeledBatch {
            images: images_tensor(&rows, self.image_dims, device),
            targets: Tensor::from_data(TensorData::new(labels, [count]), device),
        }
    }
}

/// Infinitely cycling unlabeled batch source.
pub struct UnlabeledCycler {
    rows: Vec<Vec<f32>>,
    image_dims: [usize; 3],
    batch_size: usize,
    seed: u64,
    shard: Shard,
}

impl UnlabeledCycler {
    pub fn new(
        rows: Vec<Vec<f32>>,
        image_dims: [usize; 3],
        batch_size: usize,
        seed: u64,
        shard: Shard,
    ) -> Result<Self> {
        let shard_len = rows.len() / shard.world_size;
        if shard_len < batch_size {
            return Err(Error::Dataset(format!(
                "shard of {} sample(s) cannot fill batches of {}",
                shard_len, batch_size
            )));
        }
        Ok(Self {
            rows,
            image_dims,
            batch_size,
            seed,
            shard,
        })
    }

    pub fn batch_at<B: Backend>(&self, step: usize, device: &B::Device) -> UnlabeledBatch<B> {
        let indices = cycle_indices(self.rows.len(), self.batch_size, self.seed, self.shard, step);
        let rows: Vec<&[f32]> = indices.iter().map(|&i| self.rows[i].as_slice()).collect();
        UnlabeledBatch {
            images: images_tensor(&rows, self.image_dims, device),
        }
    }
}

/// Chunk the evaluation split into fixed-size batches (remainder kept).
pub fn eval_batches<B: Backend>(
    samples: &[Sample],
    image_dims: [usize; 3],
    batch_size: usize,
    device: &B::Device,
) -> Vec<LabeledBatch<B>> {
    samples
        .chunks(batch_size.max(1))
        .map(|chunk| {
            let rows: Vec<&[f32]> = chunk.iter().map(|s| s.pixels.as_slice()).collect();
            let labels: Vec<i64> = chunk.iter().map(|s| s.label as i64).collect();
            let count = labels.len();
            LabeledBatch {
                images: images_tensor(&rows, image_dims, device),
                targets: Tensor::from_data(TensorData::new(labels, [count]), device),
            }
        })
        .collect()
}

/// Rank-aware construction: rank 0 builds first while the others wait at a
/// barrier, then rank 0 signals completion via a second barrier. This keeps
/// expensive first-time construction from racing across ranks.
pub fn build_rank_aware<T, F>(group: Option<&ProcessGroup>, build: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match group {
        Some(group) => {
            if group.rank() != 0 {
                group.barrier()?;
            }
            let out = build()?;
            if group.rank() == 0 {
                group.barrier()?;
            }
            Ok(out)
        }
        None => build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use synthetic::{generate, SyntheticSpec};

    fn small_spec() -> SyntheticSpec {
        SyntheticSpec {
            num_classes: 4,
            image_size: 8,
            in_channels: 1,
            num_labels: 16,
            unlabeled_size: 32,
            eval_size: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_batches_are_deterministic_per_step() {
        let data = generate(&small_spec()).unwrap();
        let cycler = LabeledCycler::new(data.labeled, [1, 8, 8], 4, 7, Shard::whole()).unwrap();
        let device = Default::default();

        let a = cycler.batch_at::<NdArray>(5, &device);
        let b = cycler.batch_at::<NdArray>(5, &device);
        assert_eq!(
            a.targets.into_data().to_vec::<i64>().unwrap(),
            b.targets.into_data().to_vec::<i64>().unwrap()
        );
    }

    #[test]
    fn test_shards_partition_each_epoch() {
        let data = generate(&small_spec()).unwrap();
        let full = data.labeled.clone();
        let shard0 = LabeledCycler::new(
            full.clone(),
            [1, 8, 8],
            4,
            7,
            Shard {
                rank: 0,
                world_size: 2,
            },
        )
        .unwrap();
        let shard1 = LabeledCycler::new(
            full,
            [1, 8, 8],
            4,
            7,
            Shard {
                rank: 1,
                world_size: 2,
            },
        )
        .unwrap();
        assert_eq!(shard0.batches_per_epoch(), 2);

        let device = Default::default();
        // One epoch across both shards covers all 16 samples exactly once.
        let mut seen: Vec<i64> = Vec::new();
        for step in 0..2 {
            seen.extend(
                shard0
                    .batch_at::<NdArray>(step, &device)
                    .targets
                    .into_data()
                    .to_vec::<i64>()
                    .unwrap(),
            );
            seen.extend(
                shard1
                    .batch_at::<NdArray>(step, &device)
                    .targets
                    .into_data()
                    .to_vec::<i64>()
                    .unwrap(),
            );
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_undersized_shard_rejected() {
        let data = generate(&small_spec()).unwrap();
        let result = LabeledCycler::new(
            data.labeled,
            [1, 8, 8],
            16,
            7,
            Shard {
                rank: 0,
                world_size: 2,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_eval_batches_keep_remainder() {
        let data = generate(&small_spec()).unwrap();
        let device = Default::default();
        let batches = eval_batches::<NdArray>(&data.eval, [1, 8, 8], 4, &device);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].targets.dims()[0], 2);
    }

    #[test]
    fn test_build_rank_aware_without_group() {
        let out = build_rank_aware(None, || Ok(42)).unwrap();
        assert_eq!(out, 42);
    }
}
