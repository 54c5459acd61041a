//! Worker launch and rank topology.
//!
//! A run is either single-worker or distributed with one worker per local
//! compute device. Distributed workers are spawned explicitly and rendezvous
//! through [`ProcessGroup::join`] before any model construction; the first
//! worker error fails the whole run.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::dist::group::ProcessGroup;
use crate::error::{Error, Result};

/// A worker's place in the distributed run. Computed once at launch and
/// immutable for the worker's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub world_size: usize,
    pub rank: usize,
    pub local_device_index: usize,
}

impl Topology {
    /// Topology of a plain single-worker run.
    pub fn single(device_index: usize) -> Self {
        Self {
            world_size: 1,
            rank: 0,
            local_device_index: device_index,
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

/// How the run maps onto processes and devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchPlan {
    /// One worker, optionally pinned to a device index.
    Single { device_index: usize },
    /// One worker per device on every node; this invocation drives the
    /// devices of `node_rank` only.
    Distributed {
        nodes: usize,
        node_rank: usize,
        devices_per_node: usize,
    },
}

impl LaunchPlan {
    pub fn world_size(&self) -> usize {
        match self {
            LaunchPlan::Single { .. } => 1,
            LaunchPlan::Distributed {
                nodes,
                devices_per_node,
                ..
            } => nodes * devices_per_node,
        }
    }
}

/// Spawn the plan's local workers and wait for all of them.
///
/// Each distributed worker computes its global rank as
/// `node_rank * devices_per_node + local_device_index` and joins the named
/// group before `worker` runs. Any worker error aborts the run; peers blocked
/// on a collective observe the abandonment and error out as well.
pub fn launch<T, F>(
    plan: &LaunchPlan,
    rendezvous: &str,
    join_timeout: Duration,
    worker: F,
) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(Topology, Option<Arc<ProcessGroup>>) -> Result<T> + Send + Sync,
{
    match plan {
        LaunchPlan::Single { device_index } => {
            let out = worker(Topology::single(*device_index), None)?;
            Ok(vec![out])
        }
        LaunchPlan::Distributed {
            nodes,
            node_rank,
            devices_per_node,
        } => {
            let world_size = nodes * devices_per_node;
            info!(
                "launching {} worker(s) on node {} (world size {})",
                devices_per_node, node_rank, world_size
            );

            std::thread::scope(|scope| {
                let worker = &worker;
                let handles: Vec<_> = (0..*devices_per_node)
                    .map(|local| {
                        let rank = node_rank * devices_per_node + local;
                        let rendezvous = rendezvous.to_string();
                        scope.spawn(move || {
                            let group = Arc::new(ProcessGroup::join(
                                &rendezvous,
                                rank,
                                world_size,
                                join_timeout,
                            )?);
                            worker(
                                Topology {
                                    world_size,
                                    rank,
                                    local_device_index: local,
                                },
                                Some(group),
                            )
                        })
                    })
                    .collect();

                let mut outputs = Vec::with_capacity(handles.len());
                let mut first_error = None;
                for handle in handles {
                    match handle.join() {
                        Ok(Ok(out)) => outputs.push(out),
                        Ok(Err(err)) => {
                            first_error.get_or_insert(err);
                        }
                        Err(_) => {
                            first_error.get_or_insert_with(|| {
                                Error::Distributed("worker panicked".to_string())
                            });
                        }
                    }
                }
                match first_error {
                    Some(err) => Err(err),
                    None => Ok(outputs),
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_single_plan() {
        let plan = LaunchPlan::Single { device_index: 0 };
        assert_eq!(plan.world_size(), 1);

        let out = launch(&plan, "unused", TIMEOUT, |topo, group| {
            assert_eq!(topo, Topology::single(0));
            assert!(group.is_none());
            Ok(7usize)
        })
        .unwrap();
        assert_eq!(out, vec![7]);
    }

    #[test]
    fn test_distributed_ranks() {
        let plan = LaunchPlan::Distributed {
            nodes: 1,
            node_rank: 0,
            devices_per_node: 3,
        };
        assert_eq!(plan.world_size(), 3);

        let mut ranks = launch(&plan, "launch-ranks", TIMEOUT, |topo, group| {
            assert_eq!(topo.world_size, 3);
            assert!(group.is_some());
            Ok(topo.rank)
        })
        .unwrap();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[test]
    fn test_worker_error_aborts_run() {
        let plan = LaunchPlan::Distributed {
            nodes: 1,
            node_rank: 0,
            devices_per_node: 2,
        };
        let result: Result<Vec<()>> = launch(&plan, "launch-abort", TIMEOUT, |topo, _group| {
            if topo.rank == 1 {
                Err(Error::Training("simulated failure".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
    }
}
