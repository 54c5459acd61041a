//! Distributed training: rendezvous groups, worker launch, gradient sync.

pub mod group;
pub mod launch;
pub mod sync;

pub use group::ProcessGroup;
pub use launch::{launch, LaunchPlan, Topology};
pub use sync::{parameter_vector, ReplicaSync};
