//! In-memory collective-communication groups.
//!
//! Workers rendezvous under a shared group name (the configured dist URL),
//! then communicate exclusively through blocking collectives: `barrier` and
//! `all_reduce_mean`. Joining blocks until every peer is present or the
//! timeout elapses, in which case the whole group is failed. A member that
//! drops its handle while peers still depend on the group poisons it: every
//! pending and future collective on the survivors errors out instead of
//! hanging. There is no partial recovery.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

static GROUPS: Lazy<Mutex<HashMap<String, Weak<GroupShared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
struct GroupShared {
    inner: Mutex<GroupInner>,
    condvar: Condvar,
}

#[derive(Debug, Default)]
struct GroupInner {
    expected: usize,
    joined: HashSet<usize>,
    departed: HashSet<usize>,
    arrived: usize,
    generation: u64,
    ready_generation: u64,
    buffer: Vec<f32>,
    result: Vec<f32>,
    failure: Option<String>,
}

impl GroupInner {
    fn check_healthy(&self) -> Result<()> {
        if let Some(reason) = &self.failure {
            return Err(Error::Distributed(reason.clone()));
        }
        if let Some(rank) = self.departed.iter().next() {
            return Err(Error::Distributed(format!(
                "rank {rank} abandoned the process group"
            )));
        }
        Ok(())
    }
}

/// Handle to a joined collective-communication group.
///
/// Not `Clone`: share through `Arc` so abandonment is detected exactly when
/// the owning worker releases its handle.
#[derive(Debug)]
pub struct ProcessGroup {
    shared: Arc<GroupShared>,
    name: String,
    rank: usize,
    world_size: usize,
}

impl ProcessGroup {
    /// Join the named group, blocking until all `world_size` peers are
    /// present. Times out with a group-wide failure if they never show up.
    pub fn join(name: &str, rank: usize, world_size: usize, timeout: Duration) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::Distributed(
                "world size must be positive".to_string(),
            ));
        }
        if rank >= world_size {
            return Err(Error::Distributed(format!(
                "rank {rank} is out of bounds for world size {world_size}"
            )));
        }

        let shared = {
            let mut groups = GROUPS.lock().unwrap();
            let entry = groups.entry(name.to_string()).or_insert_with(Weak::new);
            if let Some(existing) = entry.upgrade() {
                existing
            } else {
                let created = Arc::new(GroupShared {
                    inner: Mutex::new(GroupInner::default()),
                    condvar: Condvar::new(),
                });
                *entry = Arc::downgrade(&created);
                created
            }
        };

        {
            let mut inner = shared.inner.lock().unwrap();
            inner.check_healthy()?;
            if inner.expected == 0 {
                inner.expected = world_size;
            } else if inner.expected != world_size {
                return Err(Error::Distributed(format!(
                    "group '{name}' expects world size {}, got {world_size}",
                    inner.expected
                )));
            }
            if !inner.joined.insert(rank) {
                return Err(Error::Distributed(format!(
                    "rank {rank} already joined group '{name}'"
                )));
            }
            shared.condvar.notify_all();
        }

        let group = Self {
            shared,
            name: name.to_string(),
            rank,
            world_size,
        };
        group.wait_for_peers(timeout)?;
        Ok(group)
    }

    fn wait_for_peers(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock().unwrap();
        while inner.joined.len() < inner.expected {
            inner.check_healthy()?;
            let now = Instant::now();
            if now >= deadline {
                let reason = format!(
                    "rank {} timed out joining group '{}' ({}/{} peers present)",
                    self.rank,
                    self.name,
                    inner.joined.len(),
                    inner.expected
                );
                inner.failure = Some(reason.clone());
                self.shared.condvar.notify_all();
                return Err(Error::Distributed(reason));
            }
            let (guard, _) = self
                .shared
                .condvar
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
        inner.check_healthy()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Block until every member has reached this point.
    pub fn barrier(&self) -> Result<()> {
        self.all_reduce_sum(&mut [])
    }

    /// Sum the buffer element-wise across all members, then divide by the
    /// world size. Every member leaves with identical contents.
    pub fn all_reduce_mean(&self, buffer: &mut [f32]) -> Result<()> {
        self.all_reduce_sum(buffer)?;
        let scale = 1.0 / self.world_size as f32;
        for value in buffer.iter_mut() {
            *value *= scale;
        }
        Ok(())
    }

    /// Replace every member's buffer with the root's contents.
    pub fn broadcast(&self, buffer: &mut [f32], root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(Error::Distributed(format!(
                "broadcast root {root} is out of bounds for world size {}",
                self.world_size
            )));
        }
        if self.rank != root {
            buffer.fill(0.0);
        }
        self.all_reduce_sum(buffer)
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.check_healthy()?;

        if inner.arrived == 0 {
            inner.generation = inner.generation.wrapping_add(1);
            inner.buffer.clear();
            inner.buffer.resize(buffer.len(), 0.0);
        } else if inner.buffer.len() != buffer.len() {
            let reason = format!(
                "collective buffer length mismatch: expected {}, got {}",
                inner.buffer.len(),
                buffer.len()
            );
            inner.failure = Some(reason.clone());
            inner.arrived = 0;
            inner.ready_generation = inner.generation;
            self.shared.condvar.notify_all();
            return Err(Error::Distributed(reason));
        }

        for (slot, value) in inner.buffer.iter_mut().zip(buffer.iter()) {
            *slot += *value;
        }
        inner.arrived += 1;
        let generation = inner.generation;

        if inner.arrived == inner.expected {
            inner.result = inner.buffer.clone();
            inner.arrived = 0;
            inner.ready_generation = generation;
            self.shared.condvar.notify_all();
        } else {
            while inner.ready_generation != generation {
                inner.check_healthy()?;
                inner = self.shared.condvar.wait(inner).unwrap();
            }
        }

        inner.check_healthy()?;
        buffer.copy_from_slice(&inner.result);
        Ok(())
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.joined.remove(&self.rank);
            inner.departed.insert(self.rank);
            // Wake any member blocked in a collective so it can observe the
            // departure instead of waiting forever.
            self.shared.condvar.notify_all();
        }

        let mut groups = GROUPS.lock().unwrap();
        let remove = groups
            .get(&self.name)
            .map(|weak| weak.upgrade().is_none())
            .unwrap_or(false);
        if remove {
            groups.remove(&self.name);
        }
    }
}
