use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DistributedError {
    #[error("Collective '{0}' failed: a peer panicked while holding the shared state")]
    Poisoned(&'static str),

    #[error("All-reduce length mismatch: rank {rank} sent {found} values, expected {expected}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        found: usize,
    },

    #[error("Collective '{collective}' failed: rank {rank} left the process group")]
    Aborted {
        rank: usize,
        collective: &'static str,
    },

    #[error("A process group needs at least one member")]
    EmptyGroup,
}

/// Collective operations of a data-parallel process group.
///
/// Every member must call the same collectives in the same order. A member
/// that stops early must call [`Communicator::abort`] so that its peers
/// fail instead of waiting for it.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn barrier(&self) -> Result<(), DistributedError>;

    /// Replaces `values` on every rank with the element-wise sum over ranks.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), DistributedError>;

    /// Marks the group as failed: pending and future collectives of every
    /// member return [`DistributedError::Aborted`].
    fn abort(&self) {}

    fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }
}

/// Aborts the group of a communicator when dropped while still armed, which
/// covers early returns through `?` as well as panics.
pub struct AbortOnDrop<'a> {
    communicator: &'a dyn Communicator,
    armed: bool,
}

impl<'a> AbortOnDrop<'a> {
    pub fn new(communicator: &'a dyn Communicator) -> Self {
        Self {
            communicator,
            armed: true,
        }
    }

    /// Leaves the group intact; call once the member's work succeeded.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed && self.communicator.is_distributed() {
            warn!(
                rank = self.communicator.rank(),
                "Member failed; aborting the process group"
            );
            self.communicator.abort();
        }
    }
}

/// The trivial group of one process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), DistributedError> {
        Ok(())
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<(), DistributedError> {
        Ok(())
    }
}

#[derive(Default)]
struct ReduceState {
    sum: Vec<f64>,
    mismatch: Option<DistributedError>,
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted_by: Option<usize>,
}

struct Shared {
    world_size: usize,
    barrier: Mutex<BarrierState>,
    released: Condvar,
    state: Mutex<ReduceState>,
}

/// A process group whose members are threads of the current process.
pub struct ThreadGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadGroup {
    /// Creates the `world_size` members of a new group; member `i` has rank
    /// `i` and should be moved to its own thread.
    pub fn new(world_size: usize) -> Result<Vec<ThreadGroup>, DistributedError> {
        if world_size == 0 {
            return Err(DistributedError::EmptyGroup);
        }
        let shared = Arc::new(Shared {
            world_size,
            barrier: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            state: Mutex::new(ReduceState::default()),
        });
        Ok((0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect())
    }

    fn lock(&self, collective: &'static str) -> Result<MutexGuard<'_, ReduceState>, DistributedError> {
        self.shared
            .state
            .lock()
            .map_err(|_| DistributedError::Poisoned(collective))
    }

    /// Blocks until every member arrived or the group was aborted.
    fn wait(&self, collective: &'static str) -> Result<(), DistributedError> {
        let mut barrier = self
            .shared
            .barrier
            .lock()
            .map_err(|_| DistributedError::Poisoned(collective))?;
        if let Some(rank) = barrier.aborted_by {
            return Err(DistributedError::Aborted { rank, collective });
        }

        barrier.arrived += 1;
        if barrier.arrived == self.shared.world_size {
            barrier.arrived = 0;
            barrier.generation = barrier.generation.wrapping_add(1);
            self.shared.released.notify_all();
            return Ok(());
        }

        let generation = barrier.generation;
        let barrier = self
            .shared
            .released
            .wait_while(barrier, |b| {
                b.generation == generation && b.aborted_by.is_none()
            })
            .map_err(|_| DistributedError::Poisoned(collective))?;
        match barrier.aborted_by {
            Some(rank) if barrier.generation == generation => {
                Err(DistributedError::Aborted { rank, collective })
            }
            _ => Ok(()),
        }
    }

    fn reduce(&self, values: &mut [f64]) -> Result<(), DistributedError> {
        self.wait("all_reduce")?;
        if self.rank == 0 {
            let mut state = self.lock("all_reduce")?;
            state.sum = vec![0.0; values.len()];
            state.mismatch = None;
        }
        self.wait("all_reduce")?;
        {
            let mut state = self.lock("all_reduce")?;
            if state.sum.len() == values.len() {
                for (acc, v) in state.sum.iter_mut().zip(values.iter()) {
                    *acc += v;
                }
            } else if state.mismatch.is_none() {
                state.mismatch = Some(DistributedError::LengthMismatch {
                    rank: self.rank,
                    expected: state.sum.len(),
                    found: values.len(),
                });
            }
        }
        self.wait("all_reduce")?;
        let result = {
            let state = self.lock("all_reduce")?;
            match &state.mismatch {
                Some(error) => Err(error.clone()),
                None => {
                    values.copy_from_slice(&state.sum);
                    Ok(())
                }
            }
        };
        self.wait("all_reduce")?;
        result
    }
}

impl Communicator for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<(), DistributedError> {
        let result = self.wait("barrier");
        if matches!(result, Err(DistributedError::Poisoned(_))) {
            self.abort();
        }
        result
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), DistributedError> {
        let result = self.reduce(values);
        if matches!(result, Err(DistributedError::Poisoned(_))) {
            self.abort();
        }
        result
    }

    fn abort(&self) {
        let mut barrier = self
            .shared
            .barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        barrier.aborted_by.get_or_insert(self.rank);
        self.shared.released.notify_all();
    }
}
