use std::{
    num::NonZeroUsize,
    sync::{Arc, Barrier},
};

use parking_lot::Mutex;

use super::{Collective, check_root};
use crate::{Result, StateErr, framework::Tensor};

/// An in-process group: every rank is a thread holding one `LocalCollective`.
pub struct LocalGroup;

impl LocalGroup {
    /// Creates the collectives for a group of `size` ranks, indexed by rank.
    pub fn new(size: NonZeroUsize) -> Vec<LocalCollective> {
        let shared = Arc::new(Shared {
            size: size.get(),
            barrier: Barrier::new(size.get()),
            tensors: Mutex::new(Vec::new()),
            object: Mutex::new(Vec::new()),
        });

        (0..size.get())
            .map(|rank| LocalCollective {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

struct Shared {
    size: usize,
    barrier: Barrier,
    tensors: Mutex<Vec<Tensor>>,
    object: Mutex<Vec<u8>>,
}

/// One rank's handle into a `LocalGroup`.
pub struct LocalCollective {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalCollective {
    fn copy_from_root(&self, values: &mut [Tensor]) -> Result<()> {
        let src = self.shared.tensors.lock();
        if src.len() != values.len() {
            return Err(StateErr::LengthMismatch {
                what: "broadcast tensors",
                got: src.len(),
                expected: values.len(),
            });
        }

        for (i, (dst, src)) in values.iter_mut().zip(src.iter()).enumerate() {
            if dst.shape() != src.shape() {
                return Err(StateErr::ShapeMismatch {
                    name: format!("broadcast tensor {i}"),
                    got: src.shape().to_vec(),
                    expected: dst.shape().to_vec(),
                });
            }

            dst.assign(src);
        }

        Ok(())
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn broadcast(&self, values: &mut [Tensor], root_rank: usize) -> Result<()> {
        check_root(root_rank, self.shared.size)?;

        if self.rank == root_rank {
            *self.shared.tensors.lock() = values.to_vec();
        }

        self.shared.barrier.wait();
        let res = if self.rank == root_rank {
            Ok(())
        } else {
            self.copy_from_root(values)
        };

        // Every rank must leave the first phase before the root may overwrite the slot.
        self.shared.barrier.wait();
        res
    }

    fn broadcast_object(&self, obj: Vec<u8>, root_rank: usize) -> Result<Vec<u8>> {
        check_root(root_rank, self.shared.size)?;

        if self.rank == root_rank {
            *self.shared.object.lock() = obj.clone();
        }

        self.shared.barrier.wait();
        let res = if self.rank == root_rank {
            obj
        } else {
            self.shared.object.lock().clone()
        };

        self.shared.barrier.wait();
        Ok(res)
    }
}
