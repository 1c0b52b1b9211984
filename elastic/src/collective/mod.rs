//! The collective-communication substrate as seen by the state layer.

mod local;
mod tcp;

use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    Result, StateErr,
    framework::{BroadcastOp, FrameworkRef, Tensor, VariableRef},
};

pub use local::{LocalCollective, LocalGroup};
pub use tcp::{GroupConfig, PendingHub, TcpGroup};

/// The rank whose values win every synchronization.
pub const ROOT_RANK: usize = 0;

pub type CollectiveRef = Arc<dyn Collective>;

/// Blocking rank-based collectives. Every rank of the group must issue the same
/// sequence of calls or the group deadlocks.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Overwrites `values` on every rank with the values held by `root_rank`.
    ///
    /// Shapes must match across ranks.
    fn broadcast(&self, values: &mut [Tensor], root_rank: usize) -> Result<()>;

    /// Returns `root_rank`'s encoded object on every rank.
    fn broadcast_object(&self, obj: Vec<u8>, root_rank: usize) -> Result<Vec<u8>>;
}

pub(crate) fn check_root(root_rank: usize, size: usize) -> Result<()> {
    if root_rank >= size {
        return Err(StateErr::Collective(format!(
            "root rank {root_rank} is out of range for a group of {size}"
        )));
    }

    Ok(())
}

/// The per-process handle to the current group and the framework it trains with.
pub struct Context {
    collective: RwLock<CollectiveRef>,
    framework: FrameworkRef,
}

impl Context {
    /// Creates a new `Context`.
    ///
    /// # Arguments
    /// * `collective` - The group this process currently belongs to.
    /// * `framework` - The framework owning the live variables.
    ///
    /// # Returns
    /// A new shareable `Context` instance.
    pub fn new(collective: CollectiveRef, framework: FrameworkRef) -> Arc<Self> {
        Arc::new(Self {
            collective: RwLock::new(collective),
            framework,
        })
    }

    pub fn rank(&self) -> usize {
        self.collective.read().rank()
    }

    pub fn size(&self) -> usize {
        self.collective.read().size()
    }

    pub fn collective(&self) -> CollectiveRef {
        self.collective.read().clone()
    }

    pub fn framework(&self) -> &FrameworkRef {
        &self.framework
    }

    pub fn executing_eagerly(&self) -> bool {
        self.framework.executing_eagerly()
    }

    /// Installs the collective of a re-formed membership. Called from reset callbacks.
    pub fn replace_collective(&self, collective: CollectiveRef) {
        debug!(
            rank = collective.rank(),
            size = collective.size();
            "replacing collective"
        );

        *self.collective.write() = collective;
    }

    /// Broadcasts the values of `variables` from `root_rank`.
    ///
    /// While executing eagerly the variables are updated before this returns and the
    /// op is already completed. Otherwise the returned op must be run in a session.
    pub fn broadcast_variables(
        &self,
        variables: &[VariableRef],
        root_rank: usize,
    ) -> Result<BroadcastOp> {
        let collective = self.collective();
        check_root(root_rank, collective.size())?;

        debug!(
            rank = collective.rank(),
            variables = variables.len(),
            eager = self.executing_eagerly();
            "broadcasting variables"
        );

        if self.executing_eagerly() {
            let mut values = variables
                .iter()
                .map(|var| var.numpy())
                .collect::<Result<Vec<_>>>()?;

            collective.broadcast(&mut values, root_rank)?;

            for (var, value) in variables.iter().zip(&values) {
                var.assign(value)?;
            }

            return Ok(BroadcastOp::completed());
        }

        let variables = variables.to_vec();
        Ok(BroadcastOp::deferred(move |session| {
            let mut values = variables
                .iter()
                .map(|var| var.eval(session))
                .collect::<Result<Vec<_>>>()?;

            collective.broadcast(&mut values, root_rank)?;

            for (var, value) in variables.iter().zip(&values) {
                var.load(value, session)?;
            }

            Ok(())
        }))
    }

    /// Broadcasts the framework's whole global variable collection from `root_rank`.
    pub fn broadcast_global_variables(&self, root_rank: usize) -> Result<BroadcastOp> {
        let variables = self.framework.global_variables();
        self.broadcast_variables(&variables, root_rank)
    }

    /// Replicates any plain-data `obj` from the root rank.
    pub fn broadcast_object<T>(&self, obj: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let bytes = bincode::serialize(obj)?;
        let bytes = self.collective().broadcast_object(bytes, ROOT_RANK)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}
