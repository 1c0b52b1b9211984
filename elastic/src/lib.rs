//! Elastic training state: capture, roll back and synchronize the live values of
//! a training run across a group of ranks whose membership can change.

pub mod collective;
mod error;
pub mod framework;
pub mod memory;
mod run;
pub mod state;

pub use collective::{Collective, CollectiveRef, Context, ROOT_RANK};
pub use error::{Result, StateErr};
pub use framework::{BroadcastOp, Tensor};
pub use run::{RunConfig, run, run_with};
pub use state::{
    Attribute, HostUpdate, HostUpdates, ModelState, ObjectState, State, Tracked, VariableState,
};
