//! Training state that survives membership changes.
//!
//! A state captures the values of live, framework-owned objects so that a failed
//! update can be rolled back (`restore`) and so that every rank can be brought to
//! rank 0's values (`sync`). Tensor state is handled by the variants, plain data
//! attributes by the shared [`ObjectState`] base, always in that order.

mod hosts;
mod model;
mod object;
mod variables;

use crate::Result;

pub use hosts::{HostUpdate, HostUpdates};
pub use model::{ModelState, ModelStateBuilder};
pub use object::{Attribute, ObjectState, ResetCallback, Tracked};
pub use variables::{VariableState, VariableStateBuilder};

/// A piece of training state mirrored across all ranks at synchronization points.
pub trait State {
    /// Captures the live values as the new rollback baseline.
    fn save(&mut self) -> Result<()>;

    /// Writes the rollback baseline back onto the live values.
    fn restore(&mut self) -> Result<()>;

    /// Makes every rank's live values equal to rank 0's and commits them as the
    /// new baseline.
    ///
    /// Collective: every rank of the group must call it.
    fn sync(&mut self) -> Result<()>;

    fn base(&self) -> &ObjectState;

    fn base_mut(&mut self) -> &mut ObjectState;

    /// Variant specific work to run when the group is re-formed.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Saves, then fails with `StateErr::HostsUpdated` if the membership changed.
    ///
    /// Collective: the membership check is agreed on through rank 0.
    fn commit(&mut self) -> Result<()> {
        self.save()?;
        self.base_mut().check_host_updates()
    }

    /// Drops pending host updates, then runs `reset` and the registered callbacks.
    fn on_reset(&mut self) -> Result<()> {
        self.base().host_updates().clear();
        self.reset()?;
        self.base_mut().run_reset_callbacks()
    }
}
