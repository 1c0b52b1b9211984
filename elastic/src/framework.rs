//! The surface of the numerical framework that owns the live training objects.
//!
//! Nothing in here owns weights: models, optimizers and variables are handles into
//! framework-managed storage, shared with the training loop.

use std::{fmt, sync::Arc};

use ndarray::ArrayD;

use crate::{Result, StateErr};

/// A dense array value as exported by the framework.
pub type Tensor = ArrayD<f32>;

pub type VariableRef = Arc<dyn Variable>;
pub type SessionRef = Arc<dyn Session>;
pub type ModelRef = Arc<dyn Model>;
pub type OptimizerRef = Arc<dyn Optimizer>;
pub type BackendRef = Arc<dyn Backend>;
pub type FrameworkRef = Arc<dyn Framework>;

/// A mutable, named tensor living inside the framework.
pub trait Variable: Send + Sync {
    fn name(&self) -> &str;

    /// Reads the current value directly, only valid while executing eagerly.
    fn numpy(&self) -> Result<Tensor>;

    /// Reads the current value by evaluating it in `session`.
    fn eval(&self, session: &dyn Session) -> Result<Tensor>;

    /// Overwrites the value in place.
    ///
    /// # Errors
    /// `StateErr::ShapeMismatch` if `value` does not have the variable's shape.
    fn assign(&self, value: &Tensor) -> Result<()>;

    /// Overwrites the value through `session`.
    ///
    /// # Errors
    /// `StateErr::ShapeMismatch` if `value` does not have the variable's shape.
    fn load(&self, value: &Tensor, session: &dyn Session) -> Result<()>;
}

/// An execution context for deferred operations.
pub trait Session: Send + Sync {
    /// Executes `op`, blocking until it completes.
    fn run(&self, op: BroadcastOp) -> Result<()>;
}

/// A trainable model whose parameters are exported and imported in bulk.
pub trait Model: Send + Sync {
    /// Whether every parameter shape is fixed.
    fn built(&self) -> bool;

    fn get_weights(&self) -> Result<Vec<Tensor>>;

    fn set_weights(&self, weights: &[Tensor]) -> Result<()>;

    fn variables(&self) -> Vec<VariableRef>;

    /// The optimizer the model was compiled with, if any.
    fn optimizer(&self) -> Option<OptimizerRef>;
}

/// An optimizer's internal state (slots, moments, iteration counters).
pub trait Optimizer: Send + Sync {
    fn get_weights(&self) -> Result<Vec<Tensor>>;

    fn set_weights(&self, weights: &[Tensor]) -> Result<()>;

    fn variables(&self) -> Vec<VariableRef>;
}

/// The high-level model backend, only needed to reach the session in graph mode.
pub trait Backend: Send + Sync {
    fn session(&self) -> Result<SessionRef>;
}

/// Process-wide execution facts and registries of the framework.
pub trait Framework: Send + Sync {
    /// Whether operations run immediately instead of being assembled into a graph.
    fn executing_eagerly(&self) -> bool;

    /// Whether variables support native in-place assignment.
    fn supports_assign(&self) -> bool;

    /// A snapshot of the global variable collection.
    fn global_variables(&self) -> Vec<VariableRef>;

    fn default_session(&self) -> Option<SessionRef>;
}

type Deferred = Box<dyn FnOnce(&dyn Session) -> Result<()> + Send>;

/// The result of issuing a broadcast: either done already or waiting for a session.
#[must_use = "a deferred broadcast does nothing until it runs in a session"]
pub struct BroadcastOp {
    deferred: Option<Deferred>,
}

impl BroadcastOp {
    /// An operation that already took effect.
    pub fn completed() -> Self {
        Self { deferred: None }
    }

    /// An operation that takes effect once run inside a session.
    pub fn deferred<F>(f: F) -> Self
    where
        F: FnOnce(&dyn Session) -> Result<()> + Send + 'static,
    {
        Self {
            deferred: Some(Box::new(f)),
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    /// Runs the pending work inside `session`. Sessions call this from `Session::run`.
    pub fn execute(self, session: &dyn Session) -> Result<()> {
        match self.deferred {
            Some(f) => f(session),
            None => Ok(()),
        }
    }

    /// Finishes the operation when no session is available.
    ///
    /// # Errors
    /// `StateErr::MissingSession` if the operation is still deferred.
    pub fn finish(self) -> Result<()> {
        match self.deferred {
            Some(_) => Err(StateErr::MissingSession),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for BroadcastOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_deferred() {
            "deferred"
        } else {
            "completed"
        };

        f.debug_tuple("BroadcastOp").field(&kind).finish()
    }
}

/// Checks that `value` can be written into a holder named `name` of shape `expected`.
pub fn check_shape(name: &str, value: &Tensor, expected: &[usize]) -> Result<()> {
    if value.shape() != expected {
        return Err(StateErr::ShapeMismatch {
            name: name.to_string(),
            got: value.shape().to_vec(),
            expected: expected.to_vec(),
        });
    }

    Ok(())
}
