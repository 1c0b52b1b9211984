use std::{error::Error, fmt, io};

/// The elastic module's result type.
pub type Result<T> = std::result::Result<T, StateErr>;

/// Failures raised while capturing, restoring or synchronizing training state.
#[derive(Debug)]
pub enum StateErr {
    /// The model's parameter shapes are not determined yet.
    ModelNotBuilt,
    /// Neither an explicit optimizer was given nor the model was compiled with one.
    MissingOptimizer,
    /// A deferred operation had no session to run in.
    MissingSession,
    /// Graph-mode model broadcast requires a backend to get the session from.
    MissingBackend,
    /// Two attributes were registered under the same name.
    DuplicateAttribute(String),
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    LengthMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// The collective substrate failed, e.g. a peer died mid-broadcast.
    Collective(String),
    /// The membership changed and every rank agreed to restart the step.
    HostsUpdated {
        skip_sync: bool,
    },
    ResetLimitExceeded(usize),
    /// A plain-data value could not be encoded or decoded.
    Serde(bincode::Error),
    Io(io::Error),
}

impl fmt::Display for StateErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateErr::ModelNotBuilt => {
                write!(f, "model must be built first, build it with its input shape")
            }
            StateErr::MissingOptimizer => write!(f, "no optimizer given and the model has none"),
            StateErr::MissingSession => write!(f, "deferred operation requires a session"),
            StateErr::MissingBackend => {
                write!(f, "graph mode model broadcast requires a backend")
            }
            StateErr::DuplicateAttribute(name) => {
                write!(f, "attribute {name:?} is registered more than once")
            }
            StateErr::ShapeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {name}: got {got:?}, expected {expected:?}"
            ),
            StateErr::LengthMismatch {
                what,
                got,
                expected,
            } => write!(f, "{what} length mismatch: got {got}, expected {expected}"),
            StateErr::Collective(detail) => write!(f, "collective operation failed: {detail}"),
            StateErr::HostsUpdated { skip_sync } => {
                write!(f, "hosts updated (skip_sync={skip_sync})")
            }
            StateErr::ResetLimitExceeded(limit) => {
                write!(f, "reset limit of {limit} exceeded")
            }
            StateErr::Serde(e) => write!(f, "serde error: {e}"),
            StateErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for StateErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StateErr::Serde(e) => Some(e),
            StateErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StateErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<bincode::Error> for StateErr {
    fn from(value: bincode::Error) -> Self {
        Self::Serde(value)
    }
}
