use std::num::NonZeroUsize;

use log::{info, warn};

use crate::{Result, StateErr, state::State};

/// Bounds for the elastic retry loop.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    reset_limit: Option<NonZeroUsize>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `StateErr::ResetLimitExceeded` instead of resetting more than
    /// `limit` times.
    pub fn with_reset_limit(mut self, limit: NonZeroUsize) -> Self {
        self.reset_limit = Some(limit);
        self
    }

    pub fn reset_limit(&self) -> Option<usize> {
        self.reset_limit.map(NonZeroUsize::get)
    }
}

/// Runs `train` until it completes, recovering from membership changes.
///
/// See [`run_with`].
pub fn run<S, T, F, R>(state: &mut S, train: F, reset: R) -> Result<T>
where
    S: State + ?Sized,
    F: FnMut(&mut S) -> Result<T>,
    R: FnMut() -> Result<()>,
{
    run_with(&RunConfig::default(), state, train, reset)
}

/// Runs `train` until it completes, recovering from membership changes.
///
/// Every attempt starts by syncing `state` from rank 0, unless the previous attempt
/// ended because hosts were only removed. A collective failure, during the sync or
/// during training, rolls the state back to its last commit before retrying. Before
/// each retry `reset` re-forms the group and `state.on_reset()` runs the state's
/// reset hooks.
///
/// # Errors
/// Any error other than `StateErr::Collective` and `StateErr::HostsUpdated`, or
/// `StateErr::ResetLimitExceeded`.
pub fn run_with<S, T, F, R>(
    config: &RunConfig,
    state: &mut S,
    mut train: F,
    mut reset: R,
) -> Result<T>
where
    S: State + ?Sized,
    F: FnMut(&mut S) -> Result<T>,
    R: FnMut() -> Result<()>,
{
    let mut skip_sync = false;
    let mut resets = 0;

    loop {
        let attempt = if skip_sync {
            train(state)
        } else {
            state.sync().and_then(|()| train(state))
        };

        match attempt {
            Ok(value) => return Ok(value),
            Err(StateErr::Collective(detail)) => {
                warn!(resets = resets; "collective failure, restoring last commit: {detail}");
                state.restore()?;
                skip_sync = false;
            }
            Err(StateErr::HostsUpdated { skip_sync: skip }) => {
                info!(resets = resets, skip_sync = skip; "hosts updated, resetting");
                skip_sync = skip;
            }
            Err(e) => return Err(e),
        }

        if let Some(limit) = config.reset_limit()
            && resets >= limit
        {
            return Err(StateErr::ResetLimitExceeded(limit));
        }

        resets += 1;
        reset()?;
        state.on_reset()?;
    }
}
