use std::{env, fmt::Display, net::SocketAddr, num::NonZeroUsize, str::FromStr};

use anyhow::{Context, Result, anyhow};
use elastic::{RunConfig, collective::GroupConfig};

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:47000";
const DEFAULT_EPOCHS: usize = 5;
const DEFAULT_COMMIT_EVERY: usize = 10;

/// Everything a training node needs to know before joining its group.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    rank: usize,
    size: NonZeroUsize,
    hub_addr: SocketAddr,
    epochs: NonZeroUsize,
    commit_every: NonZeroUsize,
    reset_limit: Option<NonZeroUsize>,
}

impl NodeConfig {
    /// Reads the configuration from the process environment.
    ///
    /// `RANK` and `SIZE` are required; `HUB_ADDR`, `EPOCHS`, `COMMIT_EVERY` and
    /// `RESET_LIMIT` are optional.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its
    /// value if set.
    ///
    /// # Errors
    /// If a required variable is missing, a value does not parse or the rank is
    /// out of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| lookup(key).ok_or_else(|| anyhow!("{key} is not set"));

        let rank = parse("RANK", &required("RANK")?)?;
        let size = parse("SIZE", &required("SIZE")?)?;
        let hub_addr = parse(
            "HUB_ADDR",
            &lookup("HUB_ADDR").unwrap_or_else(|| DEFAULT_HUB_ADDR.to_string()),
        )?;
        let epochs = optional(&lookup, "EPOCHS", DEFAULT_EPOCHS)?;
        let commit_every = optional(&lookup, "COMMIT_EVERY", DEFAULT_COMMIT_EVERY)?;
        let reset_limit = lookup("RESET_LIMIT")
            .map(|value| parse("RESET_LIMIT", &value))
            .transpose()?;

        if rank >= NonZeroUsize::get(size) {
            return Err(anyhow!("RANK {rank} is out of range for SIZE {size}"));
        }

        Ok(Self {
            rank,
            size,
            hub_addr,
            epochs,
            commit_every,
            reset_limit,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn epochs(&self) -> usize {
        self.epochs.get()
    }

    /// How many batches run between two commits.
    pub fn commit_every(&self) -> usize {
        self.commit_every.get()
    }

    /// The group to join, and to re-join after every reset.
    pub fn group(&self) -> GroupConfig {
        GroupConfig::new(self.rank, self.size, self.hub_addr)
    }

    pub fn run(&self) -> RunConfig {
        match self.reset_limit {
            Some(limit) => RunConfig::new().with_reset_limit(limit),
            None => RunConfig::new(),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("{e}"))
        .with_context(|| format!("invalid {key}: {value:?}"))
}

fn optional<F>(lookup: &F, key: &str, default: usize) -> Result<NonZeroUsize>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => parse(key, &value),
        // SAFETY: Defaults are non zero constants.
        None => Ok(NonZeroUsize::new(default).unwrap()),
    }
}
