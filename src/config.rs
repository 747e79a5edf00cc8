//! Process group and engine settings, read from the environment the master
//! prepares for every rank.

use std::path::PathBuf;

use crate::mr::MrError;

pub const ENV_RANK: &str = "MRPI_RANK";
pub const ENV_SIZE: &str = "MRPI_SIZE";
pub const ENV_MASTER_SOCK: &str = "MRPI_MASTER_SOCK";
pub const ENV_MAP_THREADS: &str = "MRPI_MAP_THREADS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub rank: usize,
    pub size: usize,
    pub master_sock: PathBuf,
}

impl GroupConfig {
    /// `Ok(None)` when the process was started outside a group.
    pub fn from_env() -> Result<Option<Self>, MrError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Option<Self>, MrError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (rank, size, sock) = (lookup(ENV_RANK), lookup(ENV_SIZE), lookup(ENV_MASTER_SOCK));
        let (rank, size, sock) = match (rank, size, sock) {
            (None, None, None) => return Ok(None),
            (Some(rank), Some(size), Some(sock)) => (rank, size, sock),
            _ => {
                return Err(MrError::ProcessGroup(format!(
                    "{ENV_RANK}, {ENV_SIZE} and {ENV_MASTER_SOCK} must be set together"
                )));
            }
        };
        let rank = parse_var(ENV_RANK, &rank)?;
        let size = parse_var(ENV_SIZE, &size)?;
        if size == 0 || rank >= size {
            return Err(MrError::ProcessGroup(format!("rank {rank} outside group of {size}")));
        }
        Ok(Some(GroupConfig {
            rank,
            size,
            master_sock: PathBuf::from(sock),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Map tasks running at once inside one process.
    pub map_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let map_concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        EngineConfig { map_concurrency }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, MrError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, MrError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();
        if let Some(threads) = lookup(ENV_MAP_THREADS) {
            let threads: usize = parse_var(ENV_MAP_THREADS, &threads)?;
            config.map_concurrency = threads.max(1);
        }
        Ok(config)
    }
}

fn parse_var(name: &str, value: &str) -> Result<usize, MrError> {
    value
        .trim()
        .parse()
        .map_err(|e| MrError::ProcessGroup(format!("invalid {name}={value:?}: {e}")))
}
