use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tonic::async_trait;

use super::{MrError, hub::Hub, worker::WorkerComm};
use crate::config::GroupConfig;

/// Membership of one rank in a process group, and the collectives it can
/// take part in.
#[async_trait]
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Collective: sends `buckets[dest]` to every rank `dest` and returns the
    /// buffers addressed to this rank, ordered by source rank. Every rank of
    /// the group must call it the same number of times.
    async fn all_to_all(&self, buckets: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MrError>;

    /// Tears the pipeline down for every rank.
    async fn abort(&self, reason: &str);

    /// Leaves the group. No collective may follow.
    async fn finalize(&self) -> Result<(), MrError>;

    async fn barrier(&self) -> Result<(), MrError> {
        self.all_to_all(vec![Vec::new(); self.size()]).await?;
        Ok(())
    }
}

/// Ranks living as tasks of the current process, sharing one in-memory hub.
pub struct LocalGroup;

impl LocalGroup {
    pub fn new(size: usize) -> Vec<LocalComm> {
        let hub = Hub::new(size);
        (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                round: AtomicU64::new(0),
                hub: hub.clone(),
            })
            .collect()
    }

    pub fn singleton() -> LocalComm {
        LocalComm {
            rank: 0,
            size: 1,
            round: AtomicU64::new(0),
            hub: Hub::new(1),
        }
    }
}

pub struct LocalComm {
    rank: usize,
    size: usize,
    round: AtomicU64,
    hub: Hub,
}

#[async_trait]
impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn all_to_all(&self, buckets: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MrError> {
        let round = self.round.fetch_add(1, Ordering::SeqCst);
        self.hub.exchange(self.rank, round, buckets).await
    }

    async fn abort(&self, reason: &str) {
        self.hub.abort(Some(self.rank), reason).await;
    }

    async fn finalize(&self) -> Result<(), MrError> {
        self.hub.leave(self.rank).await
    }
}

/// Joins the group described by the environment, or runs as a group of one
/// when the process was not started by a master.
pub async fn init() -> Result<Arc<dyn Communicator>, MrError> {
    match GroupConfig::from_env()? {
        Some(config) => {
            log::info!("Joining group as rank {}/{} via {:?}", config.rank, config.size, config.master_sock);
            Ok(Arc::new(WorkerComm::connect(&config).await?))
        }
        None => {
            log::info!("No process group configured, running as a single rank");
            Ok(Arc::new(LocalGroup::singleton()))
        }
    }
}
