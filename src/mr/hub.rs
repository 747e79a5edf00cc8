//! Round-based all-to-all exchange shared by every rank of a group.
//!
//! Each rank submits one bucket per destination for the current round and
//! waits; once the last rank has submitted, every rank receives the buckets
//! addressed to it, ordered by source rank. The hub is the only place where
//! data crosses ranks, whether the ranks are tasks of one process
//! ([`super::comm::LocalGroup`]) or processes behind the master's gRPC service.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tokio::sync::{Mutex, oneshot};

use super::MrError;

type Reply = oneshot::Sender<Result<Vec<Vec<u8>>, MrError>>;

struct Submission {
    buckets: Vec<Vec<u8>>,
    reply: Reply,
}

struct HubInner {
    size: usize,
    round: u64,
    pending: BTreeMap<usize, Submission>,
    joined: BTreeSet<usize>,
    left: BTreeSet<usize>,
    aborted: Option<String>,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<Mutex<HubInner>>,
}

impl Hub {
    pub fn new(size: usize) -> Self {
        let inner = HubInner {
            size,
            round: 0,
            pending: BTreeMap::new(),
            joined: BTreeSet::new(),
            left: BTreeSet::new(),
            aborted: None,
        };
        Hub {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.size
    }

    pub async fn join(&self, rank: usize, size: usize) -> Result<(), MrError> {
        let mut inner = self.inner.lock().await;
        if size != inner.size {
            return Err(MrError::ProcessGroup(format!(
                "rank {rank} expects a group of {size}, master runs {}",
                inner.size
            )));
        }
        inner.check_rank(rank)?;
        if !inner.joined.insert(rank) {
            return Err(MrError::ProcessGroup(format!("rank {rank} joined twice")));
        }
        log::info!("Rank#{} joined ({}/{})", rank, inner.joined.len(), inner.size);
        Ok(())
    }

    /// Submits this rank's buckets for `round` and waits for the round to
    /// complete.
    pub async fn exchange(
        &self,
        rank: usize,
        round: u64,
        buckets: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, MrError> {
        let receiver = {
            let mut inner = self.inner.lock().await;
            inner.submit(rank, round, buckets)?
        };
        receiver
            .await
            .map_err(|_| MrError::ProcessGroup("exchange dropped by hub".to_string()))?
    }

    /// Fails every pending and future exchange.
    pub async fn abort(&self, rank: Option<usize>, reason: &str) {
        let mut inner = self.inner.lock().await;
        let reason = match rank {
            Some(rank) => format!("rank {rank}: {reason}"),
            None => reason.to_string(),
        };
        if inner.aborted.is_none() {
            log::warn!("Aborting group: {}", reason);
            inner.aborted = Some(reason);
        }
        inner.fail_pending();
    }

    pub async fn leave(&self, rank: usize) -> Result<(), MrError> {
        let mut inner = self.inner.lock().await;
        inner.check_rank(rank)?;
        inner.left.insert(rank);
        log::info!("Rank#{} left ({}/{})", rank, inner.left.len(), inner.size);
        if !inner.pending.is_empty() {
            // the round can no longer complete
            inner.aborted.get_or_insert_with(|| format!("rank {rank} left during a collective"));
            inner.fail_pending();
        }
        Ok(())
    }

    pub async fn all_left(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.left.len() == inner.size
    }
}

impl HubInner {
    fn check_rank(&self, rank: usize) -> Result<(), MrError> {
        if rank >= self.size {
            return Err(MrError::ProcessGroup(format!(
                "rank {rank} outside group of {}",
                self.size
            )));
        }
        Ok(())
    }

    fn submit(
        &mut self,
        rank: usize,
        round: u64,
        buckets: Vec<Vec<u8>>,
    ) -> Result<oneshot::Receiver<Result<Vec<Vec<u8>>, MrError>>, MrError> {
        if let Some(reason) = &self.aborted {
            return Err(MrError::Aborted(reason.clone()));
        }
        self.check_rank(rank)?;
        if self.left.contains(&rank) {
            return Err(MrError::ProcessGroup(format!("rank {rank} already left")));
        }
        if round != self.round {
            return Err(MrError::ProcessGroup(format!(
                "rank {rank} submitted round {round} while the group is in round {}",
                self.round
            )));
        }
        if buckets.len() != self.size {
            return Err(MrError::ProcessGroup(format!(
                "rank {rank} sent {} buckets for a group of {}",
                buckets.len(),
                self.size
            )));
        }
        if self.pending.contains_key(&rank) {
            return Err(MrError::ProcessGroup(format!(
                "rank {rank} submitted round {round} twice"
            )));
        }

        let (reply, receiver) = oneshot::channel();
        self.pending.insert(rank, Submission { buckets, reply });
        log::trace!("Rank#{} entered round {} ({}/{})", rank, round, self.pending.len(), self.size);
        if self.pending.len() == self.size {
            self.complete_round();
        }
        Ok(receiver)
    }

    fn complete_round(&mut self) {
        let mut submissions: Vec<Submission> =
            std::mem::take(&mut self.pending).into_values().collect();
        let mut outputs: Vec<Vec<Vec<u8>>> = (0..self.size)
            .map(|_| Vec::with_capacity(self.size))
            .collect();
        // submissions are in rank order, so each output is ordered by source
        for sub in &mut submissions {
            for (dest, bucket) in sub.buckets.drain(..).enumerate() {
                outputs[dest].push(bucket);
            }
        }
        log::debug!("Round {} complete", self.round);
        self.round += 1;
        for (sub, output) in submissions.into_iter().zip(outputs) {
            let _ = sub.reply.send(Ok(output));
        }
    }

    fn fail_pending(&mut self) {
        let reason = self.aborted.clone().unwrap_or_default();
        for (_, sub) in std::mem::take(&mut self.pending) {
            let _ = sub.reply.send(Err(MrError::Aborted(reason.clone())));
        }
    }
}
