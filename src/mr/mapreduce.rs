use std::sync::Arc;

use super::{
    KeyMultiValue, KeyValue, MrError, MultiValue, Phase, collate,
    comm::Communicator,
    dispatch::{run_tasks, task_range},
};
use crate::config::EngineConfig;

/// One rank's view of a map → collate → reduce → scan pipeline.
///
/// Each stage consumes the store the previous stage produced. Every rank of
/// the group must run the same sequence of stages, since collation is a
/// collective. A failing stage aborts the group and leaves this object
/// without data.
pub struct MapReduce {
    comm: Arc<dyn Communicator>,
    config: EngineConfig,
    kv: Option<KeyValue>,
    kmv: Option<KeyMultiValue>,
}

impl MapReduce {
    pub fn new(comm: Arc<dyn Communicator>, config: EngineConfig) -> Self {
        MapReduce {
            comm,
            config,
            kv: None,
            kmv: None,
        }
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    pub fn kv(&self) -> Option<&KeyValue> {
        self.kv.as_ref()
    }

    pub fn kmv(&self) -> Option<&KeyMultiValue> {
        self.kmv.as_ref()
    }

    /// Runs `map_fn` for this rank's share of the task ids `0..ntasks`.
    /// Returns the number of pairs produced locally.
    pub async fn map<F>(&mut self, ntasks: u64, map_fn: F) -> Result<u64, MrError>
    where
        F: Fn(u64, &mut KeyValue) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.kv = None;
        self.kmv = None;
        let tasks = task_range(ntasks, self.comm.rank(), self.comm.size());
        log::info!(
            "Rank#{} mapping tasks {}..{} of {}",
            self.comm.rank(),
            tasks.start,
            tasks.end,
            ntasks
        );
        let kv = match run_tasks(tasks, Arc::new(map_fn), self.config.map_concurrency).await {
            Ok(kv) => kv,
            Err(e) => return Err(self.fail(e).await),
        };
        let npairs = kv.len();
        log::info!("Rank#{} map produced {} pairs ({} bytes)", self.comm.rank(), npairs, kv.byte_len());
        self.kv = Some(kv);
        Ok(npairs)
    }

    /// Collective: redistributes the pairs so every key lives on one rank.
    pub async fn aggregate(&mut self) -> Result<u64, MrError> {
        let kv = self.take_kv("aggregate").await?;
        let kv = match collate::aggregate(self.comm.as_ref(), kv).await {
            Ok(kv) => kv,
            Err(e) => return Err(self.fail(e).await),
        };
        let npairs = kv.len();
        log::info!("Rank#{} holds {} pairs after aggregate", self.comm.rank(), npairs);
        self.kv = Some(kv);
        Ok(npairs)
    }

    /// Groups the local pairs by key. Returns the number of local groups.
    pub async fn convert(&mut self) -> Result<usize, MrError> {
        let kv = self.take_kv("convert").await?;
        let kmv = match KeyMultiValue::convert(&kv) {
            Ok(kmv) => kmv,
            Err(e) => return Err(self.fail(e).await),
        };
        let ngroups = kmv.len();
        log::info!(
            "Rank#{} converted {} pairs into {} groups",
            self.comm.rank(),
            kv.len(),
            ngroups
        );
        self.kmv = Some(kmv);
        Ok(ngroups)
    }

    /// Collective: [`aggregate`](Self::aggregate) then [`convert`](Self::convert).
    pub async fn collate(&mut self) -> Result<usize, MrError> {
        self.aggregate().await?;
        self.convert().await
    }

    /// Calls `reduce_fn` once per local group; its output becomes the store.
    /// Returns the number of pairs produced locally.
    pub async fn reduce<F>(&mut self, mut reduce_fn: F) -> Result<u64, MrError>
    where
        F: FnMut(&[u8], MultiValue<'_>, &mut KeyValue) -> anyhow::Result<()>,
    {
        let Some(kmv) = self.kmv.take() else {
            return Err(self.fail(MrError::InvalidState { op: "reduce", needs: "collated groups" }).await);
        };
        let mut out = KeyValue::new();
        for group in &kmv {
            if let Err(e) = reduce_fn(group.key(), group.values(), &mut out) {
                let e = e.context(format!("reducing key of {} bytes", group.key().len()));
                return Err(self.fail(MrError::callback(Phase::Reduce, e)).await);
            }
        }
        let npairs = out.len();
        log::info!(
            "Rank#{} reduced {} groups into {} pairs",
            self.comm.rank(),
            kmv.len(),
            npairs
        );
        self.kv = Some(out);
        Ok(npairs)
    }

    /// Visits every local pair in store order.
    pub async fn scan_kv<F>(&self, mut visit: F) -> Result<(), MrError>
    where
        F: FnMut(&[u8], &[u8]) -> anyhow::Result<()>,
    {
        let Some(kv) = &self.kv else {
            return Err(self.fail(MrError::InvalidState { op: "scan pairs", needs: "a key/value store" }).await);
        };
        for (key, value) in kv {
            if let Err(e) = visit(key, value) {
                return Err(self.fail(MrError::callback(Phase::Scan, e)).await);
            }
        }
        Ok(())
    }

    /// Visits every local group.
    pub async fn scan_kmv<F>(&self, mut visit: F) -> Result<(), MrError>
    where
        F: FnMut(&[u8], MultiValue<'_>) -> anyhow::Result<()>,
    {
        let Some(kmv) = &self.kmv else {
            return Err(self.fail(MrError::InvalidState { op: "scan groups", needs: "collated groups" }).await);
        };
        for group in kmv {
            if let Err(e) = visit(group.key(), group.values()) {
                return Err(self.fail(MrError::callback(Phase::Scan, e)).await);
            }
        }
        Ok(())
    }

    async fn take_kv(&mut self, op: &'static str) -> Result<KeyValue, MrError> {
        self.kmv = None;
        match self.kv.take() {
            Some(kv) => Ok(kv),
            None => Err(self.fail(MrError::InvalidState { op, needs: "a key/value store" }).await),
        }
    }

    /// Propagates a failure to the rest of the group before handing it back.
    async fn fail(&self, err: MrError) -> MrError {
        log::error!("Rank#{} aborting pipeline: {}", self.comm.rank(), err);
        if !matches!(err, MrError::Aborted(_)) {
            self.comm.abort(&err.to_string()).await;
        }
        err
    }
}
