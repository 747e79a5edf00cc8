use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::anyhow;
use tokio::sync::Semaphore;

use super::{KeyValue, MrError, Phase};

/// Contiguous, balanced slice of `[0, ntasks)` owned by `rank`.
pub fn task_range(ntasks: u64, rank: usize, size: usize) -> Range<u64> {
    let size = size.max(1) as u128;
    let bound = |r: u128| (u128::from(ntasks) * r / size) as u64;
    bound(rank as u128)..bound(rank as u128 + 1)
}

/// Runs `map_fn` once per task id, at most `concurrency` at a time, each with
/// a private sink. Sinks are merged in task id order once every task has
/// finished; the first failure discards everything.
pub(crate) async fn run_tasks<F>(
    tasks: Range<u64>,
    map_fn: Arc<F>,
    concurrency: usize,
) -> Result<KeyValue, MrError>
where
    F: Fn(u64, &mut KeyValue) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let failed = Arc::new(AtomicBool::new(false));
    let mut handles = BTreeMap::new();
    for task_id in tasks {
        let perm = sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MrError::callback(Phase::Map, e.into()))?;
        if failed.load(Ordering::SeqCst) {
            break;
        }
        let map_fn = map_fn.clone();
        let failed = failed.clone();
        handles.insert(
            task_id,
            tokio::task::spawn_blocking(move || {
                let mut kv = KeyValue::new();
                let res = map_fn(task_id, &mut kv);
                if res.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                drop(perm);
                res.map(|_| kv)
            }),
        );
    }

    let mut out = KeyValue::new();
    let mut first_err = None;
    for (task_id, handle) in handles {
        let res = match handle.await {
            Ok(res) => res,
            Err(e) => Err(anyhow!("task panicked: {}", e)),
        };
        match res {
            Ok(kv) if first_err.is_none() => out.append(kv),
            Ok(_) => {}
            Err(e) => {
                log::debug!("Map task#{} failed: {:#}", task_id, e);
                if first_err.is_none() {
                    first_err = Some(e.context(format!("map task {task_id}")));
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(MrError::callback(Phase::Map, e)),
        None => Ok(out),
    }
}
