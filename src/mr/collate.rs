use super::{KeyMultiValue, KeyValue, MrError, comm::Communicator};
use crate::util::partition;

/// Collective: moves every pair to the rank owning its key. Received pairs are
/// ordered by source rank, then by their order on the source.
pub async fn aggregate(comm: &dyn Communicator, kv: KeyValue) -> Result<KeyValue, MrError> {
    let size = comm.size();
    let mut buckets = vec![KeyValue::new(); size];
    for (key, value) in &kv {
        buckets[partition(key, size)].add(key, value)?;
    }
    drop(kv);
    log::debug!(
        "Rank#{} sending {:?} pairs per rank",
        comm.rank(),
        buckets.iter().map(KeyValue::len).collect::<Vec<_>>()
    );

    let received = comm
        .all_to_all(buckets.into_iter().map(KeyValue::into_bytes).collect())
        .await?;
    if received.len() != size {
        return Err(MrError::ProcessGroup(format!(
            "expected {} buffers from the exchange, got {}",
            size,
            received.len()
        )));
    }

    let mut out = KeyValue::new();
    for buf in received {
        out.append(KeyValue::from_bytes(buf)?);
    }
    Ok(out)
}

/// Collective: aggregate, then group the local pairs by key.
pub async fn collate(comm: &dyn Communicator, kv: KeyValue) -> Result<KeyMultiValue, MrError> {
    let kv = aggregate(comm, kv).await?;
    KeyMultiValue::convert(&kv)
}
