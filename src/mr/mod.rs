pub mod collate;
pub mod comm;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod keyvalue;
pub mod mapreduce;
pub mod master;
pub mod multivalue;
pub mod rpc;
pub mod worker;

pub use error::{MrError, Phase};
pub use keyvalue::KeyValue;
pub use mapreduce::MapReduce;
pub use multivalue::{Group, KeyMultiValue, MultiValue};

/// A map/reduce application over opaque byte pairs.
pub trait MRApp: Send + Sync {
    fn map(&self, task_id: u64, out: &mut KeyValue) -> Result<(), anyhow::Error>;
    fn reduce(&self, key: &[u8], values: MultiValue<'_>, out: &mut KeyValue) -> Result<(), anyhow::Error>;

    /// Human readable form of a pair, for inspection scans.
    fn inspect(&self, key: &[u8], value: &[u8]) -> String {
        format!("({:02x?}, {:02x?})", key, value)
    }

    /// Final report line for a pair of the reduced store.
    fn report(&self, key: &[u8], value: &[u8]) -> Result<String, anyhow::Error> {
        Ok(self.inspect(key, value))
    }
}
