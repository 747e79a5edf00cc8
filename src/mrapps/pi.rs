//! Monte Carlo estimate of π.
//!
//! Every map task throws points into the unit square and counts how many land
//! inside the quarter circle. All tasks emit under the same key, so a single
//! reduce sums the counts.

use anyhow::{anyhow, ensure};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::mr::{KeyValue, MRApp, MultiValue};

/// The single key every task emits under: an `i32` zero, little-endian.
pub const KEY: [u8; 4] = 0i32.to_le_bytes();

/// Points inside and outside the quarter circle, encoded as two
/// little-endian `u64`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub inside: u64,
    pub outside: u64,
}

impl Counts {
    pub const ENCODED_LEN: usize = 16;

    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..8].copy_from_slice(&self.inside.to_le_bytes());
        buf[8..].copy_from_slice(&self.outside.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, anyhow::Error> {
        let bytes: &[u8; Self::ENCODED_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow!("counts are {} bytes, got {}", Self::ENCODED_LEN, bytes.len()))?;
        let (inside, outside) = bytes.split_at(8);
        Ok(Counts {
            inside: u64::from_le_bytes(inside.try_into()?),
            outside: u64::from_le_bytes(outside.try_into()?),
        })
    }

    /// Widened so that two full counters cannot overflow.
    pub fn total(&self) -> u128 {
        u128::from(self.inside) + u128::from(self.outside)
    }

    pub fn merge(self, other: Counts) -> Result<Counts, anyhow::Error> {
        let inside = self.inside.checked_add(other.inside);
        let outside = self.outside.checked_add(other.outside);
        match (inside, outside) {
            (Some(inside), Some(outside)) => Ok(Counts { inside, outside }),
            _ => Err(anyhow!("point counts overflow")),
        }
    }

    /// NaN when no point was drawn.
    pub fn estimate(&self) -> f64 {
        4.0 * self.inside as f64 / self.total() as f64
    }
}

/// Draws `samples` points with a generator seeded only from `task_id`.
pub fn sample(task_id: u64, samples: u64) -> Counts {
    let mut rng = StdRng::seed_from_u64(task_id);
    let mut counts = Counts::default();
    for _ in 0..samples {
        let x: f64 = rng.random();
        let y: f64 = rng.random();
        if x * x + y * y <= 1.0 {
            counts.inside += 1;
        } else {
            counts.outside += 1;
        }
    }
    counts
}

/// `(key words, value words)` with the key read as `i32` and the value as
/// `u64`; a trailing partial word is ignored.
pub fn format_pair(key: &[u8], value: &[u8]) -> String {
    let keys = key
        .chunks_exact(4)
        .filter_map(|w| w.try_into().ok().map(i32::from_le_bytes))
        .map(|k| k.to_string());
    let values = value
        .chunks_exact(8)
        .filter_map(|w| w.try_into().ok().map(u64::from_le_bytes))
        .map(|v| v.to_string());
    format!("({})", keys.chain(values).collect::<Vec<_>>().join(", "))
}

pub struct Pi {
    samples_per_task: u64,
}

impl Pi {
    pub fn new(samples_per_task: u64) -> Self {
        Pi { samples_per_task }
    }
}

impl MRApp for Pi {
    fn map(&self, task_id: u64, out: &mut KeyValue) -> Result<(), anyhow::Error> {
        let counts = sample(task_id, self.samples_per_task);
        out.add(&KEY, &counts.to_bytes())?;
        Ok(())
    }

    fn reduce(&self, key: &[u8], values: MultiValue<'_>, out: &mut KeyValue) -> Result<(), anyhow::Error> {
        let mut total = Counts::default();
        for value in values.iter() {
            total = total.merge(Counts::from_bytes(value)?)?;
        }
        out.add(key, &total.to_bytes())?;
        Ok(())
    }

    fn inspect(&self, key: &[u8], value: &[u8]) -> String {
        format_pair(key, value)
    }

    /// Zero sampled points is an error, not `pi=NaN`.
    fn report(&self, _key: &[u8], value: &[u8]) -> Result<String, anyhow::Error> {
        let counts = Counts::from_bytes(value)?;
        ensure!(counts.total() > 0, "no points were sampled");
        Ok(format!("pi={}", counts.estimate()))
    }
}
