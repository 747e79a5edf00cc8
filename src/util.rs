use std::hash::Hasher;

// hash function

/// FNV-1a over raw key bytes. Unseeded, so every process agrees on it.
pub(crate) fn hash(key: &[u8]) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// Rank that owns `key` in a group of `size` processes.
pub(crate) fn partition(key: &[u8], size: usize) -> usize {
    (hash(key) % size.max(1) as u64) as usize
}
