use std::collections::HashMap;

use super::{KeyValue, MrError};

/// All values collated under one key: a concatenated blob and the byte length
/// of every value in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub(crate) key: Vec<u8>,
    pub(crate) multivalue: Vec<u8>,
    pub(crate) lengths: Vec<u32>,
}

impl Group {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn values(&self) -> MultiValue<'_> {
        MultiValue {
            blob: &self.multivalue,
            lengths: &self.lengths,
        }
    }

    fn push(&mut self, value: &[u8]) {
        self.multivalue.extend_from_slice(value);
        // values come from a framed store, so they fit in u32
        self.lengths.push(value.len() as u32);
    }

    fn check(&self) -> Result<(), MrError> {
        let declared: u64 = self.lengths.iter().map(|&l| u64::from(l)).sum();
        if declared != self.multivalue.len() as u64 || self.lengths.is_empty() {
            return Err(MrError::CollationConsistency {
                key_len: self.key.len(),
                declared,
                actual: self.multivalue.len(),
            });
        }
        Ok(())
    }
}

/// Borrowed view of a group's values as handed to a reduce callback.
#[derive(Debug, Clone, Copy)]
pub struct MultiValue<'a> {
    blob: &'a [u8],
    lengths: &'a [u32],
}

impl<'a> MultiValue<'a> {
    pub fn blob(&self) -> &'a [u8] {
        self.blob
    }

    pub fn lengths(&self) -> &'a [u32] {
        self.lengths
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Re-segments the blob into the individual values.
    pub fn iter(self) -> impl Iterator<Item = &'a [u8]> {
        let blob = self.blob;
        self.lengths.iter().scan(0usize, move |off, &len| {
            let start = *off;
            *off += len as usize;
            blob.get(start..*off)
        })
    }
}

/// The groups held by one process after collation, one per distinct key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyMultiValue {
    groups: Vec<Group>,
}

impl KeyMultiValue {
    /// Groups the pairs of a local store by exact key bytes. Groups keep the
    /// order in which their key was first seen; values keep store order.
    pub fn convert(kv: &KeyValue) -> Result<Self, MrError> {
        let mut index: HashMap<&[u8], usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();
        for (key, value) in kv {
            let i = *index.entry(key).or_insert_with(|| {
                groups.push(Group {
                    key: key.to_vec(),
                    multivalue: Vec::new(),
                    lengths: Vec::new(),
                });
                groups.len() - 1
            });
            groups[i].push(value);
        }
        for group in &groups {
            group.check()?;
        }
        Ok(KeyMultiValue { groups })
    }

    pub(crate) fn from_groups(groups: Vec<Group>) -> Result<Self, MrError> {
        for group in &groups {
            group.check()?;
        }
        Ok(KeyMultiValue { groups })
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn nvalues(&self) -> usize {
        self.groups.iter().map(|g| g.lengths.len()).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Group> {
        self.groups.iter()
    }
}

impl<'a> IntoIterator for &'a KeyMultiValue {
    type Item = &'a Group;
    type IntoIter = std::slice::Iter<'a, Group>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.iter()
    }
}
