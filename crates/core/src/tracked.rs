//! The set of resource keys desired by one reconciliation pass.

use std::collections::BTreeSet;

use crate::ResourceKey;

/// Grows monotonically for the lifetime of a pass; there is no removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedSet(BTreeSet<ResourceKey>);

impl TrackedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the key was not tracked before.
    pub fn insert(&mut self, key: ResourceKey) -> bool {
        self.0.insert(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceKey> {
        self.0.iter()
    }

    /// Sorted snapshot.
    pub fn to_vec(&self) -> Vec<ResourceKey> {
        self.0.iter().cloned().collect()
    }
}

impl FromIterator<ResourceKey> for TrackedSet {
    fn from_iter<I: IntoIterator<Item = ResourceKey>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
