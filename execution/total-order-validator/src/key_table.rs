// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{latch::DependencyLatch, types::TxKey};
use dashmap::DashMap;
use std::collections::HashSet;

/// Maps each key to the latch of the most recent transaction that will write
/// it. This is not a lock: nobody blocks on the table itself, only on the
/// latches it hands out.
pub struct KeyLockTable<K: TxKey> {
    owners: DashMap<K, DependencyLatch>,
}

impl<K: TxKey> Default for KeyLockTable<K> {
    fn default() -> Self {
        Self {
            owners: DashMap::new(),
        }
    }
}

impl<K: TxKey> KeyLockTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `latch` as the owner of every key and returns the distinct
    /// previous owners. Each swap is atomic per key, so two conflicting
    /// registrations never both miss each other.
    ///
    /// Callers must register transactions in delivery order for the returned
    /// predecessors to reflect that order.
    pub fn register_and_get_predecessors<'a, I>(
        &self,
        latch: &DependencyLatch,
        keys: I,
    ) -> Vec<DependencyLatch>
    where
        I: IntoIterator<Item = &'a K>,
    {
        let mut seen = HashSet::new();
        let mut predecessors = Vec::new();
        for key in keys {
            if let Some(previous) = self.owners.insert(key.clone(), latch.clone()) {
                if seen.insert(previous.clone()) {
                    predecessors.push(previous);
                }
            }
        }
        predecessors
    }

    /// Clears the entry for `key` if `latch` still owns it. A later
    /// transaction's entry is never touched.
    pub fn release_if_owner(&self, key: &K, latch: &DependencyLatch) -> bool {
        self.owners
            .remove_if(key, |_, owner| owner.ptr_eq(latch))
            .is_some()
    }

    pub fn owner(&self, key: &K) -> Option<DependencyLatch> {
        self.owners.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn clear(&self) {
        self.owners.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{GlobalTransactionId, NodeId};

    fn latch(id: u64) -> DependencyLatch {
        DependencyLatch::new(GlobalTransactionId::new(NodeId(1), id))
    }

    #[test]
    fn predecessors_are_previous_owners_deduplicated() {
        let table = KeyLockTable::new();
        let (t1, t2, t3) = (latch(1), latch(2), latch(3));

        assert!(table.register_and_get_predecessors(&t1, &["a", "b"]).is_empty());
        assert_eq!(table.register_and_get_predecessors(&t2, &["a", "b"]), vec![t1.clone()]);

        let predecessors = table.register_and_get_predecessors(&t3, &["b", "c"]);
        assert_eq!(predecessors, vec![t2.clone()]);
        assert_eq!(table.owner(&"a"), Some(t2));
        assert_eq!(table.owner(&"c"), Some(t3));
    }

    #[test]
    fn release_only_removes_own_entries() {
        let table = KeyLockTable::new();
        let (t1, t2) = (latch(1), latch(2));
        table.register_and_get_predecessors(&t1, &[1, 2]);
        table.register_and_get_predecessors(&t2, &[2]);

        assert!(table.release_if_owner(&1, &t1));
        assert!(!table.release_if_owner(&2, &t1));
        assert_eq!(table.owner(&2), Some(t2.clone()));
        assert!(table.release_if_owner(&2, &t2));
        assert!(table.is_empty());
    }
}
