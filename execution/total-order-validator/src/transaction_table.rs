// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    pending::PendingRemoteTransaction,
    types::{GlobalTransactionId, TxKey},
};
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of remote transactions this node has heard of but not finished.
/// Prepare, commit and rollback may each be the first to arrive, so lookups
/// create the record on demand.
pub struct RemoteTransactionTable<K: TxKey> {
    transactions: DashMap<GlobalTransactionId, Arc<PendingRemoteTransaction<K>>>,
}

impl<K: TxKey> Default for RemoteTransactionTable<K> {
    fn default() -> Self {
        Self {
            transactions: DashMap::new(),
        }
    }
}

impl<K: TxKey> RemoteTransactionTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, gtx: GlobalTransactionId) -> Arc<PendingRemoteTransaction<K>> {
        let entry = self
            .transactions
            .entry(gtx)
            .or_insert_with(|| Arc::new(PendingRemoteTransaction::new(gtx)));
        Arc::clone(entry.value())
    }

    pub fn get(&self, gtx: &GlobalTransactionId) -> Option<Arc<PendingRemoteTransaction<K>>> {
        self.transactions
            .get(gtx)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, gtx: &GlobalTransactionId) -> Option<Arc<PendingRemoteTransaction<K>>> {
        self.transactions.remove(gtx).map(|(_, pending)| pending)
    }

    /// Removes the record only if it is still `pending`, so a record that was
    /// recreated under the same id is left alone.
    pub fn remove_if_same(&self, pending: &Arc<PendingRemoteTransaction<K>>) -> bool {
        self.transactions
            .remove_if(&pending.gtx(), |_, current| Arc::ptr_eq(current, pending))
            .is_some()
    }

    pub fn contains(&self, gtx: &GlobalTransactionId) -> bool {
        self.transactions.contains_key(gtx)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Empties the table, returning what it held.
    pub fn drain(&self) -> Vec<Arc<PendingRemoteTransaction<K>>> {
        let gtxs: Vec<_> = self.transactions.iter().map(|entry| *entry.key()).collect();
        gtxs.iter().filter_map(|gtx| self.remove(gtx)).collect()
    }
}
