// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::ValidationError,
    types::{EntryVersions, GlobalTransactionId, PrepareResponse, TxKey},
};
use parking_lot::{Condvar, Mutex};
use std::{
    fmt, mem,
    time::{Duration, Instant},
};

pub type PrepareOutcome<K> = Result<PrepareResponse<K>, ValidationError>;

enum Slot<K: TxKey> {
    Empty,
    Ready(PrepareOutcome<K>),
    Taken,
}

/// A transaction started on this node, whose application thread waits for
/// the outcome of validating its own prepare once it comes back through the
/// total order.
pub struct LocalTransaction<K: TxKey> {
    gtx: GlobalTransactionId,
    slot: Mutex<Slot<K>>,
    ready: Condvar,
    updated_versions: Mutex<Option<EntryVersions<K>>>,
}

impl<K: TxKey> LocalTransaction<K> {
    pub fn new(gtx: GlobalTransactionId) -> Self {
        Self {
            gtx,
            slot: Mutex::new(Slot::Empty),
            ready: Condvar::new(),
            updated_versions: Mutex::new(None),
        }
    }

    pub fn gtx(&self) -> GlobalTransactionId {
        self.gtx
    }

    /// Publishes the outcome. The slot is written at most once; later calls
    /// return false and are dropped.
    pub fn add_prepare_result(&self, outcome: PrepareOutcome<K>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Empty) {
            return false;
        }
        *slot = Slot::Ready(outcome);
        self.ready.notify_all();
        true
    }

    pub fn has_prepare_result(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Empty)
    }

    /// Takes the outcome, waiting up to `timeout` for it to be published.
    /// Returns `None` on timeout or if it was already taken.
    pub fn wait_prepare_result(&self, timeout: Duration) -> Option<PrepareOutcome<K>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Empty) {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(outcome) => Some(outcome),
            Slot::Empty => {
                *slot = Slot::Empty;
                None
            },
            Slot::Taken => None,
        }
    }

    pub fn set_updated_entry_versions(&self, versions: EntryVersions<K>) {
        *self.updated_versions.lock() = Some(versions);
    }

    pub fn updated_entry_versions(&self) -> Option<EntryVersions<K>> {
        self.updated_versions.lock().clone()
    }
}

impl<K: TxKey> fmt::Debug for LocalTransaction<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("gtx", &self.gtx)
            .field("has_prepare_result", &self.has_prepare_result())
            .finish()
    }
}
