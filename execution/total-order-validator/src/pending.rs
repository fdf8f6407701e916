// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    latch::DependencyLatch,
    types::{EntryVersions, GlobalTransactionId, TxKey},
};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashSet,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

/// Externally visible state of a remote transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    None,
    MarkedRollback,
    MarkedCommit,
    Preparing,
    Prepared,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mark {
    Commit,
    Rollback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Received,
    Preparing,
    Prepared,
}

/// What the prepare task must do once its predecessors are done.
#[derive(Debug, PartialEq, Eq)]
pub enum PrepareDecision<K: TxKey> {
    Proceed,
    /// A rollback overtook the prepare, the downstream chain is skipped.
    Rollback,
    /// A commit overtook the prepare, which now has to commit in one phase
    /// using the versions carried by the commit.
    OnePhase(Option<EntryVersions<K>>),
}

/// Outcome of a commit or rollback waiting for its prepare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreparedWait {
    /// The prepare is done, the caller processes its command.
    Prepared,
    /// The prepare has not started yet and will consume the mark.
    Deferred,
    TimedOut,
    /// The validator was stopped.
    Interrupted,
}

struct Status<K: TxKey> {
    mark: Option<Mark>,
    phase: Phase,
    one_phase: bool,
    updated_versions: Option<EntryVersions<K>>,
    interrupted: bool,
}

/// State of a transaction from another node, shared between the thread that
/// validates its prepare and the threads delivering its commit or rollback.
pub struct PendingRemoteTransaction<K: TxKey> {
    gtx: GlobalTransactionId,
    latch: DependencyLatch,
    modified_keys: OnceCell<HashSet<K>>,
    status: Mutex<Status<K>>,
    prepared: Condvar,
    finished: AtomicBool,
}

impl<K: TxKey> PendingRemoteTransaction<K> {
    pub fn new(gtx: GlobalTransactionId) -> Self {
        Self {
            gtx,
            latch: DependencyLatch::new(gtx),
            modified_keys: OnceCell::new(),
            status: Mutex::new(Status {
                mark: None,
                phase: Phase::Received,
                one_phase: false,
                updated_versions: None,
                interrupted: false,
            }),
            prepared: Condvar::new(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn gtx(&self) -> GlobalTransactionId {
        self.gtx
    }

    pub fn latch(&self) -> &DependencyLatch {
        &self.latch
    }

    /// Records the write set. Only the first call wins.
    pub fn set_modified_keys(&self, keys: HashSet<K>) -> bool {
        self.modified_keys.set(keys).is_ok()
    }

    pub fn modified_keys(&self) -> Option<&HashSet<K>> {
        self.modified_keys.get()
    }

    pub fn state(&self) -> TransactionState {
        let status = self.status.lock();
        match (status.phase, status.mark) {
            (Phase::Prepared, _) => TransactionState::Prepared,
            (_, Some(Mark::Rollback)) => TransactionState::MarkedRollback,
            (_, Some(Mark::Commit)) => TransactionState::MarkedCommit,
            (Phase::Preparing, None) => TransactionState::Preparing,
            (Phase::Received, None) => TransactionState::None,
        }
    }

    pub fn is_marked_for_rollback(&self) -> bool {
        self.status.lock().mark == Some(Mark::Rollback)
    }

    pub fn is_one_phase(&self) -> bool {
        self.status.lock().one_phase
    }

    /// Places a rollback mark unless another mark exists or the prepare is
    /// already done. Returns whether the mark was placed.
    pub fn mark_for_rollback(&self) -> bool {
        let mut status = self.status.lock();
        Self::place_mark(&mut status, Mark::Rollback, None)
    }

    pub fn mark_for_commit(&self, versions: Option<EntryVersions<K>>) -> bool {
        let mut status = self.status.lock();
        Self::place_mark(&mut status, Mark::Commit, versions)
    }

    fn place_mark(
        status: &mut Status<K>,
        mark: Mark,
        versions: Option<EntryVersions<K>>,
    ) -> bool {
        if status.phase == Phase::Prepared || status.mark.is_some() {
            return false;
        }
        status.mark = Some(mark);
        if mark == Mark::Commit {
            status.updated_versions = versions;
        }
        true
    }

    /// Moves the transaction into `Preparing` and consumes any mark placed by
    /// an early commit or rollback.
    pub fn mark_for_preparing(&self) -> PrepareDecision<K> {
        let mut status = self.status.lock();
        if status.phase == Phase::Received {
            status.phase = Phase::Preparing;
        }
        match status.mark {
            Some(Mark::Rollback) => PrepareDecision::Rollback,
            Some(Mark::Commit) => {
                status.one_phase = true;
                PrepareDecision::OnePhase(status.updated_versions.take())
            },
            None => PrepareDecision::Proceed,
        }
    }

    /// Moves the transaction into `Prepared` and wakes every waiting commit or
    /// rollback.
    pub fn mark_prepared_and_notify(&self) {
        let mut status = self.status.lock();
        status.phase = Phase::Prepared;
        self.prepared.notify_all();
    }

    /// Called by a commit (`is_commit`) or rollback before processing its
    /// command.
    pub fn wait_prepared(
        &self,
        is_commit: bool,
        versions: Option<EntryVersions<K>>,
        timeout: Duration,
    ) -> PreparedWait {
        let mark = if is_commit {
            Mark::Commit
        } else {
            Mark::Rollback
        };
        let mut status = self.status.lock();
        if status.interrupted {
            return PreparedWait::Interrupted;
        }
        match status.phase {
            Phase::Prepared => PreparedWait::Prepared,
            Phase::Received => {
                Self::place_mark(&mut status, mark, versions);
                PreparedWait::Deferred
            },
            Phase::Preparing => {
                Self::place_mark(&mut status, mark, versions);
                let deadline = Instant::now() + timeout;
                while status.phase != Phase::Prepared {
                    if status.interrupted {
                        return PreparedWait::Interrupted;
                    }
                    if self
                        .prepared
                        .wait_until(&mut status, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                if status.phase == Phase::Prepared {
                    PreparedWait::Prepared
                } else if status.interrupted {
                    PreparedWait::Interrupted
                } else {
                    PreparedWait::TimedOut
                }
            },
        }
    }

    /// Wakes every commit or rollback waiting on this transaction. Used on
    /// shutdown.
    pub fn interrupt(&self) {
        let mut status = self.status.lock();
        status.interrupted = true;
        self.prepared.notify_all();
    }

    /// Claims the terminal cleanup. Only the first caller gets true.
    pub fn try_finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl<K: TxKey> fmt::Debug for PendingRemoteTransaction<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRemoteTransaction")
            .field("gtx", &self.gtx)
            .field("state", &self.state())
            .field("modified_keys", &self.modified_keys.get())
            .finish()
    }
}
