// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{ConfigSanitizer, TotalOrderConfig},
    counters,
    errors::Error,
    key_table::KeyLockTable,
    local::LocalTransaction,
    pending::{PendingRemoteTransaction, PreparedWait},
    statistics::{ValidatorStatistics, ValidatorStats},
    task::{ValidationMode, ValidationTask},
    transaction_table::RemoteTransactionTable,
    types::{
        CommandInvoker, EntryVersions, GlobalTransactionId, PrepareCommand, TxInvocationContext,
        TxKey,
    },
};
use dashmap::DashMap;
use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use total_order_bounded_executor::{BoundedExecutor, ExecutorConfig};
use tracing::{debug, info, trace, warn};

const THREAD_NAME_PREFIX: &str = "total_order_vali";

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum ValidatorState {
    Injected,
    Started,
    Stopped,
}

/// State shared between the validator and its in-flight tasks.
pub(crate) struct ValidatorShared<K: TxKey> {
    pub(crate) invoker: Arc<dyn CommandInvoker<K>>,
    pub(crate) local_transactions: DashMap<GlobalTransactionId, Arc<LocalTransaction<K>>>,
    pub(crate) remote_transactions: RemoteTransactionTable<K>,
    pub(crate) keys_locked: KeyLockTable<K>,
    pub(crate) statistics: ValidatorStats,
    pub(crate) dependency_wait_timeout: Option<Duration>,
    recently_finished: Mutex<LruCache<GlobalTransactionId, ()>>,
    stopped: AtomicBool,
}

impl<K: TxKey> ValidatorShared<K> {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Must happen before the record is removed, so a racing commit or
    /// rollback either finds the record or sees the transaction as finished.
    fn remember_finished(&self, gtx: GlobalTransactionId) {
        self.recently_finished.lock().put(gtx, ());
    }

    pub(crate) fn is_recently_finished(&self, gtx: &GlobalTransactionId) -> bool {
        self.recently_finished.lock().contains(gtx)
    }

    /// Finishes a transaction whose prepare concluded it (one phase or
    /// failed). The record is only removed if it is still the registered one.
    pub(crate) fn complete_transaction(&self, pending: &Arc<PendingRemoteTransaction<K>>) {
        self.remember_finished(pending.gtx());
        self.remote_transactions.remove_if_same(pending);
        self.finish_pending(pending);
    }

    /// Releases the latch and the key-table entries still owned by the
    /// transaction. Safe to call from racing threads.
    pub(crate) fn finish_pending(&self, pending: &PendingRemoteTransaction<K>) {
        let latch = pending.latch();
        latch.release();
        if !pending.try_finish() {
            return;
        }
        if let Some(keys) = pending.modified_keys() {
            for key in keys {
                self.keys_locked.release_if_owner(key, latch);
            }
        }
        counters::PENDING_REMOTE_TRANSACTIONS.set(self.remote_transactions.len() as i64);
        trace!(gtx = %pending.gtx(), "Released resources of transaction");
    }
}

struct ValidatorRuntime {
    executor: BoundedExecutor,
    multi_thread: bool,
}

/// Validates prepares delivered in total order. Conflicting transactions are
/// validated in delivery order; when the write-skew check is on, transactions
/// with disjoint write sets are validated in parallel.
pub struct TotalOrderValidator<K: TxKey> {
    config: TotalOrderConfig,
    shared: Arc<ValidatorShared<K>>,
    runtime: OnceCell<ValidatorRuntime>,
    state: Mutex<ValidatorState>,
}

impl<K: TxKey> TotalOrderValidator<K> {
    pub fn new(config: TotalOrderConfig, invoker: Arc<dyn CommandInvoker<K>>) -> Self {
        let shared = Arc::new(ValidatorShared {
            invoker,
            local_transactions: DashMap::new(),
            remote_transactions: RemoteTransactionTable::new(),
            keys_locked: KeyLockTable::new(),
            statistics: ValidatorStats::new(config.statistics_enabled),
            dependency_wait_timeout: config.dependency_wait_timeout(),
            recently_finished: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.recently_finished_capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            stopped: AtomicBool::new(false),
        });
        Self {
            config,
            shared,
            runtime: OnceCell::new(),
            state: Mutex::new(ValidatorState::Injected),
        }
    }

    pub fn config(&self) -> &TotalOrderConfig {
        &self.config
    }

    pub fn state(&self) -> ValidatorState {
        *self.state.lock()
    }

    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if *state != ValidatorState::Injected {
            return Err(Error::InvalidState {
                expected: ValidatorState::Injected,
                actual: *state,
            });
        }
        TotalOrderConfig::sanitize(&self.config)?;

        let multi_thread = self.config.needs_multi_thread_validation();
        let executor_config = if multi_thread {
            ExecutorConfig {
                core_pool_size: self.config.core_pool_size,
                max_pool_size: self.config.max_pool_size,
                keep_alive: self.config.keep_alive(),
                queue_capacity: Some(self.config.queue_capacity),
                thread_name_prefix: THREAD_NAME_PREFIX.to_string(),
            }
        } else {
            ExecutorConfig::single_worker(THREAD_NAME_PREFIX)
        };
        let executor = BoundedExecutor::new(executor_config)?;
        self.shared
            .statistics
            .set_enabled(self.config.statistics_enabled);

        info!(
            multi_thread_validation = multi_thread,
            core_pool_size = executor.core_pool_size(),
            max_pool_size = executor.max_pool_size(),
            keep_alive_ms = executor.keep_alive().as_millis() as u64,
            "Total order validator started"
        );
        if self
            .runtime
            .set(ValidatorRuntime {
                executor,
                multi_thread,
            })
            .is_err()
        {
            return Err(Error::InvalidState {
                expected: ValidatorState::Injected,
                actual: ValidatorState::Started,
            });
        }
        *state = ValidatorState::Started;
        Ok(())
    }

    /// Stops accepting work, drops queued prepares and wakes everything
    /// waiting on a pending transaction. Running prepares are not awaited.
    pub fn stop(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if *state != ValidatorState::Started {
            return Err(Error::InvalidState {
                expected: ValidatorState::Started,
                actual: *state,
            });
        }
        self.shared.stopped.store(true, Ordering::Release);

        let dropped = self
            .runtime
            .get()
            .map_or(0, |runtime| runtime.executor.shutdown_now());
        let pending = self.shared.remote_transactions.drain();
        let interrupted = pending.len();
        for pending in pending {
            pending.interrupt();
            self.shared.finish_pending(&pending);
        }
        self.shared.local_transactions.clear();
        self.shared.keys_locked.clear();
        self.shared.recently_finished.lock().clear();
        counters::PENDING_REMOTE_TRANSACTIONS.set(0);

        *state = ValidatorState::Stopped;
        info!(
            dropped_tasks = dropped,
            interrupted_transactions = interrupted,
            "Total order validator stopped"
        );
        Ok(())
    }

    fn runtime(&self) -> Result<&ValidatorRuntime, Error> {
        match *self.state.lock() {
            ValidatorState::Injected => Err(Error::NotStarted),
            ValidatorState::Stopped => Err(Error::ExecutorShutdown),
            ValidatorState::Started => self.runtime.get().ok_or(Error::NotStarted),
        }
    }

    /// Whether prepares are validated by the dependency-aware pool. `None`
    /// before start.
    pub fn is_multi_thread_validation(&self) -> Option<bool> {
        self.runtime.get().map(|runtime| runtime.multi_thread)
    }

    /// Registers a transaction started on this node so it receives the
    /// outcome of its own prepare.
    pub fn add_local_transaction(&self, gtx: GlobalTransactionId, local: Arc<LocalTransaction<K>>) {
        trace!(gtx = %gtx, "Registered local transaction");
        self.shared.local_transactions.insert(gtx, local);
    }

    /// Queues a prepare for validation. Prepares must be submitted in delivery
    /// order from a single thread. Only blocks when the pool is saturated, in
    /// which case the prepare is validated on the calling thread.
    pub fn validate_transaction(
        &self,
        command: PrepareCommand<K>,
        ctx: TxInvocationContext<K>,
    ) -> Result<(), Error> {
        debug_assert!(!ctx.is_origin_local());
        let runtime = self.runtime()?;
        let gtx = *command.gtx();

        let mode = if runtime.multi_thread {
            let pending = self.shared.remote_transactions.get_or_create(gtx);
            pending.set_modified_keys(command.affected_keys().clone());
            let predecessors = if pending.is_marked_for_rollback() {
                Vec::new()
            } else {
                self.shared
                    .keys_locked
                    .register_and_get_predecessors(pending.latch(), command.affected_keys())
            };
            counters::PENDING_REMOTE_TRANSACTIONS
                .set(self.shared.remote_transactions.len() as i64);
            trace!(
                gtx = %gtx,
                write_set = ?command.affected_keys(),
                predecessors = ?predecessors.iter().map(|latch| latch.gtx()).collect::<Vec<_>>(),
                "Computed dependencies"
            );
            ValidationMode::DependencyAware {
                pending,
                predecessors,
            }
        } else {
            trace!(gtx = %gtx, "Validating transaction in delivery order");
            ValidationMode::Direct
        };

        let task = ValidationTask::new(command, ctx, mode, self.shared.clone());
        let submission = runtime
            .executor
            .execute(move || task.run())
            .map_err(|_| Error::ExecutorShutdown)?;
        counters::record_submission(submission);
        Ok(())
    }

    /// Called by a commit (`is_commit`) or rollback before processing its
    /// command. Returns true if the caller must process it now (including when
    /// the transaction is already finished), false if the prepare will act on
    /// it, or if the wait was cut short.
    pub fn wait_for_tx_prepared(
        &self,
        gtx: GlobalTransactionId,
        is_commit: bool,
        versions: Option<EntryVersions<K>>,
    ) -> bool {
        if self.shared.is_stopped() {
            warn!(gtx = %gtx, "Validator stopped, not waiting for transaction to be prepared");
            return false;
        }
        match self.is_multi_thread_validation() {
            Some(true) => {},
            Some(false) => return true,
            None => {
                warn!(
                    gtx = %gtx,
                    "Validator not started, not waiting for transaction to be prepared"
                );
                return false;
            },
        }

        if self.shared.is_recently_finished(&gtx) {
            debug!(gtx = %gtx, is_commit = is_commit, "Transaction already finished");
            counters::PREPARED_WAITS.with_label_values(&["finished"]).inc();
            return true;
        }

        trace!(
            gtx = %gtx,
            is_commit = is_commit,
            versions = ?versions,
            "Waiting until transaction is prepared"
        );
        let pending = self.shared.remote_transactions.get_or_create(gtx);
        if self.shared.is_recently_finished(&gtx) {
            // Finished while the record was looked up. Whichever record was
            // returned, finishing it again is a no-op.
            if self.shared.remote_transactions.remove_if_same(&pending) {
                self.shared.finish_pending(&pending);
            }
            counters::PREPARED_WAITS.with_label_values(&["finished"]).inc();
            return true;
        }
        let result =
            pending.wait_prepared(is_commit, versions, self.config.prepared_wait_timeout());
        let label = match result {
            PreparedWait::Prepared => "prepared",
            PreparedWait::Deferred => "deferred",
            PreparedWait::TimedOut => {
                warn!(
                    gtx = %gtx,
                    timeout_ms = self.config.prepared_wait_timeout_ms,
                    "Timed out waiting until transaction is prepared"
                );
                "timed_out"
            },
            PreparedWait::Interrupted => {
                warn!(gtx = %gtx, "Interrupted waiting until transaction is prepared");
                "interrupted"
            },
        };
        counters::PREPARED_WAITS.with_label_values(&[label]).inc();
        trace!(gtx = %gtx, result = label, "Transaction finished waiting");
        result == PreparedWait::Prepared
    }

    /// Releases everything held by a remote transaction once its commit or
    /// rollback has been processed. A missing record is an error unless
    /// `ignore_missing` is set.
    pub fn finish_transaction(
        &self,
        gtx: GlobalTransactionId,
        ignore_missing: bool,
    ) -> Result<(), Error> {
        trace!(gtx = %gtx, "Transaction is finished");
        self.shared.remember_finished(gtx);
        match self.shared.remote_transactions.remove(&gtx) {
            Some(pending) => {
                self.shared.finish_pending(&pending);
                Ok(())
            },
            None if ignore_missing => Ok(()),
            None => {
                warn!(gtx = %gtx, "Remote transaction not found while finishing it");
                Err(Error::RemoteTransactionNotFound(gtx))
            },
        }
    }

    /// Marks a remote transaction for rollback without waiting for its
    /// prepare. Returns whether the mark was placed.
    pub fn mark_transaction_for_rollback(&self, gtx: GlobalTransactionId) -> bool {
        if self.is_multi_thread_validation() != Some(true)
            || self.shared.is_stopped()
            || self.shared.is_recently_finished(&gtx)
        {
            return false;
        }
        let marked = self
            .shared
            .remote_transactions
            .get_or_create(gtx)
            .mark_for_rollback();
        debug!(gtx = %gtx, marked = marked, "Marked transaction for rollback");
        marked
    }

    pub fn is_transaction_pending(&self, gtx: &GlobalTransactionId) -> bool {
        self.shared.local_transactions.contains_key(gtx)
            || self.shared.remote_transactions.contains(gtx)
    }

    pub fn pending_remote_transactions(&self) -> usize {
        self.shared.remote_transactions.len()
    }

    pub fn locked_keys(&self) -> usize {
        self.shared.keys_locked.len()
    }

    fn executor(&self) -> Option<&BoundedExecutor> {
        self.runtime.get().map(|runtime| &runtime.executor)
    }

    fn pool_executor(&self) -> Option<&BoundedExecutor> {
        self.runtime
            .get()
            .filter(|runtime| runtime.multi_thread)
            .map(|runtime| &runtime.executor)
    }

    pub fn thread_pool_core_size(&self) -> Option<usize> {
        self.executor().map(BoundedExecutor::core_pool_size)
    }

    pub fn thread_pool_max_size(&self) -> Option<usize> {
        self.executor().map(BoundedExecutor::max_pool_size)
    }

    pub fn thread_pool_keep_alive(&self) -> Option<Duration> {
        self.executor().map(BoundedExecutor::keep_alive)
    }

    /// Ignored unless prepares are validated by the dependency-aware pool.
    pub fn set_thread_pool_core_size(&self, size: usize) -> Result<(), Error> {
        match self.pool_executor() {
            Some(executor) => Ok(executor.set_core_pool_size(size)?),
            None => {
                debug!(size = size, "Ignoring core pool size change");
                Ok(())
            },
        }
    }

    /// Ignored unless prepares are validated by the dependency-aware pool.
    pub fn set_thread_pool_max_size(&self, size: usize) -> Result<(), Error> {
        match self.pool_executor() {
            Some(executor) => Ok(executor.set_max_pool_size(size)?),
            None => {
                debug!(size = size, "Ignoring max pool size change");
                Ok(())
            },
        }
    }

    pub fn set_thread_pool_keep_alive(&self, keep_alive: Duration) {
        if let Some(executor) = self.executor() {
            executor.set_keep_alive(keep_alive);
        }
    }

    /// Share of the bounded queue currently in use, `None` when the queue is
    /// unbounded or the validator is not started.
    pub fn pending_queue_occupancy_pct(&self) -> Option<f64> {
        let executor = self.executor()?;
        let capacity = executor.queue_capacity()?;
        if capacity == 0 {
            return Some(0.0);
        }
        let pct = executor.queued_count() as f64 * 100.0 / capacity as f64;
        Some(pct.min(100.0))
    }

    pub fn active_threads_pct(&self) -> Option<f64> {
        let executor = self.executor()?;
        let pct = executor.active_count() as f64 * 100.0 / executor.max_pool_size() as f64;
        Some(pct.min(100.0))
    }

    pub fn average_waiting_time_in_queue_ms(&self) -> f64 {
        self.shared.statistics.average_waiting_time_in_queue_ms()
    }

    pub fn average_initialization_duration_ms(&self) -> f64 {
        self.shared.statistics.average_initialization_duration_ms()
    }

    pub fn average_validation_duration_ms(&self) -> f64 {
        self.shared.statistics.average_validation_duration_ms()
    }

    pub fn reset_statistics(&self) {
        self.shared.statistics.reset();
    }

    pub fn is_statistics_enabled(&self) -> bool {
        self.shared.statistics.is_enabled()
    }

    pub fn set_statistics_enabled(&self, enabled: bool) {
        self.shared.statistics.set_enabled(enabled);
    }

    pub fn statistics(&self) -> ValidatorStatistics {
        let stats = &self.shared.statistics;
        ValidatorStatistics {
            statistics_enabled: stats.is_enabled(),
            multi_thread_validation: self.is_multi_thread_validation().unwrap_or(false),
            validated_transactions: stats.validated_count(),
            average_waiting_time_in_queue_ms: stats.average_waiting_time_in_queue_ms(),
            average_initialization_duration_ms: stats.average_initialization_duration_ms(),
            average_validation_duration_ms: stats.average_validation_duration_ms(),
            thread_pool_core_size: self.thread_pool_core_size().unwrap_or(0),
            thread_pool_max_size: self.thread_pool_max_size().unwrap_or(0),
            thread_pool_keep_alive_ms: self
                .thread_pool_keep_alive()
                .map_or(0, |keep_alive| keep_alive.as_millis() as u64),
            pending_queue_occupancy_pct: self.pending_queue_occupancy_pct().unwrap_or(0.0),
            active_threads_pct: self.active_threads_pct().unwrap_or(0.0),
            pending_remote_transactions: self.pending_remote_transactions(),
            locked_keys: self.locked_keys(),
        }
    }
}

impl<K: TxKey> Drop for TotalOrderValidator<K> {
    fn drop(&mut self) {
        if self.state() == ValidatorState::Started {
            if let Err(error) = self.stop() {
                warn!(error = %error, "Failed to stop total order validator on drop");
            }
        }
    }
}
