// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    counters,
    errors::ValidationError,
    latch::DependencyLatch,
    local::PrepareOutcome,
    pending::{PendingRemoteTransaction, PrepareDecision},
    types::{Flag, GlobalTransactionId, PrepareCommand, TxInvocationContext, TxKey},
    validator::ValidatorShared,
};
use fail::fail_point;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Instant,
};
use tracing::{debug, error, trace};

/// How a prepare is ordered against the others.
pub enum ValidationMode<K: TxKey> {
    /// Runs on a single worker fed in delivery order, nothing to wait for.
    Direct,
    /// Waits for the transactions that previously wrote any of the same keys.
    DependencyAware {
        pending: Arc<PendingRemoteTransaction<K>>,
        predecessors: Vec<DependencyLatch>,
    },
}

impl<K: TxKey> ValidationMode<K> {
    fn label(&self) -> &'static str {
        match self {
            ValidationMode::Direct => "direct",
            ValidationMode::DependencyAware { .. } => "dependency_aware",
        }
    }
}

/// Releases the owning transaction's latch when dropped, so successors are
/// unblocked even if the task never runs (e.g. dropped from the queue on
/// shutdown).
struct LatchReleaseGuard(Option<DependencyLatch>);

impl LatchReleaseGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for LatchReleaseGuard {
    fn drop(&mut self) {
        if let Some(latch) = self.0.take() {
            if latch.release() {
                trace!(gtx = %latch.gtx(), "Dependency latch released");
            }
        }
    }
}

/// Validation of one prepare command.
pub struct ValidationTask<K: TxKey> {
    command: PrepareCommand<K>,
    ctx: TxInvocationContext<K>,
    mode: ValidationMode<K>,
    shared: Arc<ValidatorShared<K>>,
    created_at: Instant,
    latch_guard: Option<LatchReleaseGuard>,
}

impl<K: TxKey> ValidationTask<K> {
    pub(crate) fn new(
        command: PrepareCommand<K>,
        ctx: TxInvocationContext<K>,
        mode: ValidationMode<K>,
        shared: Arc<ValidatorShared<K>>,
    ) -> Self {
        let latch_guard = match &mode {
            ValidationMode::Direct => None,
            ValidationMode::DependencyAware { pending, .. } => {
                Some(LatchReleaseGuard(Some(pending.latch().clone())))
            },
        };
        Self {
            command,
            ctx,
            mode,
            shared,
            created_at: Instant::now(),
            latch_guard,
        }
    }

    pub fn gtx(&self) -> GlobalTransactionId {
        *self.command.gtx()
    }

    pub fn run(mut self) {
        let started_at = Instant::now();
        let gtx = self.gtx();
        trace!(
            gtx = %gtx,
            thread = thread::current().name().unwrap_or("unnamed"),
            "Validating transaction"
        );

        let (outcome, initialized_at) = match self.initialize() {
            Ok(()) => {
                let initialized_at = Instant::now();
                (self.invoke(), initialized_at)
            },
            Err(error) => (Err(error), Instant::now()),
        };
        // A prepare that found itself among its predecessors shares the
        // record of an earlier delivery and must leave it untouched.
        let owns_record = !matches!(outcome, Err(ValidationError::OrderingViolation(_)));
        self.finalize(outcome, owns_record);
        match self.latch_guard.take() {
            Some(guard) if !owns_record => guard.disarm(),
            guard => drop(guard),
        }

        let finished_at = Instant::now();
        self.shared.statistics.record(
            started_at.saturating_duration_since(self.created_at),
            initialized_at.saturating_duration_since(started_at),
            finished_at.saturating_duration_since(initialized_at),
        );
    }

    /// Waits for the predecessors and reconciles the prepare with an early
    /// commit or rollback.
    fn initialize(&mut self) -> Result<(), ValidationError> {
        let (pending, predecessors) = match &self.mode {
            ValidationMode::Direct => return Ok(()),
            ValidationMode::DependencyAware {
                pending,
                predecessors,
            } => (pending, predecessors),
        };
        let gtx = pending.gtx();

        if pending.is_marked_for_rollback() {
            return Err(ValidationError::AlreadyRolledBack(gtx));
        }

        if predecessors
            .iter()
            .any(|predecessor| predecessor.ptr_eq(pending.latch()))
        {
            error!(gtx = %gtx, "Transaction found among its own predecessors");
            return Err(ValidationError::OrderingViolation(gtx));
        }

        let deadline = self
            .shared
            .dependency_wait_timeout
            .map(|timeout| Instant::now() + timeout);
        for predecessor in predecessors {
            trace!(gtx = %gtx, predecessor = %predecessor.gtx(), "Waiting for predecessor");
            let remaining =
                deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let released = predecessor.wait(remaining);
            if self.shared.is_stopped() {
                return Err(ValidationError::Interrupted(gtx));
            }
            if !released {
                debug!(
                    gtx = %gtx,
                    predecessor = %predecessor.gtx(),
                    "Timed out waiting for predecessor"
                );
                return Err(ValidationError::DependencyTimeout(gtx));
            }
        }

        match pending.mark_for_preparing() {
            PrepareDecision::Proceed => {},
            PrepareDecision::Rollback => return Err(ValidationError::AlreadyRolledBack(gtx)),
            PrepareDecision::OnePhase(versions) => {
                trace!(gtx = %gtx, "Commit already received, preparing in one phase");
                self.command.set_one_phase_commit(true);
                self.ctx.set_flag(Flag::SkipWriteSkewCheck);
                if let Some(versions) = versions {
                    self.ctx.set_updated_versions(versions);
                }
            },
        }
        Ok(())
    }

    fn invoke(&mut self) -> PrepareOutcome<K> {
        let gtx = self.gtx();
        fail_point!("total_order::validation::invoke", |_| {
            Err(ValidationError::Downstream {
                gtx,
                message: "Injected error in total_order::validation::invoke".to_string(),
            })
        });

        let invoker = &self.shared.invoker;
        let command = &self.command;
        let ctx = &mut self.ctx;
        match catch_unwind(AssertUnwindSafe(|| invoker.invoke(command, ctx))) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(ValidationError::Downstream {
                gtx,
                message: format!("{:#}", error),
            }),
            Err(_) => {
                error!(gtx = %gtx, "Downstream chain panicked");
                Err(ValidationError::DownstreamPanic(gtx))
            },
        }
    }

    /// Wakes commit/rollback waiters, hands the outcome to the local
    /// transaction (if any) and finishes the transaction when nothing else
    /// will.
    fn finalize(&self, outcome: PrepareOutcome<K>, owns_record: bool) {
        let gtx = self.gtx();
        if let ValidationMode::DependencyAware { pending, .. } = &self.mode {
            if owns_record {
                pending.mark_prepared_and_notify();
            }
        }

        let failed = outcome.is_err();
        let result_label = match &outcome {
            Ok(_) => {
                trace!(gtx = %gtx, "Transaction validated");
                counters::SUCCESS_LABEL
            },
            Err(error) => {
                debug!(gtx = %gtx, error = %error, "Transaction failed validation");
                error.label()
            },
        };
        counters::VALIDATION_OUTCOMES
            .with_label_values(&[self.mode.label(), result_label])
            .inc();

        if let Some((_, local)) = self.shared.local_transactions.remove(&gtx) {
            if let Ok(response) = &outcome {
                if !self.command.is_one_phase_commit() {
                    if let Some(versions) = &response.updated_versions {
                        local.set_updated_entry_versions(versions.clone());
                    }
                }
            }
            local.add_prepare_result(outcome);
        }

        if let ValidationMode::DependencyAware { pending, .. } = &self.mode {
            if owns_record && (self.command.is_one_phase_commit() || failed) {
                self.shared.complete_transaction(pending);
            }
        }
    }
}
