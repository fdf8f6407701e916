// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{types::GlobalTransactionId, validator::ValidatorState};
use thiserror::Error;
use total_order_bounded_executor::ExecutorError;

/// Outcome of a single transaction's validation that is not a success. These
/// never leave the transaction they belong to: they end up in its result slot
/// and the transaction's latch is released regardless.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The transaction showed up among its own predecessors.
    #[error("Transaction {0} depends on itself")]
    OrderingViolation(GlobalTransactionId),
    #[error("Cannot prepare transaction {0}, it was already marked for rollback")]
    AlreadyRolledBack(GlobalTransactionId),
    #[error("Downstream chain failed for transaction {gtx}: {message}")]
    Downstream {
        gtx: GlobalTransactionId,
        message: String,
    },
    #[error("Downstream chain panicked for transaction {0}")]
    DownstreamPanic(GlobalTransactionId),
    /// The validator stopped while the transaction waited for its predecessors.
    #[error("Validation of transaction {0} was interrupted")]
    Interrupted(GlobalTransactionId),
    #[error("Timed out waiting for the predecessors of transaction {0}")]
    DependencyTimeout(GlobalTransactionId),
}

impl ValidationError {
    pub fn gtx(&self) -> GlobalTransactionId {
        match self {
            ValidationError::OrderingViolation(gtx)
            | ValidationError::AlreadyRolledBack(gtx)
            | ValidationError::DownstreamPanic(gtx)
            | ValidationError::Interrupted(gtx)
            | ValidationError::DependencyTimeout(gtx) => *gtx,
            ValidationError::Downstream { gtx, .. } => *gtx,
        }
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ValidationError::OrderingViolation(_) => "ordering_violation",
            ValidationError::AlreadyRolledBack(_) => "already_rolled_back",
            ValidationError::Downstream { .. } => "downstream_failure",
            ValidationError::DownstreamPanic(_) => "downstream_panic",
            ValidationError::Interrupted(_) => "interrupted",
            ValidationError::DependencyTimeout(_) => "dependency_timeout",
        }
    }
}

/// Node-level failures, surfaced to startup and operations tooling.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to sanitize the total order config! Sanitizer: {0}, Error: {1}")]
    ConfigSanitizerFailed(String, String),
    #[error("Error accessing {0}: {1}")]
    IO(String, #[source] std::io::Error),
    #[error("Error (de)serializing {0}: {1}")]
    Yaml(String, #[source] serde_yaml::Error),
    #[error("Validator is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: ValidatorState,
        actual: ValidatorState,
    },
    #[error("Validator has not been started")]
    NotStarted,
    #[error("Validation executor is shut down")]
    ExecutorShutdown,
    #[error("Validation executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("Remote transaction {0} is not registered")]
    RemoteTransactionNotFound(GlobalTransactionId),
}
