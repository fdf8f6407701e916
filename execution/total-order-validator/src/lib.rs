// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Validation of transaction prepares delivered in a total order. Prepares
//! that write overlapping keys are validated in delivery order, the others may
//! be validated concurrently, and commits or rollbacks overtaking their
//! prepare are reconciled with it.

pub mod config;
mod counters;
pub mod errors;
pub mod key_table;
pub mod latch;
pub mod local;
pub mod pending;
pub mod statistics;
pub mod task;
pub mod transaction_table;
pub mod types;
pub mod validator;

#[cfg(test)]
mod unit_tests;

pub use config::{ConfigSanitizer, IsolationLevel, TotalOrderConfig};
pub use errors::{Error, ValidationError};
pub use local::{LocalTransaction, PrepareOutcome};
pub use statistics::ValidatorStatistics;
pub use types::{
    CommandInvoker, EntryVersion, EntryVersions, Flag, GlobalTransactionId, NodeId,
    PrepareCommand, PrepareResponse, TxInvocationContext, TxKey,
};
pub use validator::{TotalOrderValidator, ValidatorState};
