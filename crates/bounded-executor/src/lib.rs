// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Bounded thread pool with caller-runs backpressure.

mod error;
mod executor;

pub use error::ExecutorError;
pub use executor::{BoundedExecutor, ExecutorConfig, Job, Submission, TryExecuteError};
