// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid pool size: core {core}, max {max}")]
    InvalidPoolSize { core: usize, max: usize },
    #[error("Failed to spawn the {0} core workers")]
    Spawn(usize),
    #[error("Executor is shut down")]
    Shutdown,
}
