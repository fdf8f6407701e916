// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::errors::Error;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    None,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TotalOrderConfig {
    pub isolation_level: IsolationLevel,
    pub write_skew_check: bool,
    /// Commit every transaction in a single phase, which makes the write-skew
    /// check and hence dependency tracking unnecessary.
    pub use_1pc_for_total_order: bool,

    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub keep_alive_ms: u64,
    pub queue_capacity: usize,

    /// Upper bound on how long a commit/rollback waits for its prepare.
    pub prepared_wait_timeout_ms: u64,
    /// Upper bound on how long a prepare waits for its predecessors, 0 means
    /// no bound.
    pub dependency_wait_timeout_ms: u64,
    /// How many finished transactions are remembered, so that a commit or
    /// rollback arriving after the finish does not recreate their record.
    pub recently_finished_capacity: usize,

    pub statistics_enabled: bool,
}

impl Default for TotalOrderConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::ReadCommitted,
            write_skew_check: false,
            use_1pc_for_total_order: false,

            core_pool_size: 1,
            max_pool_size: 32,
            keep_alive_ms: 1000,
            queue_capacity: 1000,

            prepared_wait_timeout_ms: 15_000,
            dependency_wait_timeout_ms: 0,
            recently_finished_capacity: 4096,

            statistics_enabled: false,
        }
    }
}

impl TotalOrderConfig {
    /// Conflicting transactions only need ordering among themselves (and may
    /// thus run on several threads) when the write-skew check is performed.
    pub fn needs_multi_thread_validation(&self) -> bool {
        self.isolation_level == IsolationLevel::RepeatableRead
            && self.write_skew_check
            && !self.use_1pc_for_total_order
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn prepared_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.prepared_wait_timeout_ms)
    }

    pub fn dependency_wait_timeout(&self) -> Option<Duration> {
        match self.dependency_wait_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn parse_yaml(serialized: &str) -> Result<Self, Error> {
        serde_yaml::from_str(serialized)
            .map_err(|error| Error::Yaml("TotalOrderConfig".to_string(), error))
    }

    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|error| Error::IO(path.display().to_string(), error))?;
        Self::parse_yaml(&contents)
    }
}

/// Checks a config for values that are individually valid but cannot work
/// together.
pub trait ConfigSanitizer {
    fn get_sanitizer_name() -> String {
        let type_name = std::any::type_name::<Self>();
        type_name
            .rsplit("::")
            .next()
            .unwrap_or(type_name)
            .to_string()
    }

    fn sanitize(config: &TotalOrderConfig) -> Result<(), Error>;
}

impl ConfigSanitizer for TotalOrderConfig {
    fn sanitize(config: &TotalOrderConfig) -> Result<(), Error> {
        let sanitizer_name = Self::get_sanitizer_name();

        if config.write_skew_check && config.isolation_level != IsolationLevel::RepeatableRead {
            return Err(Error::ConfigSanitizerFailed(
                sanitizer_name,
                format!(
                    "write skew check requires repeatable_read isolation, got {:?}",
                    config.isolation_level
                ),
            ));
        }

        if config.core_pool_size == 0 || config.core_pool_size > config.max_pool_size {
            return Err(Error::ConfigSanitizerFailed(
                sanitizer_name,
                format!(
                    "core pool size {} must be > 0 and <= max pool size {}",
                    config.core_pool_size, config.max_pool_size
                ),
            ));
        }

        if config.keep_alive_ms == 0 || config.prepared_wait_timeout_ms == 0 {
            return Err(Error::ConfigSanitizerFailed(
                sanitizer_name,
                format!(
                    "keep alive {}ms and prepared wait timeout {}ms must be > 0",
                    config.keep_alive_ms, config.prepared_wait_timeout_ms
                ),
            ));
        }

        if config.recently_finished_capacity == 0 {
            return Err(Error::ConfigSanitizerFailed(
                sanitizer_name,
                "recently finished capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
