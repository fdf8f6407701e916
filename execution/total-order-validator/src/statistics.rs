// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::counters;
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Cumulative timings of prepare tasks. Recording is a no-op while disabled
/// and nothing here is ever read by the validation control flow.
#[derive(Debug, Default)]
pub struct ValidatorStats {
    enabled: AtomicBool,
    queue_wait_nanos: AtomicU64,
    initialization_nanos: AtomicU64,
    validation_nanos: AtomicU64,
    validated_count: AtomicU64,
}

/// Point-in-time view of the validator for operations tooling.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ValidatorStatistics {
    pub statistics_enabled: bool,
    pub multi_thread_validation: bool,
    pub validated_transactions: u64,
    pub average_waiting_time_in_queue_ms: f64,
    pub average_initialization_duration_ms: f64,
    pub average_validation_duration_ms: f64,
    pub thread_pool_core_size: usize,
    pub thread_pool_max_size: usize,
    pub thread_pool_keep_alive_ms: u64,
    pub pending_queue_occupancy_pct: f64,
    pub active_threads_pct: f64,
    pub pending_remote_transactions: usize,
    pub locked_keys: usize,
}

impl ValidatorStats {
    pub fn new(enabled: bool) -> Self {
        let stats = Self::default();
        stats.set_enabled(enabled);
        stats
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record(&self, queue_wait: Duration, initialization: Duration, validation: Duration) {
        if !self.is_enabled() {
            return;
        }
        self.queue_wait_nanos
            .fetch_add(queue_wait.as_nanos() as u64, Ordering::Relaxed);
        self.initialization_nanos
            .fetch_add(initialization.as_nanos() as u64, Ordering::Relaxed);
        self.validation_nanos
            .fetch_add(validation.as_nanos() as u64, Ordering::Relaxed);
        self.validated_count.fetch_add(1, Ordering::Relaxed);

        counters::observe_stage(counters::QUEUE_STAGE, queue_wait);
        counters::observe_stage(counters::INITIALIZATION_STAGE, initialization);
        counters::observe_stage(counters::VALIDATION_STAGE, validation);
    }

    pub fn validated_count(&self) -> u64 {
        self.validated_count.load(Ordering::Relaxed)
    }

    fn average_ms(&self, total_nanos: &AtomicU64) -> f64 {
        let count = self.validated_count();
        if count == 0 {
            return 0.0;
        }
        (total_nanos.load(Ordering::Relaxed) / count) as f64 / NANOS_PER_MILLI
    }

    pub fn average_waiting_time_in_queue_ms(&self) -> f64 {
        self.average_ms(&self.queue_wait_nanos)
    }

    pub fn average_initialization_duration_ms(&self) -> f64 {
        self.average_ms(&self.initialization_nanos)
    }

    pub fn average_validation_duration_ms(&self) -> f64 {
        self.average_ms(&self.validation_nanos)
    }

    pub fn reset(&self) {
        self.queue_wait_nanos.store(0, Ordering::Relaxed);
        self.initialization_nanos.store(0, Ordering::Relaxed);
        self.validation_nanos.store(0, Ordering::Relaxed);
        self.validated_count.store(0, Ordering::Relaxed);
    }
}
