// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounterVec, IntGauge,
};
use std::time::Duration;
use total_order_bounded_executor::Submission;

pub const QUEUE_STAGE: &str = "queue";
pub const INITIALIZATION_STAGE: &str = "initialization";
pub const VALIDATION_STAGE: &str = "validation";

pub const SUCCESS_LABEL: &str = "success";

/// Time spent by prepare tasks in each stage, recorded only while statistics
/// are enabled.
static VALIDATION_STAGE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "total_order_validation_stage_seconds",
        "Time spent by total order prepare tasks per stage",
        &["stage"],
        exponential_buckets(/*start=*/ 1e-6, /*factor=*/ 2.0, /*count=*/ 24).unwrap(),
    )
    .unwrap()
});

pub fn observe_stage(stage: &'static str, duration: Duration) {
    VALIDATION_STAGE_SECONDS
        .with_label_values(&[stage])
        .observe(duration.as_secs_f64());
}

/// Outcome of each validated prepare: "success" or the failure label.
pub static VALIDATION_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "total_order_validation_outcomes_count",
        "Outcomes of total order prepare validation",
        &["mode", "result"]
    )
    .unwrap()
});

/// Where prepare tasks were executed: queued, spawned on a new worker or run
/// on the delivering thread.
pub static TASK_SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "total_order_task_submissions_count",
        "Placement of total order prepare tasks on the validation executor",
        &["placement"]
    )
    .unwrap()
});

pub fn record_submission(submission: Submission) {
    let placement = match submission {
        Submission::Queued => "queued",
        Submission::Spawned => "spawned",
        Submission::CallerRuns => "caller_runs",
    };
    TASK_SUBMISSIONS.with_label_values(&[placement]).inc();
}

/// Results of commits and rollbacks waiting for their prepare.
pub static PREPARED_WAITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "total_order_prepared_wait_count",
        "Results of commit/rollback waits on total order prepares",
        &["result"]
    )
    .unwrap()
});

/// Remote transactions known to the validator and not yet finished.
pub static PENDING_REMOTE_TRANSACTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "total_order_pending_remote_transactions",
        "Number of remote transactions registered and not yet finished"
    )
    .unwrap()
});
