// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{IsolationLevel, TotalOrderConfig},
    local::{LocalTransaction, PrepareOutcome},
    types::{
        CommandInvoker, EntryVersions, Flag, GlobalTransactionId, NodeId, PrepareCommand,
        PrepareResponse, TxInvocationContext,
    },
    validator::TotalOrderValidator,
};
use anyhow::bail;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};


pub(crate) const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn gtx(id: u64) -> GlobalTransactionId {
    GlobalTransactionId::new(NodeId(1), id)
}

pub(crate) fn prepare(id: u64, keys: &[u32]) -> PrepareCommand<u32> {
    PrepareCommand::new(gtx(id), keys.iter().copied(), false)
}

pub(crate) fn write_skew_config() -> TotalOrderConfig {
    TotalOrderConfig {
        isolation_level: IsolationLevel::RepeatableRead,
        write_skew_check: true,
        core_pool_size: 4,
        max_pool_size: 8,
        ..Default::default()
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[derive(Clone, Debug)]
pub(crate) struct Invocation {
    pub gtx: GlobalTransactionId,
    pub one_phase: bool,
    pub skip_write_skew_check: bool,
    pub versions: Option<EntryVersions<u32>>,
    pub thread_name: Option<String>,
    pub start_seq: u64,
    pub end_seq: u64,
}

/// Downstream chain double that records every invocation. Invocations can be
/// held back with a gate, made to fail or to panic.
pub(crate) struct RecordingInvoker {
    seq: AtomicU64,
    delay: Duration,
    invocations: Mutex<Vec<Invocation>>,
    gates: Mutex<HashMap<GlobalTransactionId, Receiver<()>>>,
    failures: Mutex<HashSet<GlobalTransactionId>>,
    panics: Mutex<HashSet<GlobalTransactionId>>,
    responses: Mutex<HashMap<GlobalTransactionId, EntryVersions<u32>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started_tx: Sender<GlobalTransactionId>,
    started_rx: Receiver<GlobalTransactionId>,
}

impl RecordingInvoker {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let (started_tx, started_rx) = unbounded();
        Arc::new(Self {
            seq: AtomicU64::new(0),
            delay,
            invocations: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            panics: Mutex::new(HashSet::new()),
            responses: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            started_tx,
            started_rx,
        })
    }

    /// Holds the invocation of `gtx` until the returned sender sends or is
    /// dropped.
    pub fn gate(&self, gtx: GlobalTransactionId) -> Sender<()> {
        let (sender, receiver) = unbounded();
        self.gates.lock().insert(gtx, receiver);
        sender
    }

    pub fn fail(&self, gtx: GlobalTransactionId) {
        self.failures.lock().insert(gtx);
    }

    pub fn panic_on(&self, gtx: GlobalTransactionId) {
        self.panics.lock().insert(gtx);
    }

    pub fn respond_with(&self, gtx: GlobalTransactionId, versions: EntryVersions<u32>) {
        self.responses.lock().insert(gtx, versions);
    }

    /// Receives the id of each transaction as its invocation starts.
    pub fn started(&self) -> Receiver<GlobalTransactionId> {
        self.started_rx.clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    pub fn invocation(&self, gtx: GlobalTransactionId) -> Option<Invocation> {
        self.invocations
            .lock()
            .iter()
            .find(|invocation| invocation.gtx == gtx)
            .cloned()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl CommandInvoker<u32> for RecordingInvoker {
    fn invoke(
        &self,
        command: &PrepareCommand<u32>,
        ctx: &mut TxInvocationContext<u32>,
    ) -> anyhow::Result<PrepareResponse<u32>> {
        let gtx = *command.gtx();
        let start_seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let _ = self.started_tx.send(gtx);

        let gate = self.gates.lock().remove(&gtx);
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        let end_seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.invocations.lock().push(Invocation {
            gtx,
            one_phase: command.is_one_phase_commit(),
            skip_write_skew_check: ctx.has_flag(Flag::SkipWriteSkewCheck),
            versions: ctx.updated_versions().cloned(),
            thread_name: thread::current().name().map(str::to_string),
            start_seq,
            end_seq,
        });

        if self.panics.lock().contains(&gtx) {
            panic!("downstream chain panicked for {}", gtx);
        }
        if self.failures.lock().contains(&gtx) {
            bail!("write skew detected for {}", gtx);
        }
        Ok(match self.responses.lock().get(&gtx) {
            Some(versions) => PrepareResponse::with_versions(versions.clone()),
            None => PrepareResponse::empty(),
        })
    }
}

pub(crate) fn start_validator(
    config: TotalOrderConfig,
    invoker: &Arc<RecordingInvoker>,
) -> TotalOrderValidator<u32> {
    init_logging();
    let validator = TotalOrderValidator::<u32>::new(config, invoker.clone());
    validator.start().unwrap();
    validator
}

/// Registers a local transaction for `id` and delivers its prepare.
pub(crate) fn deliver(
    validator: &TotalOrderValidator<u32>,
    command: PrepareCommand<u32>,
) -> Arc<LocalTransaction<u32>> {
    let local = Arc::new(LocalTransaction::new(*command.gtx()));
    validator.add_local_transaction(*command.gtx(), local.clone());
    validator
        .validate_transaction(command, TxInvocationContext::remote())
        .unwrap();
    local
}

pub(crate) fn outcome(local: &LocalTransaction<u32>) -> PrepareOutcome<u32> {
    local
        .wait_prepare_result(RESULT_TIMEOUT)
        .expect("prepare result not published in time")
}
