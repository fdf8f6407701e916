// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::types::GlobalTransactionId;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
    time::{Duration, Instant},
};

struct LatchInner {
    gtx: GlobalTransactionId,
    released: Mutex<bool>,
    cvar: Condvar,
}

/// A one-shot gate owned by an in-flight transaction. Later conflicting
/// transactions wait on it and the owner releases it exactly once when its
/// validation concludes, whatever the outcome.
///
/// Clones share the gate. Equality and hashing follow the gate's identity, not
/// its state, so a latch can be compared against the one stored in a table.
#[derive(Clone)]
pub struct DependencyLatch {
    inner: Arc<LatchInner>,
}

impl DependencyLatch {
    pub fn new(gtx: GlobalTransactionId) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                gtx,
                released: Mutex::new(false),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Transaction owning this latch.
    pub fn gtx(&self) -> GlobalTransactionId {
        self.inner.gtx
    }

    /// Opens the gate and wakes every waiter. Returns whether this call did
    /// the release, so a second call is a no-op returning false.
    pub fn release(&self) -> bool {
        let mut released = self.inner.released.lock();
        if *released {
            return false;
        }
        *released = true;
        self.inner.cvar.notify_all();
        true
    }

    pub fn is_released(&self) -> bool {
        *self.inner.released.lock()
    }

    /// Blocks until the latch is released or `timeout` elapses. Returns true
    /// iff the latch was released.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut released = self.inner.released.lock();
        match timeout {
            None => {
                while !*released {
                    self.inner.cvar.wait(&mut released);
                }
                true
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*released {
                    if self
                        .inner
                        .cvar
                        .wait_until(&mut released, deadline)
                        .timed_out()
                    {
                        return *released;
                    }
                }
                true
            },
        }
    }

    pub fn ptr_eq(&self, other: &DependencyLatch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for DependencyLatch {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for DependencyLatch {}

impl Hash for DependencyLatch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for DependencyLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyLatch")
            .field("gtx", &self.inner.gtx)
            .field("released", &self.is_released())
            .finish()
    }
}
