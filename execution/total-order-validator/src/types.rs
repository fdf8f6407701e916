// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Messages and collaborator interfaces seen by the validator. Commands arrive
//! already deserialized and totally ordered; the downstream chain that applies
//! them is reached through [`CommandInvoker`].

use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    hash::Hash,
};

/// Keys a transaction may modify.
pub trait TxKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> TxKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster-wide identity of a transaction: the node it originated on plus a
/// sequence number local to that node. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTransactionId {
    origin: NodeId,
    id: u64,
}

impl GlobalTransactionId {
    pub fn new(origin: NodeId, id: u64) -> Self {
        Self { origin, id }
    }

    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTx:{}:{}", self.origin, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryVersion(pub u64);

pub type EntryVersions<K> = HashMap<K, EntryVersion>;

/// A prepare delivered by the total order layer. The write set is computed
/// upstream and never changes afterwards.
#[derive(Clone, Debug)]
pub struct PrepareCommand<K: TxKey> {
    gtx: GlobalTransactionId,
    modified_keys: HashSet<K>,
    one_phase_commit: bool,
}

impl<K: TxKey> PrepareCommand<K> {
    pub fn new(
        gtx: GlobalTransactionId,
        modified_keys: impl IntoIterator<Item = K>,
        one_phase_commit: bool,
    ) -> Self {
        Self {
            gtx,
            modified_keys: modified_keys.into_iter().collect(),
            one_phase_commit,
        }
    }

    pub fn gtx(&self) -> &GlobalTransactionId {
        &self.gtx
    }

    pub fn affected_keys(&self) -> &HashSet<K> {
        &self.modified_keys
    }

    pub fn is_one_phase_commit(&self) -> bool {
        self.one_phase_commit
    }

    pub fn set_one_phase_commit(&mut self, one_phase_commit: bool) {
        self.one_phase_commit = one_phase_commit;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flag {
    /// The commit decision is already taken; the downstream chain must not
    /// repeat the write-skew check.
    SkipWriteSkewCheck,
}

/// Per-invocation state handed to the downstream chain together with the
/// command.
#[derive(Clone, Debug)]
pub struct TxInvocationContext<K: TxKey> {
    origin_local: bool,
    flags: HashSet<Flag>,
    updated_versions: Option<EntryVersions<K>>,
}

impl<K: TxKey> TxInvocationContext<K> {
    /// Context for a prepare that originated on another node.
    pub fn remote() -> Self {
        Self {
            origin_local: false,
            flags: HashSet::new(),
            updated_versions: None,
        }
    }

    pub fn local() -> Self {
        Self {
            origin_local: true,
            ..Self::remote()
        }
    }

    pub fn is_origin_local(&self) -> bool {
        self.origin_local
    }

    pub fn set_flag(&mut self, flag: Flag) {
        self.flags.insert(flag);
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Versions carried by a commit that overtook its prepare.
    pub fn updated_versions(&self) -> Option<&EntryVersions<K>> {
        self.updated_versions.as_ref()
    }

    pub fn set_updated_versions(&mut self, versions: EntryVersions<K>) {
        self.updated_versions = Some(versions);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareResponse<K: TxKey> {
    /// New versions of the written entries, if the chain computed any.
    pub updated_versions: Option<EntryVersions<K>>,
}

impl<K: TxKey> PrepareResponse<K> {
    pub fn empty() -> Self {
        Self {
            updated_versions: None,
        }
    }

    pub fn with_versions(versions: EntryVersions<K>) -> Self {
        Self {
            updated_versions: Some(versions),
        }
    }
}

/// The storage/interceptor pipeline that checks and applies a prepare. The
/// validator treats it as opaque: an `Err` fails the transaction and nothing
/// else.
pub trait CommandInvoker<K: TxKey>: Send + Sync {
    fn invoke(
        &self,
        command: &PrepareCommand<K>,
        ctx: &mut TxInvocationContext<K>,
    ) -> anyhow::Result<PrepareResponse<K>>;
}
