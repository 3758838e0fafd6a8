//! Interfaces to the chains under test.
//!
//! Nothing in this crate constructs transactions or talks RPC directly. A scenario provides an
//! implementation of [Chain] for the orchestrator and of [Blocks] for each chain it reads blocks
//! from (including the orchestrator itself).

use crate::Error;
use commonware_utils::hex;
use std::{collections::BTreeMap, fmt, future::Future};

/// Index of an epoch (session) on the orchestrator.
pub type Epoch = u32;

/// Identifier of a container chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(pub u32);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TenantId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Public identifier of a worker, as a lowercase `0x`-prefixed hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicId(String);

impl PublicId {
    /// Create an identifier from raw key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("0x{}", hex(bytes)))
    }

    /// Create an identifier from a hex string, normalizing case and prefix.
    pub fn from_hex(value: &str) -> Self {
        let value = value.trim();
        let value = value.strip_prefix("0x").unwrap_or(value);
        Self(format!("0x{}", value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a container chain on the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TenantState {
    /// Never registered (or unknown to the orchestrator).
    Unregistered,
    /// Registered but not yet active (waiting for the next session boundary).
    Pending,
    /// Registered and valid for collating.
    Active,
    /// Registered but paused: keeps its registration but receives no workers.
    Paused,
    /// Deregistered, pending removal or already removed.
    Deregistered,
}

impl TenantState {
    /// Returns true if the chain is registered, whether paused or not.
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    /// Returns true if the chain should be assigned workers.
    pub fn is_collating(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// How often a container chain produces blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TenantKind {
    /// Produces a block every slot.
    Chain,
    /// Produces blocks on demand, every `min..=max` slots.
    Parathread { min: u32, max: u32 },
}

/// Genesis properties of a container chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Genesis {
    pub kind: TenantKind,
    pub is_ethereum: bool,
}

/// Assignment of workers as recorded by the orchestrator for one epoch.
///
/// This is the raw view: it has not been cross-checked against the tenants (see
/// [crate::assignment::Snapshot]).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assignment {
    /// Workers producing orchestrator blocks.
    pub orchestrator: Vec<PublicId>,

    /// Workers producing blocks for each container chain.
    pub tenants: BTreeMap<TenantId, Vec<PublicId>>,
}

/// Read accessors on the orchestrator.
pub trait Chain: Clone + Send + Sync + 'static {
    /// Current epoch index.
    fn current_epoch(&self) -> impl Future<Output = Result<Epoch, Error>> + Send;

    /// Assignment recorded for `epoch`.
    fn assignment(&self, epoch: Epoch) -> impl Future<Output = Result<Assignment, Error>> + Send;

    /// Epoch and assignment in effect at `block`.
    fn assignment_at(
        &self,
        block: u64,
    ) -> impl Future<Output = Result<(Epoch, Assignment), Error>> + Send;

    /// Lifecycle state of `tenant`.
    fn tenant(&self, tenant: TenantId) -> impl Future<Output = Result<TenantState, Error>> + Send;

    /// Genesis properties of `tenant`.
    fn genesis(&self, tenant: TenantId) -> impl Future<Output = Result<Genesis, Error>> + Send;

    /// Wait until `count` more orchestrator blocks have been produced.
    fn wait_blocks(&self, count: u32) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Read accessors on the blocks of a single chain.
pub trait Blocks: Clone + Send + Sync + 'static {
    /// Number of the best block.
    fn best(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Author of `block`, if the block carries an author digest.
    fn author(&self, block: u64) -> impl Future<Output = Result<Option<PublicId>, Error>> + Send;

    /// Authorities the chain itself has noted for block production.
    fn authorities(&self) -> impl Future<Output = Result<Vec<PublicId>, Error>> + Send;
}
