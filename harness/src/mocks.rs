//! Mock chains driven by the runtime clock.

use crate::{
    chain::{Assignment, Blocks, Chain, Genesis, TenantKind, TenantState},
    Epoch, Error, PublicId, TenantId,
};
use commonware_runtime::Clock;
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// Derive a deterministic identifier for a worker name.
pub fn derive(name: &str) -> PublicId {
    PublicId::from_bytes(&Sha256::digest(name.as_bytes()))
}

#[derive(Default)]
struct ChainState {
    assignments: BTreeMap<Epoch, Assignment>,
    tenants: BTreeMap<TenantId, TenantState>,
    genesis: BTreeMap<TenantId, Genesis>,
    blocks_waited: u32,
    stall: Option<Duration>,
}

/// Orchestrator whose epoch advances every `epoch_length` of runtime time.
#[derive(Clone)]
pub struct MockChain<E: Clock> {
    context: E,
    start: SystemTime,
    block_time: Duration,
    blocks_per_epoch: u64,
    state: Arc<Mutex<ChainState>>,
}

impl<E: Clock> MockChain<E> {
    pub fn new(context: E, block_time: Duration, blocks_per_epoch: u64) -> Self {
        let start = context.current();
        Self {
            context,
            start,
            block_time,
            blocks_per_epoch,
            state: Arc::new(Mutex::new(ChainState::default())),
        }
    }

    /// Record the assignment that takes effect at `epoch` (and persists until replaced).
    pub fn set_assignment(&self, epoch: Epoch, assignment: Assignment) {
        self.state
            .lock()
            .unwrap()
            .assignments
            .insert(epoch, assignment);
    }

    pub fn set_tenant(&self, tenant: TenantId, state: TenantState) {
        self.state.lock().unwrap().tenants.insert(tenant, state);
    }

    pub fn set_genesis(&self, tenant: TenantId, genesis: Genesis) {
        self.state.lock().unwrap().genesis.insert(tenant, genesis);
    }

    /// Delay every [Chain::current_epoch] answer by `stall` (an unresponsive node).
    pub fn set_stall(&self, stall: Option<Duration>) {
        self.state.lock().unwrap().stall = stall;
    }

    /// Total blocks waited through [Chain::wait_blocks].
    pub fn blocks_waited(&self) -> u32 {
        self.state.lock().unwrap().blocks_waited
    }

    fn block(&self) -> u64 {
        let elapsed = self
            .context
            .current()
            .duration_since(self.start)
            .unwrap_or_default();
        (elapsed.as_millis() / self.block_time.as_millis()) as u64
    }

    fn lookup(&self, epoch: Epoch) -> Result<Assignment, Error> {
        let state = self.state.lock().unwrap();
        state
            .assignments
            .range(..=epoch)
            .next_back()
            .map(|(_, assignment)| assignment.clone())
            .ok_or_else(|| Error::Rpc(format!("no assignment for epoch {epoch}")))
    }
}

impl<E: Clock> Chain for MockChain<E> {
    async fn current_epoch(&self) -> Result<Epoch, Error> {
        let stall = self.state.lock().unwrap().stall;
        if let Some(stall) = stall {
            self.context.sleep(stall).await;
        }
        Ok((self.block() / self.blocks_per_epoch) as Epoch)
    }

    async fn assignment(&self, epoch: Epoch) -> Result<Assignment, Error> {
        self.lookup(epoch)
    }

    async fn assignment_at(&self, block: u64) -> Result<(Epoch, Assignment), Error> {
        let epoch = (block / self.blocks_per_epoch) as Epoch;
        Ok((epoch, self.lookup(epoch)?))
    }

    async fn tenant(&self, tenant: TenantId) -> Result<TenantState, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tenants
            .get(&tenant)
            .copied()
            .unwrap_or(TenantState::Unregistered))
    }

    async fn genesis(&self, tenant: TenantId) -> Result<Genesis, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.genesis.get(&tenant).copied().unwrap_or(Genesis {
            kind: TenantKind::Chain,
            is_ethereum: false,
        }))
    }

    async fn wait_blocks(&self, count: u32) -> Result<(), Error> {
        self.context.sleep(self.block_time * count).await;
        self.state.lock().unwrap().blocks_waited += count;
        Ok(())
    }
}

#[derive(Default)]
struct BlocksState {
    authors: BTreeMap<u64, PublicId>,
    authorities: Vec<PublicId>,
    in_flight: usize,
    max_in_flight: usize,
    requests: usize,
}

/// Blocks of a single chain, answering each author query after `delay`.
#[derive(Clone)]
pub struct MockBlocks<E: Clock> {
    context: E,
    delay: Duration,
    state: Arc<Mutex<BlocksState>>,
}

impl<E: Clock> MockBlocks<E> {
    pub fn new(context: E, delay: Duration) -> Self {
        Self {
            context,
            delay,
            state: Arc::new(Mutex::new(BlocksState::default())),
        }
    }

    pub fn set_author(&self, block: u64, author: PublicId) {
        self.state.lock().unwrap().authors.insert(block, author);
    }

    pub fn set_authorities(&self, authorities: Vec<PublicId>) {
        self.state.lock().unwrap().authorities = authorities;
    }

    /// Highest number of author queries observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub fn requests(&self) -> usize {
        self.state.lock().unwrap().requests
    }
}

impl<E: Clock> Blocks for MockBlocks<E> {
    async fn best(&self) -> Result<u64, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.authors.keys().next_back().copied().unwrap_or(0))
    }

    async fn author(&self, block: u64) -> Result<Option<PublicId>, Error> {
        {
            let mut state = self.state.lock().unwrap();
            state.requests += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        self.context.sleep(self.delay).await;
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        Ok(state.authors.get(&block).cloned())
    }

    async fn authorities(&self) -> Result<Vec<PublicId>, Error> {
        Ok(self.state.lock().unwrap().authorities.clone())
    }
}
