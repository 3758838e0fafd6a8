//! Wait for the orchestrator to reach an epoch.
//!
//! The [Waiter] polls [Chain::current_epoch] once per `poll_interval` until the target epoch is
//! reached, an optional predicate returns true, or the timeout elapses. The predicate is
//! evaluated on every poll, regardless of the observed epoch, so a scenario can stop waiting as
//! soon as the effect it expects is visible (for example, when an extrinsic was included late in
//! a session and the change lands one epoch earlier than the nominal target).
//!
//! Reaching an epoch does not mean the nodes have reacted to it: nodes observe assignment changes
//! on finalized blocks, and the epoch index is read from the best block. After any successful
//! wait the [Waiter] therefore waits `settle_blocks` additional blocks. This grace period makes
//! it likely, not certain, that finality has caught up.
//!
//! The timeout bounds the whole wait, settle period included: a chain query or predicate that
//! never resolves fails with [Error::Timeout] once the deadline passes.

use crate::{chain::Chain, Config, Epoch, Error};
use commonware_macros::select;
use commonware_runtime::Clock;
use futures::future::{self, Ready};
use std::{
    future::Future,
    time::{Duration, SystemTime},
};
use tracing::{debug, info};

/// How a wait completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The target epoch was observed.
    Reached(Epoch),
    /// An epoch after the target was observed (the target was skipped or already passed).
    Passed(Epoch),
    /// The predicate returned true at the given epoch.
    EarlyExit(Epoch),
}

impl Outcome {
    /// Epoch observed when the wait completed.
    pub fn epoch(&self) -> Epoch {
        match self {
            Self::Reached(epoch) | Self::Passed(epoch) | Self::EarlyExit(epoch) => *epoch,
        }
    }
}

type Never = fn() -> Ready<Result<bool, Error>>;

/// Polls the orchestrator until an epoch is reached.
#[derive(Clone)]
pub struct Waiter<E: Clock, C: Chain> {
    context: E,
    chain: C,
    poll_interval: Duration,
    settle_blocks: u32,
    timeout: Duration,
    step_logging: bool,
}

impl<E: Clock, C: Chain> Waiter<E, C> {
    /// Create a new waiter that gives up after `timeout`.
    pub fn new(context: E, chain: C, config: &Config, timeout: Duration) -> Self {
        Self {
            context,
            chain,
            poll_interval: config.poll_interval,
            settle_blocks: config.settle_blocks,
            timeout,
            step_logging: false,
        }
    }

    /// Override the number of blocks waited after a successful wait.
    pub fn with_settle_blocks(mut self, settle_blocks: u32) -> Self {
        self.settle_blocks = settle_blocks;
        self
    }

    /// Log every poll.
    pub fn with_step_logging(mut self, step_logging: bool) -> Self {
        self.step_logging = step_logging;
        self
    }

    /// Wait until `target` is reached.
    pub async fn wait_for_epoch(&self, target: Epoch) -> Result<Outcome, Error> {
        let deadline = self.context.current() + self.timeout;
        self.run(deadline, target, None::<Never>).await
    }

    /// Wait until `target` is reached or `predicate` returns true.
    pub async fn wait_for_epoch_or<P, F>(&self, target: Epoch, predicate: P) -> Result<Outcome, Error>
    where
        P: FnMut() -> F,
        F: Future<Output = Result<bool, Error>>,
    {
        let deadline = self.context.current() + self.timeout;
        self.run(deadline, target, Some(predicate)).await
    }

    /// Wait until `count` epochs after the current one.
    pub async fn wait_epochs(&self, count: Epoch) -> Result<Outcome, Error> {
        let deadline = self.context.current() + self.timeout;
        let target = self.current_epoch(deadline, count, 0).await? + count;
        self.run(deadline, target, None::<Never>).await
    }

    /// Wait until `count` epochs after the current one or `predicate` returns true.
    pub async fn wait_epochs_or<P, F>(&self, count: Epoch, predicate: P) -> Result<Outcome, Error>
    where
        P: FnMut() -> F,
        F: Future<Output = Result<bool, Error>>,
    {
        let deadline = self.context.current() + self.timeout;
        let target = self.current_epoch(deadline, count, 0).await? + count;
        self.run(deadline, target, Some(predicate)).await
    }

    /// Wait `settle_blocks` blocks.
    pub async fn settle(&self) -> Result<(), Error> {
        if self.settle_blocks == 0 {
            return Ok(());
        }
        debug!(blocks = self.settle_blocks, "waiting for settle period");
        self.chain.wait_blocks(self.settle_blocks).await
    }

    /// Resolve `future` unless `deadline` passes first.
    ///
    /// `last` is the most recently observed epoch (0 if none was observed yet).
    async fn bounded<T, F>(
        &self,
        deadline: SystemTime,
        target: Epoch,
        last: Epoch,
        future: F,
    ) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        select! {
            result = future => {
                result
            },
            _ = self.context.sleep_until(deadline) => {
                Err(Error::Timeout { target, last })
            },
        }
    }

    async fn current_epoch(
        &self,
        deadline: SystemTime,
        target: Epoch,
        last: Epoch,
    ) -> Result<Epoch, Error> {
        self.bounded(deadline, target, last, self.chain.current_epoch())
            .await
    }

    async fn run<P, F>(
        &self,
        deadline: SystemTime,
        target: Epoch,
        mut predicate: Option<P>,
    ) -> Result<Outcome, Error>
    where
        P: FnMut() -> F,
        F: Future<Output = Result<bool, Error>>,
    {
        let mut last = 0;
        let outcome = loop {
            let epoch = self.current_epoch(deadline, target, last).await?;
            last = epoch;
            if self.step_logging {
                debug!(epoch, target, "polled epoch");
            }
            if let Some(predicate) = predicate.as_mut() {
                if self.bounded(deadline, target, last, predicate()).await? {
                    break Outcome::EarlyExit(epoch);
                }
            }
            if epoch == target {
                break Outcome::Reached(epoch);
            }
            if epoch > target {
                break Outcome::Passed(epoch);
            }
            if self.context.current() >= deadline {
                return Err(Error::Timeout { target, last });
            }
            self.context.sleep(self.poll_interval).await;
        };
        info!(?outcome, target, "finished waiting for epoch");
        self.bounded(deadline, target, last, self.settle()).await?;
        Ok(outcome)
    }
}

/// Predicate that never completes a wait early.
pub fn never() -> Ready<Result<bool, Error>> {
    future::ready(Ok(false))
}
