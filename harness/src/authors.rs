//! Read block authors over a range and check who produced them.
//!
//! Reads are fanned out with at most `max_concurrent` requests in flight, each admitted no sooner
//! than `min_request_interval` after the previous one. Requests complete in any order. Results
//! are sorted by block number before they are returned.
//!
//! # Slots and blocks
//!
//! A slot is a period of time in which one author may propose a block. Block numbers are
//! consecutive but some slots have no block, so an epoch has a fixed number of blocks and a
//! variable number of slots. Author checks therefore only hold when the expected number of
//! authors is much smaller than the epoch length.

use crate::{
    chain::{Assignment, Blocks, Chain},
    Config, Epoch, Error, PublicId, TenantId,
};
use commonware_runtime::Clock;
use futures::{stream, StreamExt, TryStreamExt};
use governor::{clock::Clock as GClock, Quota, RateLimiter};
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    ops::RangeInclusive,
};
use tracing::{debug, warn};

/// Run `request` for every key with bounded concurrency.
async fn fan_out<E, K, T, F, Fut>(
    context: &E,
    keys: Vec<K>,
    config: &Config,
    request: F,
) -> Result<Vec<T>, Error>
where
    E: Clock + GClock,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let limiter = config
        .min_request_interval
        .and_then(Quota::with_period)
        .map(|quota| RateLimiter::direct_with_clock(quota, context));
    let limiter = limiter.as_ref();
    let request = &request;
    stream::iter(keys)
        .map(|key| async move {
            if let Some(limiter) = limiter {
                while let Err(wait) = limiter.check() {
                    context.sleep(wait.wait_time_from(context.now())).await;
                }
            }
            request(key).await
        })
        .buffer_unordered(config.max_concurrent)
        .try_collect()
        .await
}

/// Fetch the author of every block in `range` that has one, sorted by block number.
pub async fn fetch_authors<E, B>(
    context: &E,
    blocks: &B,
    range: RangeInclusive<u64>,
    config: &Config,
) -> Result<Vec<(u64, PublicId)>, Error>
where
    E: Clock + GClock,
    B: Blocks,
{
    if range.is_empty() {
        return Err(Error::InvalidRange {
            start: *range.start(),
            end: *range.end(),
        });
    }
    let mut authors = fan_out(context, range.collect(), config, |block| async move {
        Ok::<_, Error>(blocks.author(block).await?.map(|author| (block, author)))
    })
    .await?
    .into_iter()
    .flatten()
    .collect::<Vec<_>>();
    authors.sort_unstable_by_key(|(block, _)| *block);
    Ok(authors)
}

/// Fetch the authors of `range` on every chain of `chains`, sharing one concurrency bound.
pub async fn fetch_authors_across<E, B>(
    context: &E,
    chains: &BTreeMap<TenantId, B>,
    range: RangeInclusive<u64>,
    config: &Config,
) -> Result<BTreeMap<TenantId, Vec<(u64, PublicId)>>, Error>
where
    E: Clock + GClock,
    B: Blocks,
{
    if range.is_empty() {
        return Err(Error::InvalidRange {
            start: *range.start(),
            end: *range.end(),
        });
    }
    let keys: Vec<(TenantId, &B, u64)> = chains
        .iter()
        .flat_map(|(tenant, blocks)| range.clone().map(move |block| (*tenant, blocks, block)))
        .collect();
    let results = fan_out(context, keys, config, |(tenant, blocks, block)| async move {
        let author = blocks.author(block).await?;
        Ok::<_, Error>(author.map(|author| (tenant, block, author)))
    })
    .await?;

    let mut authors: BTreeMap<TenantId, Vec<(u64, PublicId)>> =
        chains.keys().map(|tenant| (*tenant, Vec::new())).collect();
    for (tenant, block, author) in results.into_iter().flatten() {
        authors.entry(tenant).or_default().push((block, author));
    }
    for blocks in authors.values_mut() {
        blocks.sort_unstable_by_key(|(block, _)| *block);
    }
    Ok(authors)
}

/// The last `count` blocks of `blocks`, excluding genesis (which has no author).
pub async fn recent_range<B: Blocks>(
    blocks: &B,
    count: u64,
) -> Result<RangeInclusive<u64>, Error> {
    let best = blocks.best().await?;
    let start = best.saturating_add(1).saturating_sub(count).max(1);
    Ok(start..=best)
}

/// Returns the assignment in effect at the start of `range` and every different assignment
/// observed before its end, keyed by epoch.
///
/// One block is sampled per `session_period` blocks.
pub async fn authority_set_changes<C: Chain>(
    chain: &C,
    session_period: u64,
    range: RangeInclusive<u64>,
) -> Result<BTreeMap<Epoch, Assignment>, Error> {
    if session_period == 0 {
        return Err(Error::InvalidConfig("session period must be > 0".into()));
    }
    let mut changes = BTreeMap::new();
    let mut last: Option<Assignment> = None;
    for block in range.step_by(session_period as usize) {
        let (epoch, assignment) = chain.assignment_at(block).await?;
        if last.as_ref() != Some(&assignment) {
            debug!(block, epoch, "observed authority set");
            changes.insert(epoch, assignment.clone());
        }
        last = Some(assignment);
    }
    Ok(changes)
}

fn unique(authors: &[(u64, PublicId)]) -> BTreeSet<PublicId> {
    authors.iter().map(|(_, author)| author.clone()).collect()
}

fn unexpected(expected: usize, authors: &[(u64, PublicId)]) -> Error {
    Error::UnexpectedAuthors {
        expected,
        actual: authors.iter().map(|(_, author)| author.clone()).collect(),
        blocks: authors.iter().map(|(block, _)| *block).collect(),
    }
}

/// Ensure blocks in `range` were produced by at most `expected` distinct authors (and by more
/// than one if `expected > 1`).
///
/// The authority set must not change within `range`: if it does, the number of distinct authors
/// says nothing about the number of assigned workers, so the caller should pick another range.
pub async fn count_unique_authors<E, C, B>(
    context: &E,
    chain: &C,
    blocks: &B,
    session_period: u64,
    range: RangeInclusive<u64>,
    expected: usize,
    config: &Config,
) -> Result<BTreeSet<PublicId>, Error>
where
    E: Clock + GClock,
    C: Chain,
    B: Blocks,
{
    if range.start() >= range.end() {
        return Err(Error::InvalidRange {
            start: *range.start(),
            end: *range.end(),
        });
    }
    if expected as u64 > session_period {
        return Err(Error::InvalidConfig(format!(
            "cannot expect {expected} authors in a session of {session_period} blocks"
        )));
    }
    let changes = authority_set_changes(chain, session_period, range.clone()).await?;
    if changes.len() != 1 {
        return Err(Error::AuthoritySetChanged {
            sessions: changes.into_keys().collect(),
        });
    }

    let authors = fetch_authors(context, blocks, range, config).await?;
    let unique = unique(&authors);
    if unique.len() > expected || (unique.len() == 1 && expected > 1) {
        warn!(expected, actual = unique.len(), "mismatch between authorities and block authors");
        return Err(unexpected(expected, &authors));
    }
    Ok(unique)
}

/// Ensure blocks in `range` were produced by exactly `expected` distinct authors.
pub async fn count_unique_authors_exact<E, B>(
    context: &E,
    blocks: &B,
    range: RangeInclusive<u64>,
    expected: usize,
    config: &Config,
) -> Result<BTreeSet<PublicId>, Error>
where
    E: Clock + GClock,
    B: Blocks,
{
    let authors = fetch_authors(context, blocks, range, config).await?;
    let unique = unique(&authors);
    if unique.len() != expected {
        warn!(expected, actual = unique.len(), "mismatch between authorities and block authors");
        return Err(unexpected(expected, &authors));
    }
    Ok(unique)
}
