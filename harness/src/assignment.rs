//! Validated views of which workers serve which chains.
//!
//! A [Snapshot] is built from the orchestrator's recorded [Assignment] for an epoch and the
//! authority list each reachable tenant reports locally. Construction fails if the two disagree
//! for any tenant or if a worker is assigned to more than one chain.

use crate::{
    chain::{Assignment, Blocks, Chain, TenantKind},
    Epoch, Error, PublicId, TenantId,
};
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Whether a worker may serve the orchestrator and a tenant in the same epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overlap {
    /// Every worker serves at most one chain (including the orchestrator).
    Exclusive,
    /// Orchestrator workers may also appear in (at most) one tenant.
    Orchestrator,
}

/// Assignment of workers for one epoch, cross-checked against the tenants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    epoch: Epoch,
    orchestrator: Vec<PublicId>,
    tenants: BTreeMap<TenantId, Vec<PublicId>>,
}

impl Snapshot {
    /// Build a snapshot from the orchestrator's view and the views reported by tenants.
    ///
    /// Only tenants present in `local` are cross-checked. A tenant missing from the orchestrator's
    /// view is treated as having no workers.
    pub fn build(
        epoch: Epoch,
        assignment: Assignment,
        local: &BTreeMap<TenantId, Vec<PublicId>>,
        overlap: Overlap,
    ) -> Result<Self, Error> {
        for (tenant, authorities) in local {
            let recorded = assignment
                .tenants
                .get(tenant)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if recorded != authorities.as_slice() {
                return Err(Error::ConsistencyViolation {
                    tenant: *tenant,
                    orchestrator: recorded.to_vec(),
                    local: authorities.clone(),
                });
            }
        }

        // Ensure no worker serves two chains
        let mut seen: BTreeMap<&PublicId, String> = BTreeMap::new();
        if overlap == Overlap::Exclusive {
            for worker in &assignment.orchestrator {
                if let Some(first) = seen.insert(worker, "orchestrator".to_string()) {
                    return Err(Error::DuplicateAssignment {
                        worker: worker.clone(),
                        first,
                        second: "orchestrator".to_string(),
                    });
                }
            }
        }
        for (tenant, workers) in &assignment.tenants {
            for worker in workers {
                if let Some(first) = seen.insert(worker, format!("tenant {tenant}")) {
                    return Err(Error::DuplicateAssignment {
                        worker: worker.clone(),
                        first,
                        second: format!("tenant {tenant}"),
                    });
                }
            }
        }

        Ok(Self {
            epoch,
            orchestrator: assignment.orchestrator,
            tenants: assignment.tenants,
        })
    }

    /// Fetch the assignment for `epoch` and cross-check it against each tenant in `tenants`.
    pub async fn fetch<C: Chain, B: Blocks>(
        chain: &C,
        epoch: Epoch,
        tenants: &BTreeMap<TenantId, B>,
        overlap: Overlap,
    ) -> Result<Self, Error> {
        let assignment = chain.assignment(epoch).await?;
        let views = try_join_all(tenants.iter().map(|(tenant, blocks)| async move {
            Ok::<_, Error>((*tenant, blocks.authorities().await?))
        }))
        .await?;
        let local = views.into_iter().collect();
        let snapshot = Self::build(epoch, assignment, &local, overlap)?;
        debug!(epoch, tenants = snapshot.tenants.len(), "fetched assignment snapshot");
        Ok(snapshot)
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Workers producing orchestrator blocks.
    pub fn orchestrator(&self) -> &[PublicId] {
        &self.orchestrator
    }

    /// Workers assigned to every tenant that has at least one.
    pub fn tenants(&self) -> &BTreeMap<TenantId, Vec<PublicId>> {
        &self.tenants
    }

    /// Workers assigned to `tenant` (empty if none).
    pub fn workers(&self, tenant: TenantId) -> &[PublicId] {
        self.tenants
            .get(&tenant)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Tenant `worker` is assigned to, if any.
    pub fn tenant_of(&self, worker: &PublicId) -> Option<TenantId> {
        self.tenants
            .iter()
            .find(|(_, workers)| workers.contains(worker))
            .map(|(tenant, _)| *tenant)
    }

    /// Returns true if `worker` produces orchestrator blocks.
    pub fn orchestrator_contains(&self, worker: &PublicId) -> bool {
        self.orchestrator.contains(worker)
    }

    /// Ensure `worker` produces orchestrator blocks.
    pub fn expect_orchestrator(&self, worker: &PublicId) -> Result<(), Error> {
        if !self.orchestrator_contains(worker) {
            return Err(Error::NotOrchestrator {
                epoch: self.epoch,
                worker: worker.clone(),
            });
        }
        Ok(())
    }

    /// Ensure every tenant in the snapshot has exactly `expected` workers.
    ///
    /// A tenant that lost all of its workers is absent from the snapshot and passes. Use
    /// [Snapshot::expect_workers_for] to require convergence of specific tenants.
    pub fn expect_workers_per_tenant(&self, expected: usize) -> Result<(), Error> {
        let tenants: Vec<TenantId> = self.tenants.keys().copied().collect();
        self.expect_workers_for(&tenants, expected)
    }

    /// Ensure every tenant in `tenants` has exactly `expected` workers (a tenant missing from
    /// the snapshot has none).
    pub fn expect_workers_for(&self, tenants: &[TenantId], expected: usize) -> Result<(), Error> {
        for tenant in tenants {
            let actual = self.workers(*tenant).len();
            if actual != expected {
                return Err(Error::WorkerCount {
                    tenant: *tenant,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Ensure every tenant in `tenants` that is not collating (paused, pending, or deregistered)
    /// has no workers.
    pub async fn expect_lifecycle<C: Chain>(
        &self,
        chain: &C,
        tenants: &[TenantId],
    ) -> Result<(), Error> {
        for tenant in tenants {
            let state = chain.tenant(*tenant).await?;
            let workers = self.workers(*tenant);
            if !state.is_collating() && !workers.is_empty() {
                return Err(Error::WorkerCount {
                    tenant: *tenant,
                    expected: 0,
                    actual: workers.len(),
                });
            }
        }
        Ok(())
    }

    /// Ensure every tenant in the snapshot has `per_chain` workers, or `per_parathread` if it
    /// produces blocks on demand.
    pub async fn expect_workers_by_kind<C: Chain>(
        &self,
        chain: &C,
        per_chain: usize,
        per_parathread: usize,
    ) -> Result<(), Error> {
        let tenants: Vec<TenantId> = self.tenants.keys().copied().collect();
        self.expect_workers_by_kind_for(chain, &tenants, per_chain, per_parathread)
            .await
    }

    /// Like [Snapshot::expect_workers_by_kind], over `tenants` rather than the tenants present
    /// in the snapshot.
    pub async fn expect_workers_by_kind_for<C: Chain>(
        &self,
        chain: &C,
        tenants: &[TenantId],
        per_chain: usize,
        per_parathread: usize,
    ) -> Result<(), Error> {
        for tenant in tenants {
            let expected = match chain.genesis(*tenant).await?.kind {
                TenantKind::Chain => per_chain,
                TenantKind::Parathread { .. } => per_parathread,
            };
            let actual = self.workers(*tenant).len();
            if actual != expected {
                return Err(Error::WorkerCount {
                    tenant: *tenant,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Ensure the snapshot is identical to `expected`.
    pub fn expect_matches(&self, expected: &Assignment) -> Result<(), Error> {
        if self.orchestrator == expected.orchestrator && self.tenants == expected.tenants {
            return Ok(());
        }
        let other = Snapshot {
            epoch: self.epoch,
            orchestrator: expected.orchestrator.clone(),
            tenants: expected.tenants.clone(),
        };
        Err(Error::AssignmentMismatch {
            epoch: self.epoch,
            diff: diff(&other, self).to_string(),
        })
    }

    /// Replace identifiers with worker names.
    pub fn resolve(&self, index: &NameIndex) -> Result<Named, Error> {
        let names = |workers: &[PublicId]| -> Result<Vec<String>, Error> {
            workers
                .iter()
                .map(|worker| index.name(worker).map(str::to_string))
                .collect()
        };
        let mut tenants = BTreeMap::new();
        for (tenant, workers) in &self.tenants {
            tenants.insert(*tenant, names(workers)?);
        }
        Ok(Named {
            epoch: self.epoch,
            orchestrator: names(&self.orchestrator)?,
            tenants,
        })
    }

    /// Convert back into the raw orchestrator view.
    pub fn into_assignment(self) -> Assignment {
        Assignment {
            orchestrator: self.orchestrator,
            tenants: self.tenants,
        }
    }
}

/// A [Snapshot] with worker names instead of identifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Named {
    pub epoch: Epoch,
    pub orchestrator: Vec<String>,
    pub tenants: BTreeMap<TenantId, Vec<String>>,
}

/// Workers added to and removed from one chain between two snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Change {
    pub added: Vec<PublicId>,
    pub removed: Vec<PublicId>,
}

impl Change {
    fn between(before: &[PublicId], after: &[PublicId]) -> Self {
        let before_set: BTreeSet<_> = before.iter().collect();
        let after_set: BTreeSet<_> = after.iter().collect();
        Self {
            added: after
                .iter()
                .filter(|w| !before_set.contains(w))
                .cloned()
                .collect(),
            removed: before
                .iter()
                .filter(|w| !after_set.contains(w))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Differences between two snapshots. Unchanged tenants are omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diff {
    pub orchestrator: Change,
    pub tenants: BTreeMap<TenantId, Change>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.orchestrator.is_empty() && self.tenants.is_empty()
    }

    /// Workers that must start syncing a tenant.
    pub fn newly_assigned(&self) -> Vec<(TenantId, PublicId)> {
        self.tenants
            .iter()
            .flat_map(|(tenant, change)| change.added.iter().map(|w| (*tenant, w.clone())))
            .collect()
    }

    /// Workers that stopped serving a tenant (and may delete its state).
    pub fn newly_unassigned(&self) -> Vec<(TenantId, PublicId)> {
        self.tenants
            .iter()
            .flat_map(|(tenant, change)| change.removed.iter().map(|w| (*tenant, w.clone())))
            .collect()
    }
}

impl std::fmt::Display for Diff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.orchestrator.is_empty() {
            write!(
                f,
                "orchestrator: +{:?} -{:?}; ",
                self.orchestrator.added, self.orchestrator.removed
            )?;
        }
        for (tenant, change) in &self.tenants {
            write!(f, "{tenant}: +{:?} -{:?}; ", change.added, change.removed)?;
        }
        Ok(())
    }
}

/// Compute the changes needed to go from `before` to `after`.
pub fn diff(before: &Snapshot, after: &Snapshot) -> Diff {
    let ids: BTreeSet<TenantId> = before
        .tenants
        .keys()
        .chain(after.tenants.keys())
        .copied()
        .collect();
    let tenants = ids
        .into_iter()
        .map(|tenant| {
            (
                tenant,
                Change::between(before.workers(tenant), after.workers(tenant)),
            )
        })
        .filter(|(_, change)| !change.is_empty())
        .collect();
    Diff {
        orchestrator: Change::between(&before.orchestrator, &after.orchestrator),
        tenants,
    }
}

/// Reverse index from worker identifiers to names.
#[derive(Clone, Debug, Default)]
pub struct NameIndex {
    names: BTreeMap<PublicId, String>,
    ids: BTreeMap<String, PublicId>,
}

impl NameIndex {
    /// Build an index by deriving the identifier of each name with `derive`.
    pub fn new<I, S, D>(names: I, derive: D) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        D: Fn(&str) -> PublicId,
    {
        let mut index = Self::default();
        for name in names {
            let name = name.into();
            let id = derive(&name);
            index.names.insert(id.clone(), name.clone());
            index.ids.insert(name, id);
        }
        index
    }

    /// Name of `worker`.
    pub fn name(&self, worker: &PublicId) -> Result<&str, Error> {
        self.names
            .get(worker)
            .map(String::as_str)
            .ok_or_else(|| Error::UnknownWorker(worker.clone()))
    }

    /// Identifier of the worker called `name`.
    pub fn id(&self, name: &str) -> Option<&PublicId> {
        self.ids.get(name)
    }

    /// Identifiers for `names`, in order.
    pub fn ids<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Option<Vec<PublicId>> {
        names.into_iter().map(|n| self.id(n).cloned()).collect()
    }
}
