//! Assert on the databases workers keep for container chains.
//!
//! A worker stores each container chain it syncs under its own directory in the network
//! directory. The database must exist while the worker is assigned to the chain and is deleted
//! once it is unassigned, unless the worker keeps its databases (`--keep-db`).
//!
//! Nothing here retries. Database creation and deletion happen asynchronously after the worker
//! observes an assignment change, so callers wait (see [crate::epoch::Waiter]) before asserting.

use crate::{assignment::Named, Config, Error, TenantId};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Paths of worker files within the network directory.
#[derive(Clone, Debug)]
pub struct Layout {
    network_dir: PathBuf,
    chain_slug: String,
    db_kind: String,
}

impl Layout {
    pub fn new(config: &Config) -> Self {
        Self {
            network_dir: config.network_dir.clone(),
            chain_slug: config.chain_slug.clone(),
            db_kind: config.db_kind.clone(),
        }
    }

    /// Directory of `worker`.
    pub fn worker_dir(&self, worker: &str) -> PathBuf {
        self.network_dir.join(worker)
    }

    /// Log file of `worker`.
    pub fn log_path(&self, worker: &str) -> PathBuf {
        self.network_dir.join(format!("{worker}.log"))
    }

    /// Database of `tenant`, relative to a worker directory.
    pub fn db_relative(&self, tenant: TenantId) -> PathBuf {
        PathBuf::from("data/containers/chains")
            .join(format!("{}_{tenant}", self.chain_slug))
            .join(&self.db_kind)
            .join(format!("full-container-{tenant}"))
    }

    /// Database of `tenant` kept by `worker`.
    pub fn db_path(&self, worker: &str, tenant: TenantId) -> PathBuf {
        self.worker_dir(worker).join(self.db_relative(tenant))
    }
}

/// Returns true if `path` is an existing directory.
pub fn directory_exists(path: &Path) -> bool {
    path.is_dir()
}

/// Ensure `path` exists (or does not).
pub fn expect_directory_state(path: &Path, should_exist: bool) -> Result<(), Error> {
    if directory_exists(path) != should_exist {
        return Err(Error::DirectoryStateMismatch {
            path: path.to_path_buf(),
            expected: should_exist,
        });
    }
    Ok(())
}

/// Ensure none of `relative` exists under the directory of any of `workers`.
pub fn expect_none_exist<W, P>(layout: &Layout, workers: &[W], relative: &[P]) -> Result<(), Error>
where
    W: AsRef<str>,
    P: AsRef<Path>,
{
    for worker in workers {
        let dir = layout.worker_dir(worker.as_ref());
        for path in relative {
            expect_directory_state(&dir.join(path), false)?;
        }
    }
    Ok(())
}

/// Record of which workers have ever been assigned to which tenants.
#[derive(Clone, Debug, Default)]
pub struct History {
    assigned: BTreeSet<(String, TenantId)>,
}

impl History {
    /// Record every tenant assignment in `snapshot`.
    pub fn record(&mut self, snapshot: &Named) {
        for (tenant, workers) in &snapshot.tenants {
            for worker in workers {
                self.assigned.insert((worker.clone(), *tenant));
            }
        }
    }

    /// Returns true if `worker` was ever recorded as assigned to `tenant`.
    pub fn was_assigned(&self, worker: &str, tenant: TenantId) -> bool {
        self.assigned.contains(&(worker.to_string(), tenant))
    }
}

/// Ensure each worker keeps a database for a tenant if and only if it is assigned to that tenant,
/// or was assigned before and the tenant's databases are kept.
///
/// `tenants` maps each tenant to check to whether its databases are kept.
pub fn expect_resource_correlation<W: AsRef<str>>(
    layout: &Layout,
    snapshot: &Named,
    workers: &[W],
    tenants: &BTreeMap<TenantId, bool>,
    history: &History,
) -> Result<(), Error> {
    for worker in workers {
        let worker = worker.as_ref();
        for (tenant, keep) in tenants {
            let assigned = snapshot
                .tenants
                .get(tenant)
                .is_some_and(|workers| workers.iter().any(|w| w == worker));
            let expected = assigned || (*keep && history.was_assigned(worker, *tenant));
            let path = layout.db_path(worker, *tenant);
            let exists = directory_exists(&path);
            debug!(worker, %tenant, assigned, expected, exists, "checked database");
            match (expected, exists) {
                (true, false) => {
                    return Err(Error::DirectoryStateMismatch {
                        path,
                        expected: true,
                    })
                }
                (false, true) => {
                    return Err(Error::StaleState {
                        worker: worker.to_string(),
                        tenant: *tenant,
                        path,
                    })
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::fs;

    const TENANT: TenantId = TenantId(2000);

    fn layout() -> (Layout, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "harness_state_{}",
            rand::thread_rng().gen::<u64>()
        ));
        fs::create_dir_all(&dir).unwrap();
        (Layout::new(&Config::new(&dir)), dir)
    }

    fn named(tenants: &[(TenantId, &[&str])]) -> Named {
        Named {
            epoch: 0,
            orchestrator: Vec::new(),
            tenants: tenants
                .iter()
                .map(|(t, w)| (*t, w.iter().map(|s| s.to_string()).collect()))
                .collect(),
        }
    }

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new(&Config::new("/tmp/zombie-52234"));
        assert_eq!(
            layout.db_path("Collator2000-02", TENANT),
            PathBuf::from(
                "/tmp/zombie-52234/Collator2000-02/data/containers/chains/simple_container_2000/paritydb/full-container-2000"
            )
        );
        assert_eq!(
            layout.log_path("Collator1000-03"),
            PathBuf::from("/tmp/zombie-52234/Collator1000-03.log")
        );
    }

    #[test]
    fn test_expect_directory_state() {
        let (layout, dir) = layout();
        let path = layout.db_path("W1", TENANT);
        expect_directory_state(&path, false).unwrap();
        assert!(matches!(
            expect_directory_state(&path, true),
            Err(Error::DirectoryStateMismatch { expected: true, .. })
        ));

        fs::create_dir_all(&path).unwrap();
        expect_directory_state(&path, true).unwrap();
        assert!(matches!(
            expect_directory_state(&path, false),
            Err(Error::DirectoryStateMismatch { expected: false, .. })
        ));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_expect_none_exist_after_deregistration() {
        let (layout, dir) = layout();
        let relative = [layout.db_relative(TENANT)];

        // W1 was assigned to 2000 and still has a database
        fs::create_dir_all(layout.db_path("W1", TENANT)).unwrap();
        let result = expect_none_exist(&layout, &["W1", "W2"], &relative);
        let Err(Error::DirectoryStateMismatch { path, expected: false }) = result else {
            panic!("expected stale database");
        };
        assert_eq!(path, layout.db_path("W1", TENANT));

        // Database deleted after deregistration
        fs::remove_dir_all(layout.worker_dir("W1")).unwrap();
        expect_none_exist(&layout, &["W1", "W2"], &relative).unwrap();
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_resource_correlation() {
        let (layout, dir) = layout();
        let workers = ["Collator2000-01", "Collator2000-02", "Collator1000-03"];
        let mut history = History::default();

        // Both 2000 collators assigned and synced
        let before = named(&[(TENANT, &["Collator2000-01", "Collator2000-02"][..])]);
        history.record(&before);
        fs::create_dir_all(layout.db_path("Collator2000-01", TENANT)).unwrap();
        fs::create_dir_all(layout.db_path("Collator2000-02", TENANT)).unwrap();
        let keep = BTreeMap::from([(TENANT, false)]);
        expect_resource_correlation(&layout, &before, &workers, &keep, &history).unwrap();

        // Collator2000-02 rotates out, Collator1000-03 rotates in
        let after = named(&[(TENANT, &["Collator2000-01", "Collator1000-03"][..])]);
        history.record(&after);
        let result = expect_resource_correlation(&layout, &after, &workers, &keep, &history);
        assert!(matches!(result, Err(Error::StaleState { ref worker, .. }) if worker == "Collator2000-02"));

        // Kept databases are allowed to remain, but the new collator must sync
        let kept = BTreeMap::from([(TENANT, true)]);
        let result = expect_resource_correlation(&layout, &after, &workers, &kept, &history);
        assert!(matches!(result, Err(Error::DirectoryStateMismatch { expected: true, .. })));

        fs::create_dir_all(layout.db_path("Collator1000-03", TENANT)).unwrap();
        expect_resource_correlation(&layout, &after, &workers, &kept, &history).unwrap();
        fs::remove_dir_all(layout.db_path("Collator2000-02", TENANT)).unwrap();
        expect_resource_correlation(&layout, &after, &workers, &keep, &history).unwrap();
        fs::remove_dir_all(dir).unwrap();
    }
}
