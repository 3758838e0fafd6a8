use crate::Error;
use serde::Deserialize;
use std::{fs::File, path::Path, path::PathBuf, time::Duration};

/// Environment variable holding the network's temporary directory.
pub const NETWORK_DIR_ENV: &str = "MOON_ZOMBIE_DIR";

/// Configuration shared by every component of the harness.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root directory of the running network (one subdirectory and one `<name>.log` per worker).
    pub network_dir: PathBuf,

    /// Name of the container chain spec, used in database paths (`<slug>_<tenant>`).
    pub chain_slug: String,

    /// Database backend directory name (`paritydb` or `rocksdb`).
    pub db_kind: String,

    /// Binary name used to locate worker processes.
    pub node_binary: String,

    /// Interval between epoch polls (on the order of one block).
    pub poll_interval: Duration,

    /// Blocks to wait after reaching an epoch before asserting node-local effects.
    ///
    /// Nodes react to assignment changes once the relevant block is finalized, which reaching an
    /// epoch does not guarantee. This grace period is best-effort, not a guarantee.
    pub settle_blocks: u32,

    /// Interval between log file polls.
    pub log_poll_interval: Duration,

    /// Lines shown before and after a log match in error messages.
    pub context_lines: usize,

    /// Maximum number of in-flight requests when fanning out reads.
    pub max_concurrent: usize,

    /// Minimum spacing between fanned-out requests.
    pub min_request_interval: Option<Duration>,

    /// Binary used to restart workers (invoked as `<helper> restart --pid <pid> --wait-ms <ms>`).
    ///
    /// If not set, a shell helper is used.
    pub restart_helper: Option<PathBuf>,
}

impl Config {
    /// Create a configuration with defaults for the given network directory.
    pub fn new(network_dir: impl Into<PathBuf>) -> Self {
        Self {
            network_dir: network_dir.into(),
            chain_slug: "simple_container".to_string(),
            db_kind: "paritydb".to_string(),
            node_binary: "tanssi-node".to_string(),
            poll_interval: Duration::from_secs(6),
            settle_blocks: 6,
            log_poll_interval: Duration::from_secs(1),
            context_lines: 3,
            max_concurrent: 5,
            min_request_interval: Some(Duration::from_millis(100)),
            restart_helper: None,
        }
    }

    /// Create a configuration with defaults, reading the network directory from [NETWORK_DIR_ENV].
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self::new(network_dir_from_env()?))
    }

    /// Load a configuration from a YAML file.
    ///
    /// If the file does not set `network_dir`, it is read from [NETWORK_DIR_ENV].
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw: Raw = {
            let file = File::open(path)?;
            serde_yaml::from_reader(file)?
        };
        let network_dir = match raw.network_dir {
            Some(dir) => dir,
            None => network_dir_from_env()?,
        };
        let mut config = Self::new(network_dir);
        if let Some(slug) = raw.chain_slug {
            config.chain_slug = slug;
        }
        if let Some(kind) = raw.db_kind {
            config.db_kind = kind;
        }
        if let Some(binary) = raw.node_binary {
            config.node_binary = binary;
        }
        if let Some(ms) = raw.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(blocks) = raw.settle_blocks {
            config.settle_blocks = blocks;
        }
        if let Some(ms) = raw.log_poll_interval_ms {
            config.log_poll_interval = Duration::from_millis(ms);
        }
        if let Some(lines) = raw.context_lines {
            config.context_lines = lines;
        }
        if let Some(max) = raw.max_concurrent {
            config.max_concurrent = max;
        }
        if let Some(ms) = raw.min_request_interval_ms {
            config.min_request_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        config.restart_helper = raw.restart_helper;
        config.validate()?;
        Ok(config)
    }

    /// Ensure the configuration is usable.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent == 0 {
            return Err(Error::InvalidConfig("max_concurrent must be >= 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll_interval must be > 0".into()));
        }
        if self.log_poll_interval.is_zero() {
            return Err(Error::InvalidConfig("log_poll_interval must be > 0".into()));
        }
        Ok(())
    }
}

fn network_dir_from_env() -> Result<PathBuf, Error> {
    std::env::var_os(NETWORK_DIR_ENV)
        .map(PathBuf::from)
        .ok_or_else(|| Error::InvalidConfig(format!("{NETWORK_DIR_ENV} not set")))
}

/// On-disk representation of [Config].
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Raw {
    network_dir: Option<PathBuf>,
    chain_slug: Option<String>,
    db_kind: Option<String>,
    node_binary: Option<String>,
    poll_interval_ms: Option<u64>,
    settle_blocks: Option<u32>,
    log_poll_interval_ms: Option<u64>,
    context_lines: Option<usize>,
    max_concurrent: Option<usize>,
    min_request_interval_ms: Option<u64>,
    restart_helper: Option<PathBuf>,
}
