//! Collator harness CLI

use clap::{Arg, ArgAction, Command};
use collator_harness::{
    logs::Verifier,
    process::{self, Controller},
    Config, Error,
};
use commonware_runtime::{tokio, Clock, Runner};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Path to an optional YAML config file
const CONFIG_FLAG: &str = "config";

const RESTART_CMD: &str = "restart";
const FIND_CMD: &str = "find";
const LOGS_CMD: &str = "logs";

/// Load the config at `path` or fall back to defaults for the network in `MOON_ZOMBIE_DIR`.
fn config(path: Option<&PathBuf>) -> Result<Config, Error> {
    match path {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    }
}

/// Entrypoint for the collator harness CLI
fn main() -> ExitCode {
    // Define application
    let matches = Command::new("harness")
        .version(crate_version())
        .about("Inspect and fault-inject the workers of a running collator network.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(CONFIG_FLAG)
                .long(CONFIG_FLAG)
                .global(true)
                .help("Path to YAML config file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .subcommand(
            Command::new(RESTART_CMD)
                .about("Wait, then send SIGTERM to a worker so its supervisor relaunches it.")
                .arg(
                    Arg::new("pid")
                        .long("pid")
                        .required(true)
                        .help("Process id of the worker")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    Arg::new("wait-ms")
                        .long("wait-ms")
                        .default_value("10000")
                        .help("Milliseconds to wait before sending the signal")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new(FIND_CMD)
                .about("Print the process id of the single worker with the given name.")
                .arg(
                    Arg::new("name")
                        .long("name")
                        .required(true)
                        .help("Name of the worker (as passed to the node binary)")
                        .value_parser(clap::value_parser!(String)),
                ),
        )
        .subcommand(
            Command::new(LOGS_CMD)
                .about("Wait until a log contains the given entries in order.")
                .arg(
                    Arg::new("path")
                        .long("path")
                        .required(true)
                        .help("Path to the log file")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("expect")
                        .long("expect")
                        .action(ArgAction::Append)
                        .help("Entry expected in the log (repeat for an ordered sequence)")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("forbid")
                        .long("forbid")
                        .action(ArgAction::Append)
                        .help("Entry that must not appear in the log (checked after the sequence)")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("timeout-ms")
                        .long("timeout-ms")
                        .default_value("60000")
                        .help("Milliseconds to wait for the sequence")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Restarts only need a pid, so the config is loaded by the commands that use it
    let config_path = matches.get_one::<PathBuf>(CONFIG_FLAG).cloned();
    let load_config = move || match config(config_path.as_ref()) {
        Ok(config) => Some(config),
        Err(e) => {
            error!(error=?e, "failed to load config");
            None
        }
    };

    // Parse subcommands
    let executor = tokio::Runner::default();
    executor.start(|context| async move {
        match matches.subcommand() {
            Some((RESTART_CMD, matches)) => {
                let pid = *matches.get_one::<u32>("pid").unwrap();
                let wait = Duration::from_millis(*matches.get_one::<u64>("wait-ms").unwrap());
                info!(pid, ?wait, "restarting worker");
                context.sleep(wait).await;
                if let Err(e) = process::signal(pid, libc::SIGTERM, false) {
                    error!(error=?e, "failed to restart worker");
                } else {
                    return ExitCode::SUCCESS;
                }
            }
            Some((FIND_CMD, matches)) => {
                let name = matches.get_one::<String>("name").unwrap();
                let Some(config) = load_config() else {
                    return ExitCode::FAILURE;
                };
                match Controller::new(&config).find_worker(name).await {
                    Ok(found) => {
                        println!("{}", found.pid);
                        return ExitCode::SUCCESS;
                    }
                    Err(e) => error!(error=?e, name, "failed to find worker"),
                }
            }
            Some((LOGS_CMD, matches)) => {
                let path = matches.get_one::<PathBuf>("path").unwrap();
                let expected: Vec<&String> = matches
                    .get_many::<String>("expect")
                    .map(|values| values.collect())
                    .unwrap_or_default();
                let forbidden: Vec<&String> = matches
                    .get_many::<String>("forbid")
                    .map(|values| values.collect())
                    .unwrap_or_default();
                let timeout = Duration::from_millis(*matches.get_one::<u64>("timeout-ms").unwrap());
                let Some(config) = load_config() else {
                    return ExitCode::FAILURE;
                };
                let verifier = Verifier::new(context, &config);
                let result = match verifier.wait_for_ordered_logs(path, &expected, timeout).await {
                    Ok(()) if forbidden.is_empty() => Ok(()),
                    Ok(()) => verifier.assert_logs_absent(path, &forbidden),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    error!("{e}");
                } else {
                    return ExitCode::SUCCESS;
                }
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
            }
            None => {
                error!("no subcommand provided");
            }
        }
        ExitCode::FAILURE
    })
}
