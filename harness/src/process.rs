//! Locate, restart, and interrupt worker processes.
//!
//! Lookups fail closed: a [Pattern] must match exactly one process. Cleanup fails open: a
//! [Helper] that already exited is not an error, and [Cleanup] logs (rather than returns) any
//! failure to interrupt the helpers it owns.
//!
//! Restarts are performed out-of-band. [Controller::restart] spawns a helper that waits before
//! sending `SIGTERM` to the worker (leaving time to inspect the worker before it stops) and
//! relies on the network's supervisor to relaunch it.

use crate::{Config, Error};
use std::{fmt, path::PathBuf, process::ExitStatus, process::Stdio, time::Duration};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Matches command lines containing `binary` followed (anywhere later) by `name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    binary: String,
    name: String,
}

impl Pattern {
    pub fn new(binary: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            name: name.into(),
        }
    }

    /// Returns true if `command` matches.
    pub fn matches(&self, command: &str) -> bool {
        let Some(start) = command.find(&self.binary) else {
            return false;
        };
        command[start + self.binary.len()..].contains(&self.name)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}.*{})", self.binary, self.name)
    }
}

/// An entry of the process table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Process {
    pub pid: u32,
    pub command: String,
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID: {}, Command: {}", self.pid, self.command)
    }
}

/// Parse the output of `ps -eo pid=,args=`.
pub fn parse_ps(output: &str) -> Vec<Process> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            Some(Process {
                pid: pid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// List every process with a non-empty command line.
        pub async fn list() -> Result<Vec<Process>, Error> {
            let mut processes = Vec::new();
            for entry in std::fs::read_dir("/proc")? {
                let entry = entry?;
                let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                    continue;
                };

                // Processes may exit while the table is being read
                let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
                    continue;
                };
                let command = String::from_utf8_lossy(&cmdline)
                    .split('\0')
                    .filter(|arg| !arg.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                if !command.is_empty() {
                    processes.push(Process { pid, command });
                }
            }
            Ok(processes)
        }
    } else {
        /// List every process with a non-empty command line.
        pub async fn list() -> Result<Vec<Process>, Error> {
            let output = Command::new("ps").arg("-eo").arg("pid=,args=").output().await?;
            if !output.status.success() {
                return Err(Error::Io(std::io::Error::other(format!(
                    "ps exited with {}",
                    output.status
                ))));
            }
            Ok(parse_ps(&String::from_utf8_lossy(&output.stdout)))
        }
    }
}

/// Select the single process matching `pattern`, ignoring the current process.
pub fn select(processes: Vec<Process>, pattern: &Pattern) -> Result<Process, Error> {
    let current = std::process::id();
    let mut matches: Vec<Process> = processes
        .into_iter()
        .filter(|p| p.pid != current && pattern.matches(&p.command))
        .collect();
    match matches.len() {
        0 => Err(Error::ProcessNotFound(pattern.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::AmbiguousProcess {
            pattern: pattern.to_string(),
            processes: matches.iter().map(ToString::to_string).collect(),
        }),
    }
}

/// Find the single process matching `pattern`.
pub async fn find(pattern: &Pattern) -> Result<Process, Error> {
    let process = select(list().await?, pattern)?;
    debug!(%pattern, pid = process.pid, "found process");
    Ok(process)
}

/// Returns true if a process with `pid` exists (even if it cannot be signalled).
pub fn is_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs error checking only
    //
    // SAFETY: kill takes no pointers and pid is positive, so it names a single process.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send `signal` to `pid` (or to the process group `pid` leads, if `group` is set).
pub fn signal(pid: u32, signal: i32, group: bool) -> Result<(), Error> {
    let target = libc::pid_t::try_from(pid)
        .ok()
        .filter(|target| *target > 1 || (*target == 1 && !group))
        .ok_or_else(|| Error::SignalFailed {
            pid,
            signal,
            error: std::io::Error::from_raw_os_error(libc::EINVAL),
        })?;
    let target = if group { -target } else { target };
    // SAFETY: kill takes no pointers. target is never 0 (our own group) or -1 (every process).
    if unsafe { libc::kill(target, signal) } != 0 {
        return Err(Error::SignalFailed {
            pid,
            signal,
            error: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Restarts worker processes.
#[derive(Clone, Debug)]
pub struct Controller {
    node_binary: String,
    restart_helper: Option<PathBuf>,
}

impl Controller {
    pub fn new(config: &Config) -> Self {
        Self {
            node_binary: config.node_binary.clone(),
            restart_helper: config.restart_helper.clone(),
        }
    }

    /// Pattern matching the process of `worker`.
    pub fn pattern(&self, worker: &str) -> Pattern {
        Pattern::new(&self.node_binary, worker)
    }

    /// Find the process of `worker`.
    pub async fn find_worker(&self, worker: &str) -> Result<Process, Error> {
        find(&self.pattern(worker)).await
    }

    /// Spawn a helper that sends `SIGTERM` to `pid` after `wait`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn restart(&self, pid: u32, wait: Duration) -> Result<Helper, Error> {
        let mut command = match &self.restart_helper {
            Some(helper) => {
                let mut command = Command::new(helper);
                command
                    .arg("restart")
                    .arg("--pid")
                    .arg(pid.to_string())
                    .arg("--wait-ms")
                    .arg(wait.as_millis().to_string());
                command
            }
            None => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(format!(
                    "sleep {}.{:03}; kill -TERM {pid}",
                    wait.as_secs(),
                    wait.subsec_millis()
                ));
                command
            }
        };

        // Run the helper in its own process group so that interrupting it also stops its children
        let child = command.stdin(Stdio::null()).process_group(0).spawn()?;
        info!(pid, helper = child.id(), ?wait, "scheduled restart");
        Ok(Helper { target: pid, child })
    }

    /// Like [Self::restart], registering the helper with `cleanup`.
    pub fn restart_tracked<'a>(
        &self,
        cleanup: &'a mut Cleanup,
        pid: u32,
        wait: Duration,
    ) -> Result<&'a mut Helper, Error> {
        let helper = self.restart(pid, wait)?;
        Ok(cleanup.register(helper))
    }
}

/// A spawned restart helper.
///
/// Dropping the helper interrupts it (if it is still running).
#[must_use = "dropping a helper interrupts it"]
#[derive(Debug)]
pub struct Helper {
    target: u32,
    child: Child,
}

impl Helper {
    /// Process the helper will restart.
    pub fn target(&self) -> u32 {
        self.target
    }

    /// Process id of the helper (if it has not been reaped).
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the helper to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus, Error> {
        Ok(self.child.wait().await?)
    }

    /// Interrupt the helper and its children.
    ///
    /// Calling this on a helper that already exited (or was already interrupted) is not an error.
    pub fn kill(&mut self) -> Result<(), Error> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(target = self.target, ?status, "helper already exited");
            return Ok(());
        }
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        match signal(pid, libc::SIGINT, true) {
            Err(Error::SignalFailed { error, .. }) if error.raw_os_error() == Some(libc::ESRCH) => {
                Ok(())
            }
            result => {
                debug!(target = self.target, helper = pid, "interrupted helper");
                result
            }
        }
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        if let Err(err) = self.kill() {
            warn!(target = self.target, ?err, "failed to interrupt helper");
        }
    }
}

/// Owns every helper spawned by a suite and interrupts them when released or dropped.
#[derive(Debug, Default)]
pub struct Cleanup {
    helpers: Vec<Helper>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `helper` until the suite ends.
    pub fn register(&mut self, helper: Helper) -> &mut Helper {
        self.helpers.push(helper);
        let last = self.helpers.len() - 1;
        &mut self.helpers[last]
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }

    /// Interrupt every registered helper.
    pub fn release(&mut self) {
        for mut helper in self.helpers.drain(..) {
            if let Err(err) = helper.kill() {
                warn!(target = helper.target, ?err, "failed to interrupt helper");
            }
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.release();
    }
}
