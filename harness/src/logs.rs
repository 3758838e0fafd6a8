//! Scan node logs for lifecycle milestones.
//!
//! Logs are read in full on every check and matched line by line: each expected entry must be a
//! substring of a single line. Matching is forward-only. Once a line matches the entry under the
//! cursor, the cursor advances and earlier lines are never revisited, so entries that appear out
//! of order are never matched.

use crate::{Config, Error};
use commonware_runtime::Clock;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

/// Progress of an ordered scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Number of expected entries found, in order.
    pub matched: usize,

    /// Line of the last match, if any.
    pub last: Option<usize>,
}

/// Find `expected` in `lines`, in order.
pub fn scan<S: AsRef<str>>(lines: &[&str], expected: &[S]) -> Progress {
    let mut progress = Progress {
        matched: 0,
        last: None,
    };
    for (i, line) in lines.iter().enumerate() {
        let Some(next) = expected.get(progress.matched) else {
            break;
        };
        if line.contains(next.as_ref()) {
            progress.matched += 1;
            progress.last = Some(i);
        }
    }
    progress
}

/// Returns up to `size` lines on either side of `center` (inclusive).
pub fn context(lines: &[&str], center: usize, size: usize) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let center = center.min(lines.len() - 1);
    let start = center.saturating_sub(size);
    let end = (center + size).min(lines.len() - 1);
    lines[start..=end].join("\n")
}

/// Read a log, treating a missing file as empty.
fn read(path: &Path) -> Result<String, Error> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

/// Polls log files until they contain what a scenario expects.
#[derive(Clone)]
pub struct Verifier<E: Clock> {
    context: E,
    poll_interval: Duration,
    context_lines: usize,
}

impl<E: Clock> Verifier<E> {
    pub fn new(context: E, config: &Config) -> Self {
        Self {
            context,
            poll_interval: config.log_poll_interval,
            context_lines: config.context_lines,
        }
    }

    /// Wait until the log at `path` contains every entry of `expected`, in order.
    ///
    /// A log that does not exist yet is treated as empty.
    pub async fn wait_for_ordered_logs<S: AsRef<str>>(
        &self,
        path: &Path,
        expected: &[S],
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = self.context.current() + timeout;
        loop {
            let contents = read(path)?;
            let lines: Vec<&str> = contents.lines().collect();
            let progress = scan(&lines, expected);
            if progress.matched == expected.len() {
                info!(?path, entries = expected.len(), "found ordered logs");
                return Ok(());
            }
            if self.context.current() >= deadline {
                return Err(Error::LogSequenceIncomplete {
                    path: path.to_path_buf(),
                    missing: expected[progress.matched].as_ref().to_string(),
                    context: context(&lines, progress.last.unwrap_or(0), self.context_lines),
                });
            }
            debug!(
                ?path,
                matched = progress.matched,
                expected = expected.len(),
                "waiting for logs"
            );
            self.context.sleep(self.poll_interval).await;
        }
    }

    /// Ensure none of `forbidden` appears anywhere in the log at `path`.
    ///
    /// Unlike [Self::wait_for_ordered_logs], this checks once and requires the log to exist.
    pub fn assert_logs_absent<S: AsRef<str>>(
        &self,
        path: &Path,
        forbidden: &[S],
    ) -> Result<(), Error> {
        assert_logs_absent(path, forbidden, self.context_lines)
    }

    /// Wait until the log at `path` grows, indicating the node is still alive.
    pub async fn wait_for_new_logs(&self, path: &Path, timeout: Duration) -> Result<(), Error> {
        let initial = fs::metadata(path)?.len();
        let deadline = self.context.current() + timeout;
        loop {
            self.context.sleep(self.poll_interval).await;
            if fs::metadata(path)?.len() > initial {
                return Ok(());
            }
            if self.context.current() >= deadline {
                return Err(Error::LogsStalled {
                    path: PathBuf::from(path),
                    size: initial,
                });
            }
        }
    }
}

/// Ensure none of `forbidden` appears anywhere in the log at `path`.
pub fn assert_logs_absent<S: AsRef<str>>(
    path: &Path,
    forbidden: &[S],
    context_lines: usize,
) -> Result<(), Error> {
    let contents = String::from_utf8_lossy(&fs::read(path)?).into_owned();
    let lines: Vec<&str> = contents.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if let Some(log) = forbidden.iter().find(|log| line.contains(log.as_ref())) {
            return Err(Error::ForbiddenLogFound {
                path: path.to_path_buf(),
                log: log.as_ref().to_string(),
                context: context(&lines, i, context_lines),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use rand::Rng;
    use std::io::Write;

    const WARP_SYNC: [&str; 4] = [
        "[Orchestrator] Detected assignment for container chain 2000",
        "[Orchestrator] Loaded chain spec for container chain 2000",
        "[Orchestrator] Container chain sync mode: Warp",
        "[Container-2000] Warp sync is complete",
    ];

    fn temp_log() -> PathBuf {
        std::env::temp_dir().join(format!(
            "harness_logs_{}.log",
            rand::thread_rng().gen::<u64>()
        ))
    }

    fn append(path: &Path, lines: &[&str]) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    #[test]
    fn test_scan_forward_only() {
        let lines = ["[A] detected", "[A] loaded", "[A] sync mode: Warp", "[A] sync complete"];
        let progress = scan(&lines, &["detected", "loaded", "Warp", "complete"]);
        assert_eq!(progress, Progress { matched: 4, last: Some(3) });

        // "complete" appears after "Warp", so the cursor never reaches "Warp"
        let progress = scan(&lines, &["complete", "Warp"]);
        assert_eq!(progress, Progress { matched: 1, last: Some(3) });

        // Repeated entries need repeated lines
        let progress = scan(&lines, &["[A]", "[A]", "[A]", "[A]", "[A]"]);
        assert_eq!(progress.matched, 4);

        let progress = scan::<&str>(&lines, &[]);
        assert_eq!(progress, Progress { matched: 0, last: None });
    }

    #[test]
    fn test_context_bounds() {
        let lines = ["0", "1", "2", "3", "4", "5", "6", "7"];
        assert_eq!(context(&lines, 0, 3), "0\n1\n2\n3");
        assert_eq!(context(&lines, 4, 1), "3\n4\n5");
        assert_eq!(context(&lines, 7, 3), "4\n5\n6\n7");
        assert_eq!(context(&[], 2, 3), "");
    }

    #[test_traced]
    fn test_ordered_logs_already_present() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let path = temp_log();
            append(&path, &["noise", WARP_SYNC[0], WARP_SYNC[1], "noise", WARP_SYNC[2], WARP_SYNC[3]]);
            let verifier = Verifier::new(context, &Config::new("/tmp"));
            verifier
                .wait_for_ordered_logs(&path, &WARP_SYNC, Duration::from_secs(5))
                .await
                .unwrap();
            fs::remove_file(path).unwrap();
        });
    }

    #[test_traced]
    fn test_ordered_logs_out_of_order_times_out() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let path = temp_log();
            append(&path, &["[A] detected", "[A] loaded", "[A] sync mode: Warp", "[A] sync complete"]);
            let verifier = Verifier::new(context, &Config::new("/tmp"));
            let result = verifier
                .wait_for_ordered_logs(&path, &["complete", "Warp"], Duration::from_secs(5))
                .await;
            let Err(Error::LogSequenceIncomplete { missing, context, .. }) = result else {
                panic!("expected incomplete sequence");
            };
            assert_eq!(missing, "Warp");
            assert!(context.contains("[A] sync complete"));
            fs::remove_file(path).unwrap();
        });
    }

    #[test_traced]
    fn test_ordered_logs_wait_for_growth() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // Log does not exist when waiting starts
            let path = temp_log();
            let verifier = Verifier::new(context.clone(), &Config::new("/tmp"));
            let writer = async {
                context.sleep(Duration::from_secs(10)).await;
                append(&path, &WARP_SYNC[..2]);
                context.sleep(Duration::from_secs(10)).await;
                append(&path, &WARP_SYNC[2..]);
            };
            let (result, _) = futures::join!(
                verifier.wait_for_ordered_logs(&path, &WARP_SYNC, Duration::from_secs(60)),
                writer
            );
            result.unwrap();
            fs::remove_file(path).unwrap();
        });
    }

    #[test_traced]
    fn test_logs_absent() {
        let path = temp_log();
        append(
            &path,
            &["a", "b", "c", "Shutdown error", "d", "e", "f", "g"],
        );
        assert_logs_absent(&path, &["Starting gap sync"], 3).unwrap();
        let result = assert_logs_absent(&path, &["Starting gap sync", "Shutdown error"], 1);
        let Err(Error::ForbiddenLogFound { log, context, .. }) = result else {
            panic!("expected forbidden log");
        };
        assert_eq!(log, "Shutdown error");
        assert_eq!(context, "c\nShutdown error\nd");
        fs::remove_file(&path).unwrap();

        // Missing logs cannot prove absence
        assert!(matches!(assert_logs_absent(&path, &["x"], 3), Err(Error::Io(_))));
    }

    #[test_traced]
    fn test_wait_for_new_logs() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let path = temp_log();
            append(&path, &["started"]);
            let verifier = Verifier::new(context.clone(), &Config::new("/tmp"));
            let result = verifier.wait_for_new_logs(&path, Duration::from_secs(5)).await;
            assert!(matches!(result, Err(Error::LogsStalled { .. })));

            let writer = async {
                context.sleep(Duration::from_secs(3)).await;
                append(&path, &["imported #12"]);
            };
            let (result, _) = futures::join!(
                verifier.wait_for_new_logs(&path, Duration::from_secs(5)),
                writer
            );
            result.unwrap();
            fs::remove_file(path).unwrap();
        });
    }
}
