//! Readiness checking for freshly launched services.
//!
//! A launch is only considered live once its declared check passes. Every
//! strategy is a fixed-interval poll racing three other outcomes, first to
//! fire wins: operation cancellation, the supervised process exiting before
//! the check passes, and the overall deadline. Cancellation is checked before
//! process exit so an aborted operation never reports a phantom failure.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::LaunchCheck;
use crate::logfile::LogFollower;
use crate::procinfo;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why a readiness wait ended without the service becoming ready.
///
/// `TimedOut` and `Exited` are deliberately distinct: "never came up" and
/// "came up and died" need different operator responses. Both trigger a
/// compensating stop in the controller.
#[derive(Debug)]
pub enum ReadyError {
    /// The overall deadline elapsed before the check passed.
    TimedOut(Duration),
    /// The supervised process exited before satisfying the check.
    Exited,
    /// The surrounding operation was cancelled.
    Cancelled,
}

impl fmt::Display for ReadyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyError::TimedOut(timeout) => {
                write!(f, "timed out waiting for readiness after {:?}", timeout)
            }
            ReadyError::Exited => write!(f, "process exited before becoming ready"),
            ReadyError::Cancelled => write!(f, "cancelled while waiting for readiness"),
        }
    }
}

impl std::error::Error for ReadyError {}

/// Blocks until the service passes its readiness check.
///
/// `supervisor_alive` reports whether the launched supervisor process still
/// exists; `command_pid` yields the supervised command's pid once the
/// supervisor has recorded it (needed by the default any-port strategy).
/// The log file is followed from line zero; the controller moves any leftover
/// log aside before spawning the supervisor, so offset zero is this run's
/// start.
pub fn wait_until_ready(
    check: &LaunchCheck,
    timeout: Duration,
    cancel: &AtomicBool,
    mut supervisor_alive: impl FnMut() -> bool,
    mut command_pid: impl FnMut() -> Option<u32>,
    log_path: &Path,
) -> Result<(), ReadyError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut follower = LogFollower::new(log_path, 0);

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(ReadyError::Cancelled);
        }
        if !supervisor_alive() {
            return Err(ReadyError::Exited);
        }

        let ready = match check {
            LaunchCheck::Delay(delay) => started.elapsed() >= *delay,
            LaunchCheck::LogText(text) => follower
                .read_new()
                .iter()
                .any(|record| record.message.contains(text)),
            LaunchCheck::Ports(ports) => {
                let listening = procinfo::all_listening_ports();
                ports.iter().all(|port| listening.contains(port))
            }
            LaunchCheck::AnyPort => match command_pid() {
                Some(pid) => {
                    let mut pids = vec![pid];
                    pids.extend(procinfo::descendants(pid));
                    !procinfo::listening_ports(&pids).is_empty()
                }
                None => false,
            },
        };
        if ready {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(ReadyError::TimedOut(timeout));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::{LogStream, LogWriter};

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn delay_check_succeeds_after_the_delay() {
        let cancel = no_cancel();
        let started = Instant::now();
        wait_until_ready(
            &LaunchCheck::Delay(Duration::from_millis(150)),
            Duration::from_secs(5),
            &cancel,
            || true,
            || None,
            Path::new("/nonexistent"),
        )
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn premature_exit_is_a_hard_failure() {
        let cancel = no_cancel();
        let err = wait_until_ready(
            &LaunchCheck::Delay(Duration::from_secs(5)),
            Duration::from_secs(5),
            &cancel,
            || false,
            || None,
            Path::new("/nonexistent"),
        )
        .unwrap_err();
        assert!(matches!(err, ReadyError::Exited));
    }

    #[test]
    fn cancellation_takes_precedence_over_exit() {
        let cancel = AtomicBool::new(true);
        let err = wait_until_ready(
            &LaunchCheck::Delay(Duration::from_secs(5)),
            Duration::from_secs(5),
            &cancel,
            || false,
            || None,
            Path::new("/nonexistent"),
        )
        .unwrap_err();
        assert!(matches!(err, ReadyError::Cancelled));
    }

    #[test]
    fn unreachable_ports_time_out_within_the_bound() {
        let cancel = no_cancel();
        let started = Instant::now();
        let err = wait_until_ready(
            // Two ports that are vanishingly unlikely to both be listening.
            &LaunchCheck::Ports(vec![60123, 60321]),
            Duration::from_millis(300),
            &cancel,
            || true,
            || None,
            Path::new("/nonexistent"),
        )
        .unwrap_err();
        assert!(matches!(err, ReadyError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn leftover_log_from_a_prior_run_never_satisfies_log_text() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("api.log");
        {
            let writer = LogWriter::create("api", &path).unwrap();
            writer.append(LogStream::Stdout, "now listening on 8080");
        }
        // The controller moves the previous run's log aside before anything
        // is spawned.
        crate::logfile::rotate(&path).unwrap();

        let cancel = no_cancel();
        let err = wait_until_ready(
            &LaunchCheck::LogText("listening on".to_string()),
            Duration::from_millis(300),
            &cancel,
            || true,
            || None,
            &path,
        )
        .unwrap_err();
        assert!(matches!(err, ReadyError::TimedOut(_)));
    }

    #[test]
    fn log_text_check_matches_a_line_written_later() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("api.log");
        let writer = LogWriter::create("api", &path).unwrap();
        writer.append(LogStream::Stdout, "booting");

        let log_path = path.clone();
        let appender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            writer.append(LogStream::Stdout, "now listening on 8080");
        });

        let cancel = no_cancel();
        wait_until_ready(
            &LaunchCheck::LogText("listening on".to_string()),
            Duration::from_secs(5),
            &cancel,
            || true,
            || None,
            &log_path,
        )
        .unwrap();
        appender.join().unwrap();
    }
}
