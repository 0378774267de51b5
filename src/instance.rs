//! Client-side control of one supervised service instance.
//!
//! The controller never owns a service's OS process; the detached supervisor
//! does. The controller loads ground truth from disk (self-healing stale
//! records), spawns new supervisors in their own process group, and stops
//! running ones by signaling that group with interrupt-then-kill escalation.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ServiceDescriptor;
use crate::home::Home;
use crate::logfile;
use crate::orchestrate::OperationConfig;
use crate::procinfo::{self, Signal};
use crate::ready;
use crate::status::StatusStore;
use crate::supervisor;
use crate::task::{Task, TaskState};

/// How long a process group gets to exit after SIGINT before escalation.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Extra wait after SIGKILL before declaring a hard failure.
const KILL_GRACE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Persisted fields of one supervised run. `pid` 0 means not running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub pid: u32,
    pub instance_id: String,
    pub config_path: PathBuf,
    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
}

/// One supervised run of one service, as far as this process can tell.
#[derive(Debug, Clone)]
pub struct Instance {
    pub service: Arc<ServiceDescriptor>,
    pub state: InstanceState,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.state.pid != 0
    }
}

/// How a stop ended when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The group exited within the grace period after SIGINT.
    Stopped,
    /// The group only went away after SIGKILL.
    Killed,
}

/// Writes the instance state file, whole-file.
pub fn write_state(home: &Home, service: &str, state: &InstanceState) -> Result<()> {
    let path = home.state_file(service);
    let raw = serde_json::to_vec_pretty(state).context("failed to encode instance state")?;
    std::fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn read_state(home: &Home, service: &str) -> Result<InstanceState> {
    let path = home.state_file(service);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Controller for one service's instance.
pub struct InstanceController {
    home: Home,
    service: Arc<ServiceDescriptor>,
    config_path: PathBuf,
    env_overrides: HashMap<String, String>,
}

impl InstanceController {
    pub fn new(
        home: Home,
        service: Arc<ServiceDescriptor>,
        config_path: PathBuf,
        env_overrides: HashMap<String, String>,
    ) -> Self {
        Self {
            home,
            service,
            config_path,
            env_overrides,
        }
    }

    /// Loads current on-disk state and validates it against the OS.
    ///
    /// The legacy pid file takes priority and is migrated into the state file
    /// when found. A pid whose process is gone, or whose command line no
    /// longer matches this service, is treated as not running and the stale
    /// records are cleared.
    pub fn load(&self) -> Result<Instance> {
        let name = &self.service.name;
        let mut state = if let Some(pid) = self.read_legacy_pid() {
            let state = InstanceState {
                pid,
                instance_id: String::new(),
                config_path: self.config_path.clone(),
                env_overrides: self.env_overrides.clone(),
            };
            write_state(&self.home, name, &state)?;
            let _ = std::fs::remove_file(self.home.pid_file(name));
            state
        } else {
            read_state(&self.home, name).unwrap_or(InstanceState {
                pid: 0,
                instance_id: String::new(),
                config_path: self.config_path.clone(),
                env_overrides: self.env_overrides.clone(),
            })
        };

        if state.pid != 0 && !self.pid_belongs_to_service(state.pid) {
            tracing::debug!(service = %name, pid = state.pid, "clearing stale instance state");
            self.cleanup_files();
            state.pid = 0;
            state.instance_id.clear();
        }

        Ok(Instance {
            service: self.service.clone(),
            state,
        })
    }

    /// Spawns a detached supervisor for this service and blocks until the
    /// readiness check passes. On failure a compensating stop reaps the
    /// half-started process group.
    pub fn launch(&self, task: &Task, op: &OperationConfig, cancel: &AtomicBool) -> Result<()> {
        let step = task.child("Start");
        step.set_state(TaskState::InProgress, Vec::new());

        let instance = match self.load() {
            Ok(instance) => instance,
            Err(err) => {
                step.set_state(TaskState::Failed, vec![format!("{:#}", err)]);
                return Err(err);
            }
        };
        if instance.is_running() {
            step.set_state(TaskState::Warning, vec!["already running".to_string()]);
            return Ok(());
        }

        let name = &self.service.name;
        let log_path = op
            .log_file
            .clone()
            .unwrap_or_else(|| self.home.log_file(name));
        // A log left over from a prior run could satisfy a log-text check
        // before the new command writes a single line. The service is not
        // running here, so the file is safe to move aside.
        if let Err(err) = logfile::rotate(&log_path) {
            step.set_state(TaskState::Failed, vec![format!("{:#}", err)]);
            return Err(err);
        }

        let mut child = match self.spawn_supervisor(op) {
            Ok(child) => child,
            Err(err) => {
                step.set_state(TaskState::Failed, vec![format!("{:#}", err)]);
                return Err(err);
            }
        };

        let timeout = op.ready_timeout.unwrap_or(self.service.ready_timeout);
        let home = self.home.clone();
        let result = ready::wait_until_ready(
            &self.service.launch_check,
            timeout,
            cancel,
            || matches!(child.try_wait(), Ok(None)),
            || {
                read_state(&home, name)
                    .ok()
                    .map(|state| state.pid)
                    .filter(|pid| *pid != 0)
            },
            &log_path,
        );

        match result {
            Ok(()) => {
                // The supervisor keeps running after we return; init reaps it
                // eventually.
                step.set_state(TaskState::Success, Vec::new());
                Ok(())
            }
            Err(err) => {
                step.set_state(TaskState::Failed, vec![err.to_string()]);
                let _ = stop_group(child.id());
                self.cleanup_files();
                let _ = child.wait();
                Err(anyhow::Error::from(err).context(format!("failed to start {}", name)))
            }
        }
    }

    /// Stops the running instance, escalating from interrupt to kill.
    ///
    /// Build-only services and instances that are not running are soft
    /// outcomes, never errors.
    pub fn stop(&self, task: &Task) -> Result<()> {
        let step = task.child("Stop");
        step.set_state(TaskState::InProgress, Vec::new());

        if !self.service.has_launch_step() {
            step.set_state(TaskState::Success, vec!["no launch step".to_string()]);
            return Ok(());
        }
        let instance = match self.load() {
            Ok(instance) => instance,
            Err(err) => {
                step.set_state(TaskState::Failed, vec![format!("{:#}", err)]);
                return Err(err);
            }
        };
        if !instance.is_running() {
            step.set_state(TaskState::Warning, vec!["not running".to_string()]);
            return Ok(());
        }

        match stop_group(instance.state.pid) {
            Ok(StopOutcome::Stopped) => {
                self.cleanup_files();
                step.set_state(TaskState::Success, Vec::new());
                Ok(())
            }
            Ok(StopOutcome::Killed) => {
                self.cleanup_files();
                step.set_state(TaskState::Warning, vec!["Killed".to_string()]);
                Ok(())
            }
            Err(err) => {
                step.set_state(TaskState::Failed, vec![format!("{:#}", err)]);
                Err(err.context(format!("failed to stop {}", self.service.name)))
            }
        }
    }

    /// Argument vector of the hidden `run` subcommand. The working directory
    /// is resolved here and passed explicitly, so the supervisor's behavior
    /// does not depend on where it happens to be started from.
    fn supervisor_args(&self, op: &OperationConfig) -> Vec<std::ffi::OsString> {
        let working_dir = supervisor::resolve_working_dir(&self.config_path, None, &self.service);
        let mut args: Vec<std::ffi::OsString> = vec![
            "run".into(),
            "--service".into(),
            self.service.name.clone().into(),
            "--config".into(),
            self.config_path.clone().into(),
            "--home".into(),
            self.home.root().as_os_str().to_os_string(),
            "--directory".into(),
            working_dir.into(),
        ];
        if op.no_watch {
            args.push("--no-watch".into());
        }
        for tag in &op.tags {
            args.push("--tag".into());
            args.push(tag.clone().into());
        }
        if let Some(log_file) = &op.log_file {
            args.push("--log-file".into());
            args.push(log_file.clone().into());
        }
        for (key, value) in &self.env_overrides {
            args.push("--env".into());
            args.push(format!("{}={}", key, value).into());
        }
        args
    }

    fn spawn_supervisor(&self, op: &OperationConfig) -> Result<std::process::Child> {
        let exe = std::env::current_exe().context("failed to resolve railyard executable")?;
        let mut command = Command::new(exe);
        command.args(self.supervisor_args(op));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // New process group, so the supervisor and all its descendants can be
        // signaled as a unit.
        unsafe {
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
        command
            .spawn()
            .with_context(|| format!("failed to spawn supervisor for {}", self.service.name))
    }

    fn read_legacy_pid(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(self.home.pid_file(&self.service.name)).ok()?;
        raw.trim().parse().ok().filter(|pid| *pid != 0)
    }

    fn pid_belongs_to_service(&self, pid: u32) -> bool {
        if !procinfo::alive(pid) {
            return false;
        }
        match procinfo::cmdline(pid) {
            Some(cmdline) => cmdline_matches(&cmdline, &self.service),
            None => true, // Exists but unreadable; assume it is ours.
        }
    }

    fn cleanup_files(&self) {
        let name = &self.service.name;
        let _ = std::fs::remove_file(self.home.state_file(name));
        let _ = std::fs::remove_file(self.home.pid_file(name));
        let _ = StatusStore::new(&self.home, name).clear();
    }
}

/// Foreign-pid-reuse protection: the recorded pid must still look like this
/// service, either by service name (supervisor command lines carry it) or by
/// the launch command's program.
fn cmdline_matches(cmdline: &str, service: &ServiceDescriptor) -> bool {
    if cmdline.contains(&service.name) {
        return true;
    }
    service
        .cmd
        .as_deref()
        .and_then(|cmd| shell_words::split(cmd).ok())
        .and_then(|parts| parts.into_iter().next())
        .map(|program| cmdline.contains(&program))
        .unwrap_or(false)
}

/// Interrupts the process group of `pid`, waits out the grace period, then
/// kills. A group that survives SIGKILL is a hard failure.
pub fn stop_group(pid: u32) -> Result<StopOutcome> {
    let pgid = procinfo::group_of(pid).unwrap_or(pid as i32);

    if procinfo::signal_group(pgid, Signal::Interrupt).is_err() {
        // Nothing left to signal.
        return Ok(StopOutcome::Stopped);
    }
    if wait_group_gone(pgid, STOP_GRACE) {
        return Ok(StopOutcome::Stopped);
    }

    let _ = procinfo::signal_group(pgid, Signal::Kill);
    if wait_group_gone(pgid, KILL_GRACE) {
        return Ok(StopOutcome::Killed);
    }
    bail!("process group {} survived {}", pgid, Signal::Kill.label());
}

fn wait_group_gone(pgid: i32, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !procinfo::group_alive(pgid) {
            return true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    !procinfo::group_alive(pgid)
}
