//! Backends: pluggable build/run strategies behind one capability interface.
//!
//! The supervisor and orchestrator never inspect backend internals; they only
//! sequence `build`/`start`/`stop`/`status`/`wait` calls and persist the
//! outcomes. Only the shell-command backend ships today, but the registry
//! leaves room for other kinds and is constructed once at startup and passed
//! down explicitly.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use crate::config::ServiceDescriptor;
use crate::procinfo;

/// Ports and memory as reported by a live backend.
#[derive(Debug, Clone, Default)]
pub struct BackendStatus {
    pub ports: Vec<u16>,
    pub memory_bytes: u64,
}

/// Receives one line of command output at a time.
pub type LineSink = Box<dyn Fn(&str) + Send + Sync + 'static>;

/// The capability interface every backend satisfies.
pub trait Backend: Send + Sync {
    /// Runs the build step, returning its captured combined output.
    fn build(&self, working_dir: &Path, env: &HashMap<String, String>) -> Result<String>;
    /// Starts the underlying command, redirecting its output into the sinks.
    /// Returns the pid of the launched process.
    fn start(&self, stdout: LineSink, stderr: LineSink) -> Result<u32>;
    /// Stops the underlying command, returning captured output from a stop
    /// command if one is configured.
    fn stop(&self, working_dir: &Path, env: &HashMap<String, String>) -> Result<String>;
    /// Reports listening ports and memory usage of the running command.
    fn status(&self) -> Result<BackendStatus>;
    /// Blocks until the underlying command exits.
    fn wait(&self);
}

type Constructor =
    fn(Arc<ServiceDescriptor>, PathBuf, HashMap<String, String>) -> Arc<dyn Backend>;

/// Maps backend kind names to constructors.
pub struct BackendRegistry {
    constructors: HashMap<String, Constructor>,
}

impl BackendRegistry {
    pub fn with_defaults() -> Self {
        let mut constructors: HashMap<String, Constructor> = HashMap::new();
        constructors.insert("shell".to_string(), ShellBackend::create);
        Self { constructors }
    }

    pub fn create(
        &self,
        service: &Arc<ServiceDescriptor>,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Arc<dyn Backend>> {
        let constructor = self.constructors.get(&service.backend).ok_or_else(|| {
            anyhow!(
                "service {} uses unknown backend {:?}",
                service.name,
                service.backend
            )
        })?;
        Ok(constructor(
            service.clone(),
            working_dir.to_path_buf(),
            env.clone(),
        ))
    }
}

/// Backend that runs configured shell command strings.
pub struct ShellBackend {
    service: Arc<ServiceDescriptor>,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    pid: Mutex<Option<u32>>,
    exited: Arc<(Mutex<bool>, Condvar)>,
}

impl ShellBackend {
    fn create(
        service: Arc<ServiceDescriptor>,
        working_dir: PathBuf,
        env: HashMap<String, String>,
    ) -> Arc<dyn Backend> {
        Arc::new(Self {
            service,
            working_dir,
            env,
            pid: Mutex::new(None),
            exited: Arc::new((Mutex::new(true), Condvar::new())),
        })
    }

    fn current_pid(&self) -> Option<u32> {
        let pid = (*self.pid.lock().unwrap())?;
        procinfo::alive(pid).then_some(pid)
    }

    /// Blocks until the command exits or the timeout elapses; true if exited.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.exited;
        let deadline = Instant::now() + timeout;
        let mut exited = lock.lock().unwrap();
        while !*exited {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, result) = cvar.wait_timeout(exited, remaining).unwrap();
            exited = next;
            if result.timed_out() {
                return *exited;
            }
        }
        true
    }
}

impl Backend for ShellBackend {
    fn build(&self, working_dir: &Path, env: &HashMap<String, String>) -> Result<String> {
        let Some(build) = self.service.build.as_deref() else {
            return Ok(String::new());
        };
        run_captured(build, working_dir, env)
            .with_context(|| format!("build failed for {}", self.service.name))
    }

    fn start(&self, stdout: LineSink, stderr: LineSink) -> Result<u32> {
        if self.current_pid().is_some() {
            bail!("{} is already started", self.service.name);
        }
        let cmd = self
            .service
            .cmd
            .as_deref()
            .ok_or_else(|| anyhow!("{} has no launch command", self.service.name))?;
        let mut parts = shell_words::split(cmd)
            .with_context(|| format!("failed to parse cmd for {}", self.service.name))?;
        if parts.is_empty() {
            bail!("empty cmd for {}", self.service.name);
        }
        let program = parts.remove(0);

        let mut command = Command::new(program);
        command
            .args(parts)
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.service.name))?;
        let pid = child.id();
        *self.pid.lock().unwrap() = Some(pid);
        *self.exited.0.lock().unwrap() = false;

        if let Some(out) = child.stdout.take() {
            std::thread::spawn(move || pump_lines(out, stdout));
        }
        if let Some(err) = child.stderr.take() {
            std::thread::spawn(move || pump_lines(err, stderr));
        }

        // The monitor thread owns the child; wait() blocks on the condvar it
        // signals.
        let exited = self.exited.clone();
        std::thread::spawn(move || {
            let mut child = child;
            let _ = child.wait();
            let (lock, cvar) = &*exited;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        });

        Ok(pid)
    }

    fn stop(&self, working_dir: &Path, env: &HashMap<String, String>) -> Result<String> {
        const STOP_GRACE: Duration = Duration::from_secs(5);

        let mut output = String::new();
        if let Some(stop) = self.service.stop.as_deref() {
            output = run_captured(stop, working_dir, env)
                .with_context(|| format!("stop command failed for {}", self.service.name))?;
        }

        let Some(pid) = self.current_pid() else {
            return Ok(output);
        };

        // Signal only the command, never the whole group: the backend shares
        // a process group with its supervisor.
        unsafe {
            libc::kill(pid as i32, libc::SIGINT);
        }
        if self.wait_timeout(STOP_GRACE) {
            return Ok(output);
        }
        let stragglers = procinfo::descendants(pid);
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
            for straggler in stragglers {
                libc::kill(straggler as i32, libc::SIGKILL);
            }
        }
        if !self.wait_timeout(STOP_GRACE) {
            bail!("{} did not exit after SIGKILL", self.service.name);
        }
        Ok(output)
    }

    fn status(&self) -> Result<BackendStatus> {
        let Some(pid) = self.current_pid() else {
            return Ok(BackendStatus::default());
        };
        let mut pids = vec![pid];
        pids.extend(procinfo::descendants(pid));
        let memory_bytes = pids
            .iter()
            .filter_map(|pid| procinfo::rss_bytes(*pid))
            .sum();
        Ok(BackendStatus {
            ports: procinfo::listening_ports(&pids),
            memory_bytes,
        })
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.exited;
        let mut exited = lock.lock().unwrap();
        while !*exited {
            exited = cvar.wait(exited).unwrap();
        }
    }
}

fn pump_lines<R: std::io::Read>(reader: R, sink: LineSink) {
    let lines = std::io::BufReader::new(reader).lines();
    for line in lines.map_while(|line| line.ok()) {
        sink(&line);
    }
}

/// Runs a command string to completion, returning combined stdout + stderr.
/// A non-zero exit embeds the output in the error for task diagnostics.
pub fn run_captured(cmd: &str, working_dir: &Path, env: &HashMap<String, String>) -> Result<String> {
    let mut parts =
        shell_words::split(cmd).with_context(|| format!("failed to parse command {:?}", cmd))?;
    if parts.is_empty() {
        bail!("empty command");
    }
    let program = parts.remove(0);
    let output = Command::new(&program)
        .args(parts)
        .current_dir(working_dir)
        .envs(env)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {}", program))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        bail!(
            "command exited with {}:\n{}",
            output.status.code().unwrap_or(1),
            combined.trim_end()
        );
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaunchCheck, DEFAULT_READY_TIMEOUT};

    fn descriptor(cmd: Option<&str>, build: Option<&str>) -> Arc<ServiceDescriptor> {
        Arc::new(ServiceDescriptor {
            name: "test".to_string(),
            cmd: cmd.map(String::from),
            build: build.map(String::from),
            stop: None,
            cwd: None,
            platform: None,
            env: HashMap::new(),
            watch: Vec::new(),
            watch_ignore: Vec::new(),
            watch_gitignore: false,
            watch_debounce_ms: 200,
            backend: "shell".to_string(),
            tags: Vec::new(),
            launch_check: LaunchCheck::AnyPort,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        })
    }

    fn shell(service: Arc<ServiceDescriptor>) -> Arc<dyn Backend> {
        ShellBackend::create(service, std::env::temp_dir(), HashMap::new())
    }

    #[test]
    fn build_captures_output() {
        let backend = shell(descriptor(None, Some("echo built")));
        let output = backend
            .build(&std::env::temp_dir(), &HashMap::new())
            .unwrap();
        assert!(output.contains("built"));
    }

    #[test]
    fn failed_build_embeds_output_in_error() {
        let backend = shell(descriptor(None, Some("sh -c 'echo broken; exit 3'")));
        let err = backend
            .build(&std::env::temp_dir(), &HashMap::new())
            .unwrap_err();
        let text = format!("{:#}", err);
        assert!(text.contains("broken"));
        assert!(text.contains('3'));
    }

    #[test]
    fn start_pumps_both_streams_and_wait_returns() {
        let backend = shell(descriptor(Some("sh -c 'echo out; echo err 1>&2'"), None));
        let stdout: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let stderr: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let out = stdout.clone();
        let err = stderr.clone();
        let pid = backend
            .start(
                Box::new(move |line| out.lock().unwrap().push(line.to_string())),
                Box::new(move |line| err.lock().unwrap().push(line.to_string())),
            )
            .unwrap();
        assert!(pid > 0);
        backend.wait();
        // Pump threads race wait() by a hair; give them a moment.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(stdout.lock().unwrap().as_slice(), ["out".to_string()]);
        assert_eq!(stderr.lock().unwrap().as_slice(), ["err".to_string()]);
    }

    #[test]
    fn stop_interrupts_a_long_running_command() {
        let backend = shell(descriptor(Some("sleep 30"), None));
        backend
            .start(Box::new(|_| {}), Box::new(|_| {}))
            .unwrap();
        let started = Instant::now();
        backend
            .stop(&std::env::temp_dir(), &HashMap::new())
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        backend.wait();
    }

    #[test]
    fn unknown_backend_kind_is_rejected() {
        let mut service = (*descriptor(Some("true"), None)).clone();
        service.backend = "container".to_string();
        let registry = BackendRegistry::with_defaults();
        let err = registry
            .create(&Arc::new(service), &std::env::temp_dir(), &HashMap::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown backend"));
    }
}
