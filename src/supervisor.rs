//! The detached supervisor: one process per running service instance.
//!
//! The controller spawns `railyard run` in its own process group and walks
//! away once readiness passes; from then on the supervisor is the sole owner
//! of the service's command. It writes the combined log, publishes status
//! snapshots, restarts the backend on watched-file changes, and tears the
//! backend down on SIGINT/SIGTERM.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::backend::{Backend, BackendRegistry};
use crate::config::{self, ServiceDescriptor};
use crate::home::Home;
use crate::instance::{self, InstanceState};
use crate::logfile::{LogStream, LogWriter};
use crate::status::{ServiceState, StatusSnapshot, StatusStore};
use crate::watch;

const STATUS_REFRESH: Duration = Duration::from_secs(10);

/// Arguments of the hidden `run` subcommand.
#[derive(Debug, Clone)]
pub struct SupervisorArgs {
    pub service: String,
    pub config: PathBuf,
    pub home: Option<PathBuf>,
    pub directory: Option<PathBuf>,
    pub no_watch: bool,
    pub tags: Vec<String>,
    pub log_file: Option<PathBuf>,
    pub env: Vec<String>,
}

/// Supervises one service until it stops, dies, or is told to shut down.
pub async fn run(args: SupervisorArgs) -> Result<()> {
    let home = Home::resolve(args.home.clone())?;
    home.ensure()?;

    let graph = config::resolve(config::load_config(&args.config)?)?;
    let service = graph
        .service(&args.service)
        .ok_or_else(|| anyhow!("unknown service {}", args.service))?;
    if !service.runs_on_this_platform() {
        bail!(
            "service {} is restricted to platform {:?}",
            service.name,
            service.platform
        );
    }

    let overrides = parse_env_overrides(&args.env)?;
    let mut env = service.env.clone();
    env.extend(overrides.clone());
    let working_dir = resolve_working_dir(&args.config, args.directory.as_deref(), &service);

    let instance_id = uuid::Uuid::new_v4().to_string();
    let log_path = args
        .log_file
        .clone()
        .unwrap_or_else(|| home.log_file(&service.name));
    let writer = Arc::new(LogWriter::create(&service.name, &log_path)?);
    tracing::info!(
        service = %service.name,
        instance = %instance_id,
        log = %log_path.display(),
        "supervisor starting"
    );

    let store = StatusStore::new(&home, &service.name);
    store.write(&instance_id, &StatusSnapshot::starting())?;

    let registry = BackendRegistry::with_defaults();
    let backend = registry.create(&service, &working_dir, &env)?;

    let pid = start_backend(&backend, &writer)?;
    instance::write_state(
        &home,
        &service.name,
        &InstanceState {
            pid,
            instance_id: instance_id.clone(),
            config_path: args.config.clone(),
            env_overrides: overrides,
        },
    )?;

    let mut snapshot = StatusSnapshot::starting();
    snapshot.state = ServiceState::Running;
    store.write(&instance_id, &snapshot)?;

    let (exit_tx, mut exit_rx) = mpsc::channel::<()>(1);
    spawn_exit_watcher(backend.clone(), exit_tx.clone());

    // Hold one sender for the life of the loop so the watch arm stays
    // pending instead of resolving to a closed channel when no watcher runs.
    let (watch_tx, mut watch_rx) = mpsc::channel::<()>(8);
    if !args.no_watch {
        watch::spawn_watcher(&service, &working_dir, watch_tx.clone());
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(STATUS_REFRESH);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Restarts stop and re-start the backend; each stop produces one exit
    // event that must not be mistaken for the service dying.
    let mut restarts_pending: usize = 0;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                shutdown(&backend, &working_dir, &env, &writer);
                snapshot.state = ServiceState::Stopped;
                let _ = store.write(&instance_id, &snapshot);
                break;
            }
            _ = sigterm.recv() => {
                shutdown(&backend, &working_dir, &env, &writer);
                snapshot.state = ServiceState::Stopped;
                let _ = store.write(&instance_id, &snapshot);
                break;
            }
            _ = ticker.tick() => {
                refresh_snapshot(&backend, &writer, &mut snapshot);
                let _ = store.write(&instance_id, &snapshot);
            }
            event = exit_rx.recv() => {
                if event.is_none() {
                    break;
                }
                if restarts_pending > 0 {
                    restarts_pending -= 1;
                    continue;
                }
                writer.append(LogStream::Messages, "process exited unexpectedly");
                tracing::warn!(service = %service.name, "process exited unexpectedly");
                snapshot.state = ServiceState::Died;
                let _ = store.write(&instance_id, &snapshot);
                break;
            }
            trigger = watch_rx.recv() => {
                if trigger.is_none() {
                    continue;
                }
                match restart_backend(&service, &backend, &working_dir, &env, &writer, &mut restarts_pending) {
                    RestartOutcome::Restarted { pid } => {
                        let _ = instance::write_state(&home, &service.name, &InstanceState {
                            pid,
                            instance_id: instance_id.clone(),
                            config_path: args.config.clone(),
                            env_overrides: parse_env_overrides(&args.env)?,
                        });
                        snapshot = StatusSnapshot::starting();
                        snapshot.state = ServiceState::Running;
                        let _ = store.write(&instance_id, &snapshot);
                        spawn_exit_watcher(backend.clone(), exit_tx.clone());
                    }
                    RestartOutcome::StopFailed => {
                        // Command still running; the next edit gets another
                        // attempt, and a later genuine exit must still be
                        // reported as a death.
                        tracing::error!(service = %service.name, "restart aborted: stop failed");
                    }
                    RestartOutcome::RelaunchFailed => {
                        tracing::error!(service = %service.name, "restart failed");
                        snapshot.state = ServiceState::Stopped;
                        let _ = store.write(&instance_id, &snapshot);
                        // Stay alive: the next edit gets another attempt.
                    }
                }
            }
        }
    }

    tracing::info!(service = %service.name, instance = %instance_id, "supervisor exiting");
    Ok(())
}

fn start_backend(backend: &Arc<dyn Backend>, writer: &Arc<LogWriter>) -> Result<u32> {
    let out = writer.clone();
    let err = writer.clone();
    backend.start(
        Box::new(move |line| out.append(LogStream::Stdout, line)),
        Box::new(move |line| err.append(LogStream::Stderr, line)),
    )
}

fn spawn_exit_watcher(backend: Arc<dyn Backend>, tx: mpsc::Sender<()>) {
    std::thread::spawn(move || {
        backend.wait();
        let _ = tx.blocking_send(());
    });
}

/// Stops the backend, routing its stop-command output and any failure into
/// the messages stream. Safe to reach from either signal arm.
fn shutdown(
    backend: &Arc<dyn Backend>,
    working_dir: &Path,
    env: &HashMap<String, String>,
    writer: &Arc<LogWriter>,
) {
    writer.append(LogStream::Messages, "shutdown requested");
    match backend.stop(working_dir, env) {
        Ok(output) => {
            if !output.trim().is_empty() {
                writer.append(LogStream::Messages, output.trim_end());
            }
        }
        Err(err) => {
            writer.append(LogStream::Messages, &format!("stop failed: {:#}", err));
        }
    }
}

#[derive(Debug)]
enum RestartOutcome {
    Restarted { pid: u32 },
    /// The stop step failed; the command is still running and no exit event
    /// is in flight.
    StopFailed,
    /// Stopped, but the rebuild or relaunch failed.
    RelaunchFailed,
}

/// Watch-triggered stop, rebuild, re-start.
///
/// The pending counter is bumped only once the stop has succeeded: a failed
/// stop produces no exit event, and an inflated counter would swallow a later
/// genuine death.
fn restart_backend(
    service: &Arc<ServiceDescriptor>,
    backend: &Arc<dyn Backend>,
    working_dir: &Path,
    env: &HashMap<String, String>,
    writer: &Arc<LogWriter>,
    restarts_pending: &mut usize,
) -> RestartOutcome {
    writer.append(LogStream::Messages, "change detected, restarting");
    match backend.stop(working_dir, env) {
        Ok(output) => {
            if !output.trim().is_empty() {
                writer.append(LogStream::Messages, output.trim_end());
            }
        }
        Err(err) => {
            writer.append(
                LogStream::Messages,
                &format!("restart aborted, stop failed: {:#}", err),
            );
            return RestartOutcome::StopFailed;
        }
    }
    *restarts_pending += 1;

    if service.build.is_some() {
        match backend.build(working_dir, env) {
            Ok(output) => {
                if !output.trim().is_empty() {
                    writer.append(LogStream::Messages, output.trim_end());
                }
            }
            Err(err) => {
                writer.append(LogStream::Messages, &format!("restart failed: {:#}", err));
                return RestartOutcome::RelaunchFailed;
            }
        }
    }
    match start_backend(backend, writer) {
        Ok(pid) => RestartOutcome::Restarted { pid },
        Err(err) => {
            writer.append(LogStream::Messages, &format!("restart failed: {:#}", err));
            RestartOutcome::RelaunchFailed
        }
    }
}

fn refresh_snapshot(
    backend: &Arc<dyn Backend>,
    writer: &Arc<LogWriter>,
    snapshot: &mut StatusSnapshot,
) {
    if let Ok(status) = backend.status() {
        snapshot.ports = status.ports;
        snapshot.memory_bytes = status.memory_bytes;
    }
    snapshot.stdout_lines = writer.stdout_lines();
    snapshot.stderr_lines = writer.stderr_lines();
}

/// Working directory precedence: explicit override, then the service's `cwd`
/// (relative to the config file), then the config file's directory.
pub(crate) fn resolve_working_dir(
    config_path: &Path,
    directory: Option<&Path>,
    service: &ServiceDescriptor,
) -> PathBuf {
    if let Some(directory) = directory {
        return directory.to_path_buf();
    }
    let base = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    match service.cwd.as_deref() {
        Some(cwd) if Path::new(cwd).is_absolute() => PathBuf::from(cwd),
        Some(cwd) => base.join(cwd),
        None => base,
    }
}

fn parse_env_overrides(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("invalid environment override {:?}, expected KEY=VALUE", pair))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaunchCheck, DEFAULT_READY_TIMEOUT};

    fn service(cwd: Option<&str>) -> ServiceDescriptor {
        ServiceDescriptor {
            name: "api".to_string(),
            cmd: Some("cargo run".to_string()),
            build: None,
            stop: None,
            cwd: cwd.map(String::from),
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
        }
    }

    #[test]
    fn working_dir_precedence() {
        let config = Path::new("/srv/project/railyard.toml");

        let explicit = resolve_working_dir(config, Some(Path::new("/opt/api")), &service(None));
        assert_eq!(explicit, PathBuf::from("/opt/api"));

        let relative = resolve_working_dir(config, None, &service(Some("services/api")));
        assert_eq!(relative, PathBuf::from("/srv/project/services/api"));

        let absolute = resolve_working_dir(config, None, &service(Some("/var/api")));
        assert_eq!(absolute, PathBuf::from("/var/api"));

        let fallback = resolve_working_dir(config, None, &service(None));
        assert_eq!(fallback, PathBuf::from("/srv/project"));
    }

    #[test]
    fn failed_stop_leaves_no_pending_exit_event() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = Arc::new(LogWriter::create("api", &tmp.path().join("api.log")).unwrap());
        let mut descriptor = service(None);
        descriptor.cmd = Some("sleep 30".to_string());
        descriptor.stop = Some("false".to_string());
        let service = Arc::new(descriptor);

        let registry = BackendRegistry::with_defaults();
        let backend = registry
            .create(&service, tmp.path(), &HashMap::new())
            .unwrap();
        let pid = start_backend(&backend, &writer).unwrap();

        let mut pending = 0;
        let outcome = restart_backend(
            &service,
            &backend,
            tmp.path(),
            &HashMap::new(),
            &writer,
            &mut pending,
        );
        // The command survived the failed stop, so no exit event may be
        // marked as expected.
        assert!(matches!(outcome, RestartOutcome::StopFailed));
        assert_eq!(pending, 0);
        assert!(crate::procinfo::alive(pid));

        unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    }

    #[test]
    fn successful_stop_marks_one_exit_event_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = Arc::new(LogWriter::create("api", &tmp.path().join("api.log")).unwrap());
        let mut descriptor = service(None);
        descriptor.cmd = Some("sleep 30".to_string());
        let service = Arc::new(descriptor);

        let registry = BackendRegistry::with_defaults();
        let backend = registry
            .create(&service, tmp.path(), &HashMap::new())
            .unwrap();
        let old_pid = start_backend(&backend, &writer).unwrap();

        let mut pending = 0;
        let outcome = restart_backend(
            &service,
            &backend,
            tmp.path(),
            &HashMap::new(),
            &writer,
            &mut pending,
        );
        let RestartOutcome::Restarted { pid } = outcome else {
            panic!("expected a completed restart, got {:?}", outcome);
        };
        assert_eq!(pending, 1);
        assert_ne!(pid, old_pid);

        unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    }

    #[test]
    fn env_overrides_parse_and_reject_malformed_pairs() {
        let env = parse_env_overrides(&["PORT=8080".to_string(), "EMPTY=".to_string()]).unwrap();
        assert_eq!(env.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(env.get("EMPTY").map(String::as_str), Some(""));

        let err = parse_env_overrides(&["MALFORMED".to_string()]).unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"));
    }
}
