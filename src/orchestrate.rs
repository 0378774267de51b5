//! Orchestration of start/stop/restart across services and groups.
//!
//! The orchestrator expands the requested names into a flat list of service
//! targets (recursing through groups and overlaying their environments),
//! builds a task tree for progress reporting, and drives one job per service
//! through the worker pool. Jobs run concurrently by default; `--serial`
//! degrades the pool to inline execution.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use crate::backend::BackendRegistry;
use crate::config::{ServiceDescriptor, ServiceGraph};
use crate::home::Home;
use crate::instance::InstanceController;
use crate::pool::WorkerPool;
use crate::status::{ServiceState, StatusStore};
use crate::supervisor;
use crate::task::{self, Task, TaskState};

pub const DEFAULT_WORKERS: usize = 3;

/// Knobs of a single start/stop/restart invocation.
#[derive(Debug, Clone, Default)]
pub struct OperationConfig {
    /// Skip build steps and go straight to launching.
    pub skip_build: bool,
    /// Tell spawned supervisors not to watch for file changes.
    pub no_watch: bool,
    /// Names removed from the expansion (services or groups).
    pub exclusions: HashSet<String>,
    /// Tags forwarded to spawned supervisors.
    pub tags: Vec<String>,
    /// Log file override forwarded to spawned supervisors.
    pub log_file: Option<PathBuf>,
    /// Worker pool size; zero runs jobs serially on the calling thread.
    pub workers: usize,
    /// Readiness timeout override for every launched service.
    pub ready_timeout: Option<Duration>,
}

/// One expanded service plus the environment overlay its enclosing groups
/// contributed.
#[derive(Debug, Clone)]
pub struct Target {
    pub service: Arc<ServiceDescriptor>,
    pub env: HashMap<String, String>,
}

/// One row of the status report.
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub name: String,
    pub state: Option<ServiceState>,
    pub pid: u32,
    pub ports: Vec<u16>,
    pub memory_bytes: u64,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// Clones share the graph and cancellation flag, which is how jobs running on
/// pool threads reach them.
#[derive(Clone)]
pub struct Orchestrator {
    home: Home,
    graph: Arc<ServiceGraph>,
    registry: Arc<BackendRegistry>,
    config_path: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        home: Home,
        graph: ServiceGraph,
        config_path: PathBuf,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            home,
            graph: Arc::new(graph),
            registry: Arc::new(BackendRegistry::with_defaults()),
            config_path,
            cancel,
        }
    }

    /// Builds, then launches, every expanded target.
    pub fn start(&self, names: &[String], op: &OperationConfig) -> Result<()> {
        self.run_operation("start", names, op, |this, target, node, op| {
            log_job_failure(&target, this.start_job(&target, &node, &op));
            Ok(())
        })
    }

    /// Stops every expanded target. Not-running targets are soft outcomes.
    pub fn stop(&self, names: &[String], op: &OperationConfig) -> Result<()> {
        self.run_operation("stop", names, op, |this, target, node, _op| {
            log_job_failure(&target, this.controller(&target).stop(&node));
            Ok(())
        })
    }

    /// Stop followed by build + start, per service within one job so a
    /// restarted service never overlaps itself.
    pub fn restart(&self, names: &[String], op: &OperationConfig) -> Result<()> {
        self.run_operation("restart", names, op, |this, target, node, op| {
            log_job_failure(&target, this.restart_job(&target, &node, &op));
            Ok(())
        })
    }

    fn start_job(&self, target: &Target, node: &Task, op: &OperationConfig) -> Result<()> {
        if !op.skip_build && target.service.build.is_some() {
            self.build_step(target, node)?;
        }
        if target.service.has_launch_step() {
            self.controller(target).launch(node, op, &self.cancel)?;
        }
        Ok(())
    }

    fn restart_job(&self, target: &Target, node: &Task, op: &OperationConfig) -> Result<()> {
        let controller = self.controller(target);
        controller.stop(node)?;
        if !op.skip_build && target.service.build.is_some() {
            self.build_step(target, node)?;
        }
        if target.service.has_launch_step() {
            controller.launch(node, op, &self.cancel)?;
        }
        Ok(())
    }

    /// Collects one report row per requested service (all services when none
    /// are named), combining the instance record with its latest snapshot.
    pub fn status(&self, names: &[String], op: &OperationConfig) -> Result<Vec<StatusRow>> {
        let mut rows = Vec::new();
        for target in self.expand(names, op)? {
            let name = target.service.name.clone();
            let loaded = self.controller(&target).load()?;
            if !loaded.is_running() {
                rows.push(StatusRow {
                    name,
                    state: None,
                    pid: 0,
                    ports: Vec::new(),
                    memory_bytes: 0,
                    stdout_lines: 0,
                    stderr_lines: 0,
                    started_at: None,
                });
                continue;
            }
            let snapshot = StatusStore::new(&self.home, &name)
                .read(&loaded.state.instance_id)
                .ok();
            rows.push(StatusRow {
                name,
                state: snapshot.as_ref().map(|snapshot| snapshot.state),
                pid: loaded.state.pid,
                ports: snapshot
                    .as_ref()
                    .map(|snapshot| snapshot.ports.clone())
                    .unwrap_or_default(),
                memory_bytes: snapshot
                    .as_ref()
                    .map(|snapshot| snapshot.memory_bytes)
                    .unwrap_or(0),
                stdout_lines: snapshot
                    .as_ref()
                    .map(|snapshot| snapshot.stdout_lines)
                    .unwrap_or(0),
                stderr_lines: snapshot
                    .as_ref()
                    .map(|snapshot| snapshot.stderr_lines)
                    .unwrap_or(0),
                started_at: snapshot.map(|snapshot| snapshot.started_at),
            });
        }
        Ok(rows)
    }

    /// Expands names into deduplicated service targets in request order.
    /// Empty input means every configured service.
    pub fn expand(&self, names: &[String], op: &OperationConfig) -> Result<Vec<Target>> {
        let names: Vec<String> = if names.is_empty() {
            self.graph.service_names().to_vec()
        } else {
            names.to_vec()
        };
        let mut targets = Vec::new();
        let mut seen = HashSet::new();
        for name in &names {
            self.expand_one(name, &HashMap::new(), op, &mut seen, &mut targets)?;
        }
        Ok(targets)
    }

    fn expand_one(
        &self,
        name: &str,
        env: &HashMap<String, String>,
        op: &OperationConfig,
        seen: &mut HashSet<String>,
        targets: &mut Vec<Target>,
    ) -> Result<()> {
        if op.exclusions.contains(name) {
            return Ok(());
        }
        if let Some(service) = self.graph.service(name) {
            if !seen.insert(name.to_string()) {
                return Ok(());
            }
            if !service.runs_on_this_platform() {
                tracing::debug!(service = %name, "skipping: platform mismatch");
                return Ok(());
            }
            targets.push(Target {
                service,
                env: env.clone(),
            });
            return Ok(());
        }
        if let Some(group) = self.graph.group(name) {
            // Inner groups override outer ones for overlapping keys.
            let mut merged = env.clone();
            merged.extend(group.env.clone());
            for child in &group.children {
                self.expand_one(child, &merged, op, seen, targets)?;
            }
            return Ok(());
        }
        bail!("unknown service or group {:?}", name)
    }

    fn run_operation<F>(
        &self,
        verb: &str,
        names: &[String],
        op: &OperationConfig,
        job: F,
    ) -> Result<()>
    where
        F: Fn(Orchestrator, Target, Task, OperationConfig) -> Result<()> + Send + Sync + Clone + 'static,
    {
        let targets = self.expand(names, op)?;
        if targets.is_empty() {
            bail!("nothing to {}: no services matched", verb);
        }

        let (root, rx) = Task::new_root(verb);
        let follower = task::spawn_follower(rx);
        let mut pool = WorkerPool::new(op.workers);
        pool.start();

        for target in targets {
            let node = root.child(&target.service.name);
            let this = self.clone();
            let op = op.clone();
            let job = job.clone();
            // Per-service failures land in the task tree, not the pool, so
            // one broken service never blocks its siblings. Enqueue only
            // fails on infrastructural errors (pool stopped or broken).
            let submitted = pool.enqueue(Box::new(move || job(this, target, node, op)));
            if submitted.is_err() {
                break;
            }
        }
        pool.stop();
        pool.wait();

        let result = pool.take_err();
        let failed = root.state() == TaskState::Failed;
        drop(root);
        let _ = follower.join();

        match result {
            Some(err) => Err(err),
            None if failed => bail!("{} failed", verb),
            None => Ok(()),
        }
    }

    fn controller(&self, target: &Target) -> InstanceController {
        InstanceController::new(
            self.home.clone(),
            target.service.clone(),
            self.config_path.clone(),
            target.env.clone(),
        )
    }

    fn build_step(&self, target: &Target, node: &Task) -> Result<()> {
        let step = node.child("Build");
        step.set_state(TaskState::InProgress, Vec::new());

        let working_dir =
            supervisor::resolve_working_dir(&self.config_path, None, &target.service);
        let mut env = target.service.env.clone();
        env.extend(target.env.clone());

        let result = self
            .registry
            .create(&target.service, &working_dir, &env)
            .and_then(|backend| backend.build(&working_dir, &env));
        match result {
            Ok(_) => {
                step.set_state(TaskState::Success, Vec::new());
                Ok(())
            }
            Err(err) => {
                step.set_state(TaskState::Failed, vec![format!("{:#}", err)]);
                Err(err)
            }
        }
    }
}

/// One service failing must not cut its siblings from the batch. The failing
/// step has already marked its task node, so the job reports success to the
/// pool and the operation's verdict comes from the task tree root.
fn log_job_failure(target: &Target, result: Result<()>) {
    if let Err(err) = result {
        tracing::debug!(
            service = %target.service.name,
            error = %format!("{:#}", err),
            "job failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn orchestrator(raw: &str, home: &Home) -> Orchestrator {
        let graph = config::resolve(toml::from_str(raw).unwrap()).unwrap();
        Orchestrator::new(
            home.clone(),
            graph,
            PathBuf::from("/tmp/railyard.toml"),
            Arc::new(AtomicBool::new(false)),
        )
    }

    const NESTED: &str = r#"
[[service]]
name = "db"
cmd = "run-db"

[[service]]
name = "api"
cmd = "run-api"

[[service]]
name = "web"
cmd = "run-web"

[[group]]
name = "backend"
children = ["db", "api"]
env = { TIER = "backend", SHARED = "outer" }

[[group]]
name = "all"
children = ["backend", "web", "api"]
env = { SHARED = "inner" }
"#;

    #[test]
    fn groups_expand_depth_first_with_dedup() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::at(tmp.path());
        let orchestrator = orchestrator(NESTED, &home);

        let targets = orchestrator
            .expand(&["all".to_string()], &OperationConfig::default())
            .unwrap();
        let names: Vec<&str> = targets
            .iter()
            .map(|target| target.service.name.as_str())
            .collect();
        // "api" appears once despite being reachable twice.
        assert_eq!(names, ["db", "api", "web"]);
    }

    #[test]
    fn group_env_overlays_accumulate_inner_over_outer() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::at(tmp.path());
        let orchestrator = orchestrator(NESTED, &home);

        let targets = orchestrator
            .expand(&["all".to_string()], &OperationConfig::default())
            .unwrap();
        let db = &targets[0];
        assert_eq!(db.env.get("TIER").map(String::as_str), Some("backend"));
        // The inner group's value wins for the shared key.
        assert_eq!(db.env.get("SHARED").map(String::as_str), Some("outer"));

        let web = &targets[2];
        assert_eq!(web.env.get("SHARED").map(String::as_str), Some("inner"));
        assert!(web.env.get("TIER").is_none());
    }

    #[test]
    fn exclusions_prune_services_and_whole_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::at(tmp.path());
        let orchestrator = orchestrator(NESTED, &home);

        let op = OperationConfig {
            exclusions: HashSet::from(["backend".to_string()]),
            ..Default::default()
        };
        let targets = orchestrator.expand(&["all".to_string()], &op).unwrap();
        let names: Vec<&str> = targets
            .iter()
            .map(|target| target.service.name.as_str())
            .collect();
        assert_eq!(names, ["web", "api"]);
    }

    #[test]
    fn empty_request_expands_to_every_service() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::at(tmp.path());
        let orchestrator = orchestrator(NESTED, &home);

        let targets = orchestrator.expand(&[], &OperationConfig::default()).unwrap();
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::at(tmp.path());
        let orchestrator = orchestrator(NESTED, &home);

        let err = orchestrator
            .expand(&["ghost".to_string()], &OperationConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("unknown service or group"));
    }

    #[test]
    fn stopping_idle_services_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::at(tmp.path());
        home.ensure().unwrap();
        let orchestrator = orchestrator(NESTED, &home);

        orchestrator
            .stop(&["all".to_string()], &OperationConfig::default())
            .unwrap();
    }

    #[test]
    fn failed_build_does_not_cut_siblings_from_the_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::at(tmp.path());
        home.ensure().unwrap();
        let marker = tmp.path().join("built");
        let raw = format!(
            r#"
[[service]]
name = "broken"
build = "false"

[[service]]
name = "assets"
build = "touch {}"
"#,
            marker.display()
        );
        let orchestrator = orchestrator(&raw, &home);

        // Serial mode: "broken" fails before "assets" is even submitted.
        let err = orchestrator
            .start(&[], &OperationConfig::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "start failed");
        assert!(marker.exists());
    }

    #[test]
    fn status_reports_idle_rows_for_stopped_services() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::at(tmp.path());
        home.ensure().unwrap();
        let orchestrator = orchestrator(NESTED, &home);

        let rows = orchestrator
            .status(&[], &OperationConfig::default())
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.pid == 0 && row.state.is_none()));
    }
}
