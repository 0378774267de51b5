//! Configuration loading for railyard.
//!
//! This module defines the structure of the `railyard.toml` configuration
//! file, the legacy-field migration performed at load time, and the resolved
//! service/group graph handed to the orchestrator. Validation runs before any
//! process is spawned.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Default bound on how long a launch waits for readiness.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Top-level structure corresponding to `railyard.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    /// Worker pool size for start/stop operations.
    pub workers: Option<usize>,
    /// Default readiness timeout in seconds.
    pub timeout_seconds: Option<u64>,
    /// Services managed by this file.
    #[serde(rename = "service", default)]
    pub services: Vec<ServiceConfig>,
    /// Named groups of services and/or other groups.
    #[serde(rename = "group", default)]
    pub groups: Vec<GroupConfig>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Unique name of the service.
    pub name: String,
    /// Launch command. Services without one are build-only.
    pub cmd: Option<String>,
    /// Build command, run before launching unless skipped.
    pub build: Option<String>,
    /// Stop command override. Defaults to signaling the process group.
    pub stop: Option<String>,
    /// Working directory, relative to the config file unless absolute.
    pub cwd: Option<String>,
    /// Platform constraint matched against the current OS (e.g. "linux").
    pub platform: Option<String>,
    /// Environment variable overlay.
    pub env: Option<HashMap<String, String>>,
    /// Paths watched for edits that trigger an in-place rebuild + restart.
    pub watch: Option<Vec<String>>,
    /// Patterns excluded from watching.
    pub watch_ignore: Option<Vec<String>>,
    /// Whether to also exclude everything matched by .gitignore.
    pub watch_gitignore: Option<bool>,
    /// Debounce interval for watch events, in milliseconds.
    pub watch_debounce_ms: Option<u64>,
    /// Backend kind; only "shell" ships today.
    pub backend: Option<String>,
    /// Tags propagated to the supervisor.
    pub tags: Option<Vec<String>>,
    /// Readiness check configuration.
    pub launch_check: Option<LaunchCheckConfig>,
    /// Legacy field: log text that marked the service as started. Migrated
    /// into `launch_check.log_text` at load time.
    pub started: Option<String>,
}

/// Raw readiness check settings. At most one strategy may be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchCheckConfig {
    /// Succeed when a log line contains this text.
    pub log_text: Option<String>,
    /// Succeed when all of these ports are listening.
    pub ports: Option<Vec<u16>>,
    /// Succeed unconditionally after this many milliseconds.
    pub delay_ms: Option<u64>,
    /// Per-service override of the overall readiness timeout.
    pub timeout_seconds: Option<u64>,
}

impl LaunchCheckConfig {
    fn strategy_count(&self) -> usize {
        [
            self.log_text.is_some(),
            self.ports.is_some(),
            self.delay_ms.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// Configuration for a group of services and/or nested groups.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Ordered child names; each must be a known service or group.
    pub children: Vec<String>,
    /// Environment overlay applied to every service expanded underneath.
    pub env: Option<HashMap<String, String>>,
}

/// Readiness strategy after validation and legacy migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchCheck {
    /// Default: wait until the command or any descendant listens on a port.
    AnyPort,
    /// Wait for a log line containing this text.
    LogText(String),
    /// Wait until all ports are observed listening.
    Ports(Vec<u16>),
    /// Wait a fixed duration.
    Delay(Duration),
}

/// A fully resolved service, immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub cmd: Option<String>,
    pub build: Option<String>,
    pub stop: Option<String>,
    pub cwd: Option<String>,
    pub platform: Option<String>,
    pub env: HashMap<String, String>,
    pub watch: Vec<String>,
    pub watch_ignore: Vec<String>,
    pub watch_gitignore: bool,
    pub watch_debounce_ms: u64,
    pub backend: String,
    pub tags: Vec<String>,
    pub launch_check: LaunchCheck,
    pub ready_timeout: Duration,
}

impl ServiceDescriptor {
    /// Build-only services have no launch step and are skipped by stop.
    pub fn has_launch_step(&self) -> bool {
        self.cmd.is_some()
    }

    pub fn runs_on_this_platform(&self) -> bool {
        self.platform
            .as_deref()
            .map(|platform| platform == std::env::consts::OS)
            .unwrap_or(true)
    }
}

/// A resolved group. Used purely for recursive fan-out.
#[derive(Debug, Clone)]
pub struct ServiceGroup {
    pub name: String,
    pub children: Vec<String>,
    pub env: HashMap<String, String>,
}

/// The validated service/group object graph.
#[derive(Debug)]
pub struct ServiceGraph {
    services: HashMap<String, Arc<ServiceDescriptor>>,
    groups: HashMap<String, Arc<ServiceGroup>>,
    service_order: Vec<String>,
}

impl ServiceGraph {
    pub fn service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).cloned()
    }

    pub fn group(&self, name: &str) -> Option<Arc<ServiceGroup>> {
        self.groups.get(name).cloned()
    }

    /// Service names in configuration order.
    pub fn service_names(&self) -> &[String] {
        &self.service_order
    }
}

/// Loads and parses a configuration file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let file: ConfigFile = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(file)
}

/// Migrates legacy fields, validates, and builds the service graph.
pub fn resolve(file: ConfigFile) -> Result<ServiceGraph> {
    let default_timeout = file
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_READY_TIMEOUT);

    let mut services = HashMap::new();
    let mut service_order = Vec::new();
    let mut names = HashSet::new();
    for service in file.services {
        if !names.insert(service.name.clone()) {
            bail!("duplicate name: {}", service.name);
        }
        let descriptor = resolve_service(service, default_timeout)?;
        service_order.push(descriptor.name.clone());
        services.insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    let mut groups = HashMap::new();
    for group in file.groups {
        if !names.insert(group.name.clone()) {
            bail!("duplicate name: {}", group.name);
        }
        groups.insert(
            group.name.clone(),
            Arc::new(ServiceGroup {
                name: group.name,
                children: group.children,
                env: group.env.unwrap_or_default(),
            }),
        );
    }

    for group in groups.values() {
        for child in &group.children {
            if !services.contains_key(child) && !groups.contains_key(child) {
                bail!("group {} references unknown child {}", group.name, child);
            }
        }
    }
    check_group_cycles(&groups)?;

    Ok(ServiceGraph {
        services,
        groups,
        service_order,
    })
}

fn resolve_service(config: ServiceConfig, default_timeout: Duration) -> Result<ServiceDescriptor> {
    let mut check = config.launch_check.unwrap_or_default();

    // Versioned migration: the old `started` property becomes the log-text
    // strategy, but never silently overrides an explicit one.
    if let Some(started) = config.started {
        if check.strategy_count() > 0 {
            bail!(
                "service {} sets both the legacy 'started' field and a launch_check strategy",
                config.name
            );
        }
        check.log_text = Some(started);
    }

    if check.strategy_count() > 1 {
        bail!(
            "service {} declares more than one readiness strategy; log_text, ports and delay_ms are mutually exclusive",
            config.name
        );
    }

    let launch_check = if let Some(text) = check.log_text {
        LaunchCheck::LogText(text)
    } else if let Some(ports) = check.ports {
        LaunchCheck::Ports(ports)
    } else if let Some(delay_ms) = check.delay_ms {
        LaunchCheck::Delay(Duration::from_millis(delay_ms))
    } else {
        LaunchCheck::AnyPort
    };

    let ready_timeout = check
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);

    Ok(ServiceDescriptor {
        name: config.name,
        cmd: config.cmd,
        build: config.build,
        stop: config.stop,
        cwd: config.cwd,
        platform: config.platform,
        env: config.env.unwrap_or_default(),
        watch: config.watch.unwrap_or_default(),
        watch_ignore: config.watch_ignore.unwrap_or_default(),
        watch_gitignore: config.watch_gitignore.unwrap_or(false),
        watch_debounce_ms: config.watch_debounce_ms.unwrap_or(200),
        backend: config.backend.unwrap_or_else(|| "shell".to_string()),
        tags: config.tags.unwrap_or_default(),
        launch_check,
        ready_timeout,
    })
}

fn check_group_cycles(groups: &HashMap<String, Arc<ServiceGroup>>) -> Result<()> {
    for start in groups.keys() {
        let mut stack = vec![(start.clone(), Vec::new())];
        while let Some((name, path)) = stack.pop() {
            if path.contains(&name) {
                bail!("group cycle detected: {} -> {}", path.join(" -> "), name);
            }
            let Some(group) = groups.get(&name) else {
                continue;
            };
            let mut next_path = path.clone();
            next_path.push(name);
            for child in &group.children {
                if groups.contains_key(child) {
                    stack.push((child.clone(), next_path.clone()));
                }
            }
        }
    }
    Ok(())
}
