//! Status snapshot store.
//!
//! The supervisor is the only writer; the controller and the `status` command
//! are readers. Snapshots are whole JSON files keyed by (service, instance
//! id), so a stale snapshot from a prior run can never shadow the current one
//! and a torn write is impossible — the worst case is a momentarily stale
//! read.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::home::Home;

/// Lifecycle state as observed by the supervisor.
///
/// `Running` means the backend's start call returned; readiness is a separate
/// controller-side concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Running,
    Stopped,
    Died,
}

/// Persisted record of an instance's observed runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: ServiceState,
    pub ports: Vec<u16>,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
    pub started_at: DateTime<Utc>,
    pub memory_bytes: u64,
}

impl StatusSnapshot {
    pub fn starting() -> Self {
        Self {
            state: ServiceState::Starting,
            ports: Vec::new(),
            stdout_lines: 0,
            stderr_lines: 0,
            started_at: Utc::now(),
            memory_bytes: 0,
        }
    }
}

/// Per-service snapshot directory, one file per instance id.
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    pub fn new(home: &Home, service: &str) -> Self {
        Self {
            dir: home.status_dir(service),
        }
    }

    pub fn write(&self, instance_id: &str, snapshot: &StatusSnapshot) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path(instance_id);
        let raw = serde_json::to_vec_pretty(snapshot).context("failed to encode snapshot")?;
        std::fs::write(&path, raw)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn read(&self, instance_id: &str) -> Result<StatusSnapshot> {
        let path = self.path(instance_id);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Removes every snapshot for the service, including stale ones left by
    /// prior instances. Called on clean stop.
    pub fn clear(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)
                .with_context(|| format!("failed to remove {}", self.dir.display()))?;
        }
        Ok(())
    }

    fn path(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", instance_id))
    }
}
