//! State-directory layout.
//!
//! Everything railyard persists lives under a single per-user root directory
//! (`$RAILYARD_HOME`, or `~/.railyard` by default): instance state files,
//! status snapshot directories, legacy pid files, and per-service logs.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Root of the on-disk state owned by railyard.
#[derive(Debug, Clone)]
pub struct Home {
    root: PathBuf,
}

impl Home {
    /// Resolves the state root from an explicit override, the `RAILYARD_HOME`
    /// environment variable, or `$HOME/.railyard`, in that order.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        if let Some(root) = explicit {
            return Ok(Self { root });
        }
        if let Ok(root) = std::env::var("RAILYARD_HOME") {
            if !root.is_empty() {
                return Ok(Self { root: PathBuf::from(root) });
            }
        }
        let home = std::env::var("HOME")
            .map_err(|_| anyhow!("cannot resolve state directory: HOME is not set"))?;
        Ok(Self {
            root: Path::new(&home).join(".railyard"),
        })
    }

    /// Creates a `Home` rooted at an arbitrary directory. Used by tests.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the directory tree if it does not exist yet.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.state_dir(), self.status_root(), self.pid_dir(), self.log_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Instance state file for a service (pid, instance id, overrides).
    pub fn state_file(&self, service: &str) -> PathBuf {
        self.state_dir().join(format!("{}.json", service))
    }

    pub fn status_root(&self) -> PathBuf {
        self.root.join("status")
    }

    /// Directory holding one snapshot file per instance id.
    pub fn status_dir(&self, service: &str) -> PathBuf {
        self.status_root().join(service)
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.root.join("pid")
    }

    /// Legacy single-value pid file, read as a fallback and then migrated.
    pub fn pid_file(&self, service: &str) -> PathBuf {
        self.pid_dir().join(format!("{}.pid", service))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn log_file(&self, service: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log", service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_under_home() {
        let home = Home::at("/tmp/railyard-tests");
        assert_eq!(home.state_file("api"), PathBuf::from("/tmp/railyard-tests/state/api.json"));
        assert_eq!(home.pid_file("api"), PathBuf::from("/tmp/railyard-tests/pid/api.pid"));
        assert_eq!(home.status_dir("api"), PathBuf::from("/tmp/railyard-tests/status/api"));
        assert_eq!(home.log_file("api"), PathBuf::from("/tmp/railyard-tests/log/api.log"));
    }

    #[test]
    fn ensure_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let home = Home::at(tmp.path().join("root"));
        home.ensure().unwrap();
        assert!(home.state_dir().is_dir());
        assert!(home.status_root().is_dir());
        assert!(home.pid_dir().is_dir());
        assert!(home.log_dir().is_dir());
    }
}
