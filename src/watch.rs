//! Filesystem watching for in-place service restarts.
//!
//! The supervisor starts one watcher thread for a service with configured
//! watch paths. Relevant write events are debounced and forwarded as restart
//! triggers; the supervisor rebuilds and restarts the backend without the
//! controller being involved.

use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::ServiceDescriptor;

/// Starts a watcher thread for the service. Each relevant, debounced change
/// sends one restart trigger. No-op when the service watches nothing.
pub fn spawn_watcher(
    service: &ServiceDescriptor,
    working_dir: &Path,
    tx: mpsc::Sender<()>,
) {
    if service.watch.is_empty() {
        return;
    }
    let service = service.clone();
    let working_dir = working_dir.to_path_buf();
    std::thread::spawn(move || {
        if let Err(err) = watch_service(&service, &working_dir, tx) {
            tracing::warn!(service = %service.name, error = %err, "watcher failed");
        }
    });
}

fn watch_service(
    service: &ServiceDescriptor,
    working_dir: &Path,
    tx: mpsc::Sender<()>,
) -> Result<()> {
    let paths = resolve_watch_paths(working_dir, &service.watch);
    let matcher = IgnoreMatcher::new(working_dir, &service.watch_ignore, service.watch_gitignore)?;

    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;
    for path in &paths {
        watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", path.display()))?;
    }

    let debounce = Duration::from_millis(service.watch_debounce_ms.max(50));
    loop {
        let event = match raw_rx.recv() {
            Ok(res) => res,
            Err(_) => break,
        };
        if !is_relevant(&event, &matcher) {
            continue;
        }

        // Collapse the burst of events an editor save produces into one
        // restart.
        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= debounce {
                break;
            }
            match raw_rx.recv_timeout(debounce - elapsed) {
                Ok(res) => {
                    if is_relevant(&res, &matcher) {
                        last = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }

        if tx.blocking_send(()).is_err() {
            break;
        }
    }
    Ok(())
}

fn resolve_watch_paths(base: &Path, paths: &[String]) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|path| {
            let path = PathBuf::from(path);
            if path.is_absolute() {
                path
            } else {
                base.join(path)
            }
        })
        .collect()
}

fn is_relevant(event: &notify::Result<NotifyEvent>, matcher: &IgnoreMatcher) -> bool {
    let Ok(event) = event else {
        return true;
    };
    if event.paths.is_empty() {
        return true;
    }
    event.paths.iter().any(|path| !matcher.is_ignored(path))
}

struct IgnoreMatcher {
    base: PathBuf,
    globset: Option<GlobSet>,
    gitignore: Option<Gitignore>,
}

impl IgnoreMatcher {
    fn new(base: &Path, patterns: &[String], use_gitignore: bool) -> Result<Self> {
        let globset = if patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                for expanded in expand_pattern(pattern) {
                    builder.add(Glob::new(&expanded)?);
                }
            }
            Some(builder.build()?)
        };

        let gitignore = if use_gitignore {
            let mut builder = GitignoreBuilder::new(base);
            for ancestor in base.ancestors() {
                let gitignore = ancestor.join(".gitignore");
                if gitignore.exists() {
                    builder.add(gitignore);
                }
            }
            Some(builder.build()?)
        } else {
            None
        };

        Ok(Self {
            base: base.to_path_buf(),
            globset,
            gitignore,
        })
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if let Some(globset) = &self.globset {
            if globset.is_match(path) {
                return true;
            }
            if let Ok(relative) = path.strip_prefix(&self.base) {
                if globset.is_match(relative) {
                    return true;
                }
            }
        }
        if let Some(gitignore) = &self.gitignore {
            if gitignore.matched(path, path.is_dir()).is_ignore() {
                return true;
            }
        }
        false
    }
}

// A bare directory name ignores the directory and everything inside it.
fn expand_pattern(pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim_end_matches('/');
    let has_glob = pattern.contains('*') || pattern.contains('?') || pattern.contains('[');
    if has_glob {
        vec![pattern.to_string()]
    } else {
        vec![trimmed.to_string(), format!("{}/**", trimmed)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_paths_resolve_against_working_dir() {
        let base = Path::new("/srv/api");
        let resolved = resolve_watch_paths(base, &["src".to_string(), "/etc/api".to_string()]);
        assert_eq!(resolved[0], base.join("src"));
        assert_eq!(resolved[1], PathBuf::from("/etc/api"));
    }

    #[test]
    fn bare_directory_patterns_ignore_their_contents() {
        assert_eq!(expand_pattern("target"), vec!["target", "target/**"]);
        assert_eq!(expand_pattern("target/"), vec!["target", "target/**"]);
        assert_eq!(expand_pattern("*.log"), vec!["*.log"]);
    }

    #[test]
    fn ignore_matcher_applies_globs_relative_and_absolute() {
        let base = Path::new("/srv/api");
        let matcher = IgnoreMatcher::new(base, &["target".to_string()], false).unwrap();
        assert!(matcher.is_ignored(&base.join("target")));
        assert!(matcher.is_ignored(&base.join("target/debug/api")));
        assert!(!matcher.is_ignored(&base.join("src/main.rs")));
    }
}
