//! Moderation policy file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::observability::metrics;
use crate::security::moderation::{ContentModerator, ModerationPolicy, PolicyError};

/// Watches a policy file and swaps it into a [`ContentModerator`] on change.
pub struct PolicyWatcher {
    path: PathBuf,
    moderator: Arc<ContentModerator>,
}

impl PolicyWatcher {
    pub fn new(path: &Path, moderator: Arc<ContentModerator>) -> Self {
        Self {
            path: path.to_path_buf(),
            moderator,
        }
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let moderator = self.moderator.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    tracing::info!(path = ?path, "Policy file change detected, reloading");
                    // Errors are logged inside; the active policy stays in place.
                    let _ = reload_policy(&path, &moderator);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Policy watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Policy watcher started");
        Ok(watcher)
    }
}

/// Load `path` and install it. On any error the current policy is kept.
pub fn reload_policy(path: &Path, moderator: &ContentModerator) -> Result<String, PolicyError> {
    let result = ModerationPolicy::load(path).and_then(|policy| {
        let previous = moderator.reload(&policy)?;
        Ok((previous, policy.version))
    });

    match result {
        Ok((previous, current)) => {
            tracing::info!(previous = %previous, current = %current, "Moderation policy reloaded");
            metrics::record_policy_reload(true);
            Ok(current)
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                version = %moderator.policy_version(),
                "Failed to reload moderation policy; keeping current policy"
            );
            metrics::record_policy_reload(false);
            Err(e)
        }
    }
}
