//! Versioned consumer configuration with file-watch reload.
//!
//! [`LiveConsumers`] is the consumer configuration provider the authenticator
//! reads on every request: a synchronous `snapshot()` returning the current
//! [`ConsumerSnapshot`]. Publishing a changed consumer list installs a new
//! snapshot with the next version; published snapshots are never mutated.
//!
//! [`ConsumerWatcher`] watches the YAML file, re-validates it on change and
//! publishes the new consumer list. A file that fails to load or validate is
//! logged and ignored; the running snapshot stays live.
//!
//! Only `consumers` are hot-reloaded. Changes to `server`, `jwt_auth` or
//! `vault` need a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::{Config, ConsumerConfig};
use crate::jwt_auth::directory::{Consumer, ConsumerSnapshot};

/// Difference between two consumer lists, by username.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerDiff {
    /// Consumers only in the new list
    pub added: Vec<String>,
    /// Consumers only in the old list
    pub removed: Vec<String>,
    /// Consumers whose settings changed
    pub modified: Vec<String>,
}

impl ConsumerDiff {
    /// `true` when the lists are equivalent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// One-line description for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("added: [{}]", self.added.join(", ")));
        }
        if !self.removed.is_empty() {
            parts.push(format!("removed: [{}]", self.removed.join(", ")));
        }
        if !self.modified.is_empty() {
            parts.push(format!("modified: [{}]", self.modified.join(", ")));
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Compare two consumer lists.
#[must_use]
pub fn diff_consumers(old: &ConsumerSnapshot, new: &[ConsumerConfig]) -> ConsumerDiff {
    // Serialized form is the equality check; AuthConfig has no PartialEq.
    let fingerprint = |c: &Consumer| serde_json::to_string(&c.auth).ok();

    let old_by_name: HashMap<&str, &Consumer> = old
        .consumers
        .iter()
        .map(|c| (c.username.as_str(), c.as_ref()))
        .collect();
    let new_names: HashMap<&str, &ConsumerConfig> =
        new.iter().map(|c| (c.username.as_str(), c)).collect();

    let mut diff = ConsumerDiff::default();
    for c in new {
        match old_by_name.get(c.username.as_str()) {
            None => diff.added.push(c.username.clone()),
            Some(existing) => {
                if fingerprint(existing) != serde_json::to_string(&c.jwt_auth).ok() {
                    diff.modified.push(c.username.clone());
                }
            }
        }
    }
    for name in old_by_name.keys() {
        if !new_names.contains_key(name) {
            diff.removed.push((*name).to_string());
        }
    }
    diff.removed.sort();
    diff
}

/// Current consumer snapshot, atomically swappable.
pub struct LiveConsumers {
    inner: RwLock<Arc<ConsumerSnapshot>>,
}

impl LiveConsumers {
    /// Seed with the startup consumers as version 1.
    #[must_use]
    pub fn new(consumers: Vec<ConsumerConfig>) -> Self {
        let snapshot = ConsumerSnapshot::new(1, consumers.into_iter().map(Consumer::from));
        Self {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ConsumerSnapshot> {
        Arc::clone(&self.inner.read())
    }

    /// Current configuration version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Publish `consumers` as the next version. Callers validate first.
    pub fn replace(&self, consumers: Vec<ConsumerConfig>) -> u64 {
        let mut guard = self.inner.write();
        let version = guard.version + 1;
        *guard = Arc::new(ConsumerSnapshot::new(
            version,
            consumers.into_iter().map(Consumer::from),
        ));
        version
    }

    /// Publish `consumers` only if they differ from the current snapshot.
    ///
    /// A generated secret survives the reload when the consumer keeps its
    /// username and key and still configures no secret, so tokens already
    /// issued under it stay valid.
    ///
    /// Returns the diff that was applied, or `None` if nothing changed.
    pub fn apply(&self, mut consumers: Vec<ConsumerConfig>) -> Option<ConsumerDiff> {
        let current = self.snapshot();
        carry_generated_secrets(&current, &mut consumers);

        let diff = diff_consumers(&current, &consumers);
        if diff.is_empty() {
            return None;
        }
        self.replace(consumers);
        Some(diff)
    }
}

fn carry_generated_secrets(current: &ConsumerSnapshot, consumers: &mut [ConsumerConfig]) {
    let generated: HashMap<(&str, &str), &str> = current
        .consumers
        .iter()
        .filter(|c| c.auth.secret_generated)
        .filter_map(|c| {
            let secret = c.auth.secret.as_deref()?;
            Some(((c.username.as_str(), c.auth.key.as_str()), secret))
        })
        .collect();

    for consumer in consumers.iter_mut().filter(|c| c.jwt_auth.secret_generated) {
        let id = (consumer.username.as_str(), consumer.jwt_auth.key.as_str());
        if let Some(secret) = generated.get(&id) {
            consumer.jwt_auth.secret = Some((*secret).to_string());
        }
    }
}

/// Reload `config_path` into `live`.
///
/// # Errors
///
/// Returns the load/validation error; `live` is left untouched in that case.
pub fn reload_consumers(config_path: &Path, live: &LiveConsumers) -> Result<Option<ConsumerDiff>> {
    let config = Config::load(Some(config_path))?;
    Ok(live.apply(config.consumers))
}

/// Watches the configuration file and republishes consumers on change.
pub struct ConsumerWatcher {
    /// Dropping the notify watcher stops event delivery.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConsumerWatcher {
    /// Start watching `config_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be created.
    pub fn start(
        config_path: PathBuf,
        live: Arc<LiveConsumers>,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let config_path = config_path.canonicalize().unwrap_or(config_path);
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);

        let watcher = create_notify_watcher(event_tx, &config_path)?;
        spawn_reload_task(config_path, live, event_rx, shutdown_rx);

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }
}

fn create_notify_watcher(
    event_tx: tokio::sync::mpsc::Sender<()>,
    config_path: &Path,
) -> Result<RecommendedWatcher> {
    let watch_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let path_for_closure = config_path.to_path_buf();

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            if result
                .as_ref()
                .is_ok_and(|e| is_config_event(e, &path_for_closure))
            {
                let _ = event_tx.try_send(());
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| crate::Error::Internal(format!("Failed to create config watcher: {e}")))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| crate::Error::Internal(format!("Failed to watch config path: {e}")))?;

    Ok(watcher)
}

fn spawn_reload_task(
    config_path: PathBuf,
    live: Arc<LiveConsumers>,
    mut event_rx: tokio::sync::mpsc::Receiver<()>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        const DEBOUNCE: Duration = Duration::from_millis(500);
        let mut last_event: Option<Instant> = None;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                Some(()) = event_rx.recv() => {
                    last_event = Some(Instant::now());
                }
                _ = ticker.tick() => {
                    if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                        last_event = None;
                        reload_once(&config_path, &live);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Consumer watcher shutting down");
                    break;
                }
            }
        }
    });
}

fn is_config_event(event: &Event, config_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p == config_path)
}

fn reload_once(config_path: &Path, live: &LiveConsumers) {
    match reload_consumers(config_path, live) {
        Ok(Some(diff)) => {
            info!(version = live.version(), changes = %diff.summary(), "Consumers reloaded");
        }
        Ok(None) => debug!("Config changed on disk, consumers unchanged"),
        Err(e) => {
            warn!(error = %e, "Consumer reload failed, keeping current consumers");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::AuthConfig;

    fn consumer(username: &str, key: &str) -> ConsumerConfig {
        let mut auth = AuthConfig::new(key);
        auth.secret = Some("s3cret".to_string());
        ConsumerConfig {
            username: username.to_string(),
            jwt_auth: auth,
        }
    }

    #[test]
    fn replace_bumps_version() {
        let live = LiveConsumers::new(vec![consumer("alice", "k1")]);
        assert_eq!(live.version(), 1);

        let old = live.snapshot();
        let v = live.replace(vec![consumer("bob", "k2")]);

        assert_eq!(v, 2);
        assert_eq!(live.snapshot().consumers[0].username, "bob");
        // published snapshots are immutable
        assert_eq!(old.version, 1);
        assert_eq!(old.consumers[0].username, "alice");
    }

    #[test]
    fn apply_without_changes_keeps_version() {
        let live = LiveConsumers::new(vec![consumer("alice", "k1")]);
        assert!(live.apply(vec![consumer("alice", "k1")]).is_none());
        assert_eq!(live.version(), 1);
    }

    #[test]
    fn diff_classifies_changes() {
        let live = LiveConsumers::new(vec![consumer("alice", "k1"), consumer("bob", "k2")]);

        let diff = diff_consumers(
            &live.snapshot(),
            &[consumer("alice", "k1-rotated"), consumer("carol", "k3")],
        );

        assert_eq!(
            diff,
            ConsumerDiff {
                added: vec!["carol".to_string()],
                removed: vec!["bob".to_string()],
                modified: vec!["alice".to_string()],
            }
        );
        assert_eq!(
            diff.summary(),
            "added: [carol]; removed: [bob]; modified: [alice]"
        );
    }

    #[test]
    fn reload_from_file_publishes_new_version() {
        // GIVEN: a live set with alice and a file that adds bob
        let live = LiveConsumers::new(vec![consumer("alice", "k1")]);
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r"
consumers:
  - username: alice
    jwt_auth:
      key: k1
      secret: s3cret
  - username: bob
    jwt_auth:
      key: k2
      secret: other
"
        )
        .unwrap();

        // WHEN: reloaded
        let diff = reload_consumers(file.path(), &live).unwrap().unwrap();

        // THEN: bob is added under version 2
        assert_eq!(diff.added, vec!["bob".to_string()]);
        assert_eq!(live.version(), 2);
    }

    #[test]
    fn unchanged_file_keeps_generated_secret() {
        // GIVEN: a consumer without a configured secret, loaded from disk
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r"
consumers:
  - username: alice
    jwt_auth:
      key: k1
"
        )
        .unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        let live = LiveConsumers::new(config.consumers);
        let secret = live.snapshot().consumers[0].auth.secret.clone();
        assert!(secret.is_some());

        // WHEN: the same file is reloaded
        let diff = reload_consumers(file.path(), &live).unwrap();

        // THEN: nothing changed and the secret is still the first one
        assert_eq!(diff, None);
        assert_eq!(live.version(), 1);
        assert_eq!(live.snapshot().consumers[0].auth.secret, secret);
    }

    #[test]
    fn rekeyed_consumer_gets_fresh_generated_secret() {
        // GIVEN: alice running on a generated secret under k1
        let mut auth = AuthConfig::new("k1");
        auth.validate().unwrap();
        let live = LiveConsumers::new(vec![ConsumerConfig {
            username: "alice".to_string(),
            jwt_auth: auth,
        }]);
        let old_secret = live.snapshot().consumers[0].auth.secret.clone();

        // WHEN: her key changes, still without a configured secret
        let mut rekeyed = AuthConfig::new("k2");
        rekeyed.validate().unwrap();
        let diff = live
            .apply(vec![ConsumerConfig {
                username: "alice".to_string(),
                jwt_auth: rekeyed,
            }])
            .unwrap();

        // THEN: the consumer is modified and the old secret is not reused
        assert_eq!(diff.modified, vec!["alice".to_string()]);
        assert_ne!(live.snapshot().consumers[0].auth.secret, old_secret);
    }

    #[test]
    fn configured_secret_replaces_generated_one() {
        let mut auth = AuthConfig::new("k1");
        auth.validate().unwrap();
        let live = LiveConsumers::new(vec![ConsumerConfig {
            username: "alice".to_string(),
            jwt_auth: auth,
        }]);

        let diff = live.apply(vec![consumer("alice", "k1")]).unwrap();

        assert_eq!(diff.modified, vec!["alice".to_string()]);
        assert_eq!(
            live.snapshot().consumers[0].auth.secret.as_deref(),
            Some("s3cret")
        );
    }

    #[test]
    fn invalid_file_keeps_current_snapshot() {
        // GIVEN: an RS256 consumer without keys
        let live = LiveConsumers::new(vec![consumer("alice", "k1")]);
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r"
consumers:
  - username: alice
    jwt_auth:
      key: k1
      algorithm: RS256
"
        )
        .unwrap();

        // THEN: reload fails and version 1 stays live
        assert!(reload_consumers(file.path(), &live).is_err());
        assert_eq!(live.version(), 1);
    }
}
