//! Consumer directory: issuer key → consumer, cached per configuration version.
//!
//! The directory keeps exactly one built mapping together with the version it
//! was built from. A lookup carrying a different version rebuilds the mapping
//! from that snapshot's consumer list and swaps it in as a whole, so readers
//! see either the previous mapping or the complete new one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::{AuthConfig, ConsumerConfig};

/// A configured caller identity with its authentication settings.
#[derive(Debug, Clone)]
pub struct Consumer {
    /// Identity name
    pub username: String,
    /// Authentication settings
    pub auth: AuthConfig,
}

impl From<ConsumerConfig> for Consumer {
    fn from(c: ConsumerConfig) -> Self {
        Self {
            username: c.username,
            auth: c.jwt_auth,
        }
    }
}

/// Immutable list of consumers tagged with the configuration version it
/// belongs to.
#[derive(Debug, Clone, Default)]
pub struct ConsumerSnapshot {
    /// Monotonic configuration version
    pub version: u64,
    /// Consumers in configuration order
    pub consumers: Vec<Arc<Consumer>>,
}

impl ConsumerSnapshot {
    /// Create a snapshot.
    #[must_use]
    pub fn new(version: u64, consumers: impl IntoIterator<Item = Consumer>) -> Self {
        Self {
            version,
            consumers: consumers.into_iter().map(Arc::new).collect(),
        }
    }
}

/// Why a directory lookup found nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// The snapshot contains no consumers at all.
    #[error("no consumers are configured")]
    NoConsumers,
    /// No consumer uses this issuer key.
    #[error("unknown issuer '{0}'")]
    UnknownIssuer(String),
}

/// Mapping built from one snapshot.
struct Built {
    version: u64,
    by_key: HashMap<String, Arc<Consumer>>,
}

/// Versioned issuer-key directory.
pub struct ConsumerDirectory {
    current: RwLock<Option<Arc<Built>>>,
    rebuild: Mutex<()>,
    rebuilds: AtomicU64,
}

impl ConsumerDirectory {
    /// Create an empty directory. The first lookup builds it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            rebuild: Mutex::new(()),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Resolve `issuer` against the directory for `snapshot.version`,
    /// rebuilding first if the cached mapping belongs to another version.
    pub fn resolve(
        &self,
        snapshot: &ConsumerSnapshot,
        issuer: &str,
    ) -> Result<Arc<Consumer>, DirectoryError> {
        if snapshot.consumers.is_empty() {
            return Err(DirectoryError::NoConsumers);
        }

        let built = self.mapping_for(snapshot);
        built
            .by_key
            .get(issuer)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownIssuer(issuer.to_string()))
    }

    /// Number of rebuilds performed so far.
    #[must_use]
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Version of the cached mapping, if one has been built.
    #[must_use]
    pub fn cached_version(&self) -> Option<u64> {
        self.current.read().as_ref().map(|b| b.version)
    }

    fn mapping_for(&self, snapshot: &ConsumerSnapshot) -> Arc<Built> {
        if let Some(built) = self.cached(snapshot.version) {
            return built;
        }

        // One rebuild at a time; whoever waited re-checks before building.
        let _guard = self.rebuild.lock();
        if let Some(built) = self.cached(snapshot.version) {
            return built;
        }

        let built = Arc::new(build(snapshot));
        *self.current.write() = Some(Arc::clone(&built));
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        debug!(
            version = snapshot.version,
            consumers = built.by_key.len(),
            "Rebuilt consumer directory"
        );
        built
    }

    fn cached(&self, version: u64) -> Option<Arc<Built>> {
        self.current
            .read()
            .as_ref()
            .filter(|b| b.version == version)
            .map(Arc::clone)
    }
}

impl Default for ConsumerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn build(snapshot: &ConsumerSnapshot) -> Built {
    let mut by_key = HashMap::with_capacity(snapshot.consumers.len());
    for consumer in &snapshot.consumers {
        // last write wins on duplicate keys
        by_key.insert(consumer.auth.key.clone(), Arc::clone(consumer));
    }
    Built {
        version: snapshot.version,
        by_key,
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn consumer(username: &str, key: &str) -> Consumer {
        Consumer {
            username: username.to_string(),
            auth: AuthConfig::new(key),
        }
    }

    #[test]
    fn resolves_known_issuer() {
        let dir = ConsumerDirectory::new();
        let snap = ConsumerSnapshot::new(1, [consumer("alice", "k1"), consumer("bob", "k2")]);

        assert_eq!(dir.resolve(&snap, "k2").unwrap().username, "bob");
        assert_eq!(
            dir.resolve(&snap, "nope").unwrap_err(),
            DirectoryError::UnknownIssuer("nope".to_string())
        );
    }

    #[test]
    fn empty_snapshot_is_no_consumers() {
        let dir = ConsumerDirectory::new();
        let snap = ConsumerSnapshot::new(1, []);
        assert_eq!(dir.resolve(&snap, "k1").unwrap_err(), DirectoryError::NoConsumers);
    }

    #[test]
    fn same_version_does_not_rebuild() {
        let dir = ConsumerDirectory::new();
        let snap = ConsumerSnapshot::new(7, [consumer("alice", "k1")]);

        dir.resolve(&snap, "k1").unwrap();
        dir.resolve(&snap, "k1").unwrap();
        dir.resolve(&snap, "missing").unwrap_err();

        assert_eq!(dir.rebuild_count(), 1);
        assert_eq!(dir.cached_version(), Some(7));
    }

    #[test]
    fn version_bump_exposes_new_keys() {
        // GIVEN: version 1 without k2
        let dir = ConsumerDirectory::new();
        let v1 = ConsumerSnapshot::new(1, [consumer("alice", "k1")]);
        assert!(dir.resolve(&v1, "k2").is_err());

        // WHEN: version 2 adds k2 and drops k1
        let v2 = ConsumerSnapshot::new(2, [consumer("bob", "k2")]);

        // THEN: k2 resolves under v2, k1 no longer does
        assert_eq!(dir.resolve(&v2, "k2").unwrap().username, "bob");
        assert!(dir.resolve(&v2, "k1").is_err());

        // AND: the old snapshot still resolves its own keys
        assert_eq!(dir.resolve(&v1, "k1").unwrap().username, "alice");
    }

    #[test]
    fn duplicate_keys_last_write_wins() {
        let dir = ConsumerDirectory::new();
        let snap = ConsumerSnapshot::new(1, [consumer("first", "dup"), consumer("second", "dup")]);
        assert_eq!(dir.resolve(&snap, "dup").unwrap().username, "second");
    }

    #[test]
    fn concurrent_lookups_converge_on_one_rebuild() {
        let dir = Arc::new(ConsumerDirectory::new());
        let snap = Arc::new(ConsumerSnapshot::new(
            3,
            (0..50).map(|i| consumer(&format!("user-{i}"), &format!("key-{i}"))),
        ));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let dir = Arc::clone(&dir);
                let snap = Arc::clone(&snap);
                thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("key-{}", (i + t) % 50);
                        assert!(dir.resolve(&snap, &key).is_ok());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(dir.rebuild_count(), 1);
    }
}
