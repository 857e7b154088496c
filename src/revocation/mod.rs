//! Revocation store client
//!
//! The store records the single live token per subject under
//! `<token_prefix><subject>`. A lookup opens (or reuses) a connection to the
//! consumer's store, authenticates and selects the database on fresh
//! connections only, and reads the key. Every phase runs under the configured
//! timeout; nothing is retried.
//!
//! Connections are pooled per destination. A destination includes the
//! database index and a fingerprint of the password, so two consumers that
//! share a host but differ in `AUTH`/`SELECT` state never share a connection.

pub mod redis;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::RevocationStoreConfig;
use crate::jwt_auth::extract::strip_bearer;

pub use self::redis::RedisConnector;

/// Idle connections kept per destination.
pub const POOL_IDLE_LIMIT: usize = 64;

/// Store operation that failed or timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// TCP connect + handshake
    Connect,
    /// `AUTH`
    Auth,
    /// `SELECT`
    Select,
    /// `GET`
    Get,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Auth => "auth",
            Self::Select => "select",
            Self::Get => "get",
        })
    }
}

/// Revocation store failures. "Key not found" is not one of them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Could not reach the store.
    #[error("failed to connect to {destination}: {message}")]
    Connect {
        /// `host:port`
        destination: String,
        /// Driver message
        message: String,
    },

    /// A phase exceeded the configured timeout.
    #[error("{phase} timed out after {after:?}")]
    Timeout {
        /// Phase that timed out
        phase: Phase,
        /// Configured timeout
        after: Duration,
    },

    /// The store rejected `AUTH`.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The store rejected `SELECT`.
    #[error("failed to select database {database}: {message}")]
    Select {
        /// Requested database
        database: u32,
        /// Driver message
        message: String,
    },

    /// `GET` failed.
    #[error("command failed: {0}")]
    Command(String),
}

/// Opens connections to a key-value store.
#[async_trait::async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    /// Open a new connection to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn StoreConnection>, StoreError>;
}

/// One open store connection.
#[async_trait::async_trait]
pub trait StoreConnection: Send + Sync {
    /// Authenticate with `password`.
    async fn auth(&mut self, password: &str) -> Result<(), StoreError>;

    /// Switch to logical database `database`.
    async fn select(&mut self, database: u32) -> Result<(), StoreError>;

    /// Raw value at `key`, `None` when absent.
    ///
    /// A value the store holds but cannot return as a string (for example a
    /// key of another type) is `Some` of empty bytes, not an error.
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Lookup of the live token for a subject.
#[async_trait::async_trait]
pub trait RevocationStore: Send + Sync + 'static {
    /// The token currently stored for `subject`, with any `Bearer ` prefix
    /// removed. `Ok(None)` when the subject has no entry. An unreadable
    /// entry comes back as an empty string, which matches no token.
    async fn lookup_token(
        &self,
        config: &RevocationStoreConfig,
        subject: &str,
    ) -> Result<Option<String>, StoreError>;
}

/// A connection plus the number of times it has been handed out again.
struct PooledConnection {
    conn: Box<dyn StoreConnection>,
    reused: u32,
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Connections opened
    pub opened: AtomicU64,
    /// Checkouts served from the idle list
    pub reused: AtomicU64,
    /// Connections dropped after a failure
    pub discarded: AtomicU64,
}

/// Pooling revocation store client over any [`StoreConnector`].
pub struct RevocationStoreClient<C> {
    connector: C,
    idle: DashMap<String, Vec<PooledConnection>>,
    stats: PoolStats,
}

impl<C: StoreConnector> RevocationStoreClient<C> {
    /// Create a client with an empty pool.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            idle: DashMap::new(),
            stats: PoolStats::default(),
        }
    }

    /// Pool counters.
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Idle connections currently pooled for `config`'s destination.
    #[must_use]
    pub fn idle_count(&self, config: &RevocationStoreConfig) -> usize {
        self.idle
            .get(&destination_key(config))
            .map_or(0, |list| list.len())
    }

    fn checkout(&self, destination: &str) -> Option<PooledConnection> {
        let mut conn = self.idle.get_mut(destination)?.pop()?;
        conn.reused += 1;
        self.stats.reused.fetch_add(1, Ordering::Relaxed);
        Some(conn)
    }

    fn checkin(&self, destination: String, conn: PooledConnection) {
        let mut list = self.idle.entry(destination).or_default();
        if list.len() < POOL_IDLE_LIMIT {
            list.push(conn);
        }
    }

    async fn open(&self, config: &RevocationStoreConfig) -> Result<PooledConnection, StoreError> {
        let mut conn = timed(
            Phase::Connect,
            config.timeout,
            self.connector.connect(&config.host, config.port),
        )
        .await?;

        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
            timed(Phase::Auth, config.timeout, conn.auth(password)).await?;
        }
        if config.database != 0 {
            timed(Phase::Select, config.timeout, conn.select(config.database)).await?;
        }

        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection { conn, reused: 0 })
    }
}

#[async_trait::async_trait]
impl<C: StoreConnector> RevocationStore for RevocationStoreClient<C> {
    async fn lookup_token(
        &self,
        config: &RevocationStoreConfig,
        subject: &str,
    ) -> Result<Option<String>, StoreError> {
        let store_key = format!("{}{subject}", config.token_prefix);
        let destination = destination_key(config);
        debug!(
            store_key = %store_key,
            host = %config.host,
            port = config.port,
            database = config.database,
            "Looking up live token"
        );

        let mut pooled = match self.checkout(&destination) {
            Some(pooled) => pooled,
            None => self.open(config).await?,
        };

        let value = match timed(Phase::Get, config.timeout, pooled.conn.get(&store_key)).await {
            Ok(value) => value,
            Err(e) => {
                // the connection is in an unknown state
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                warn!(store_key = %store_key, reused = pooled.reused, error = %e, "Store lookup failed");
                return Err(e);
            }
        };
        self.checkin(destination, pooled);

        Ok(value.map(|bytes| match String::from_utf8(bytes) {
            Ok(v) => strip_bearer(&v).to_string(),
            Err(_) => {
                warn!(store_key = %store_key, "Stored value is not UTF-8, matching no token");
                String::new()
            }
        }))
    }
}

/// Pool key for a store configuration: `host:port/db`, plus a password
/// fingerprint when one is configured.
#[must_use]
pub fn destination_key(config: &RevocationStoreConfig) -> String {
    let base = format!("{}:{}/{}", config.host, config.port, config.database);
    match config.password.as_deref() {
        Some(password) if !password.is_empty() => {
            let digest = Sha256::digest(password.as_bytes());
            format!("{base}#{}", &hex::encode(digest)[..16])
        }
        _ => base,
    }
}

async fn timed<T, F>(phase: Phase, after: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| StoreError::Timeout { phase, after })?
}
