//! Redis backend for the revocation store client

use redis::aio::MultiplexedConnection;

use super::{StoreConnection, StoreConnector, StoreError};

/// Opens multiplexed async Redis connections.
///
/// Credentials and database are not put in the connection URL; the pool
/// issues `AUTH`/`SELECT` itself on fresh connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

/// `redis://` URL for `host:port`, bracketing IPv6 literals.
fn connection_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("redis://[{host}]:{port}/")
    } else {
        format!("redis://{host}:{port}/")
    }
}

fn is_wrong_type(e: &redis::RedisError) -> bool {
    e.code() == Some("WRONGTYPE")
}

#[async_trait::async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn StoreConnection>, StoreError> {
        let destination = format!("{host}:{port}");
        let connect_error = |e: redis::RedisError| StoreError::Connect {
            destination: destination.clone(),
            message: e.to_string(),
        };

        let client = redis::Client::open(connection_url(host, port)).map_err(connect_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connect_error)?;

        Ok(Box::new(RedisConnection { conn }))
    }
}

struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait::async_trait]
impl StoreConnection for RedisConnection {
    async fn auth(&mut self, password: &str) -> Result<(), StoreError> {
        let _: () = redis::cmd("AUTH")
            .arg(password)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| StoreError::Auth(e.to_string()))?;
        Ok(())
    }

    async fn select(&mut self, database: u32) -> Result<(), StoreError> {
        let _: () = redis::cmd("SELECT")
            .arg(database)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| StoreError::Select {
                database,
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match redis::cmd("GET").arg(key).query_async(&mut self.conn).await {
            Ok(value) => Ok(value),
            // the key holds a list, hash, ...: answered, but no token
            Err(e) if is_wrong_type(&e) => Ok(Some(Vec::new())),
            Err(e) => Err(StoreError::Command(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RevocationStoreConfig;
    use crate::revocation::{RevocationStore, RevocationStoreClient};

    #[test]
    fn url_for_hostname_and_ipv4() {
        assert_eq!(connection_url("localhost", 6379), "redis://localhost:6379/");
        assert_eq!(connection_url("10.0.0.5", 6380), "redis://10.0.0.5:6380/");
    }

    #[test]
    fn url_brackets_ipv6() {
        assert_eq!(connection_url("::1", 6379), "redis://[::1]:6379/");
        assert_eq!(connection_url("[::1]", 6379), "redis://[::1]:6379/");
    }

    #[tokio::test]
    async fn unreachable_store_is_a_store_error() {
        // GIVEN: nothing listens on port 1
        let client = RevocationStoreClient::new(RedisConnector);
        let config = RevocationStoreConfig {
            port: 1,
            timeout: Duration::from_millis(500),
            ..RevocationStoreConfig::default()
        };

        // THEN: connect fails (refused or timed out), never Ok(None)
        let err = client.lookup_token(&config, "u1").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Connect { .. } | StoreError::Timeout { .. }
        ));
    }
}
