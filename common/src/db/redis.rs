// Redis connection manager for the runner lock

use crate::config::RedisConfig;
use crate::errors::LockError;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, instrument};

/// Redis connection pool wrapper
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    /// Connect and build the shared connection manager
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, LockError> {
        info!("Initializing Redis connection pool");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            LockError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            LockError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection pool initialized successfully");

        Ok(Self { manager })
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Verify the Redis connection answers PING
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), LockError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(LockError::Backend(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}
