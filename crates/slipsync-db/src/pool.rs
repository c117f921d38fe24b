//! Database connection pool management for Slipsync
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Date: 2025-01-20
//! Version: 0.1.0
//!
//! This module provides database connection pool functionality for the
//! Slipsync system.

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info, instrument};

use slipsync_core::config::DatabaseConfig;
use slipsync_core::{Result, SlipsyncError};

/// Database connection pool with metrics
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Create a new database connection pool
    #[instrument(level = "debug")]
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        debug!("🔧 Creating database connection pool");
        let start = Instant::now();

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout))
            .min_connections(config.min_idle.unwrap_or(0))
            .max_lifetime(config.max_lifetime.map(Duration::from_secs))
            .connect(&config.url)
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))?;

        histogram!("db.pool.create.time", start.elapsed());
        info!(
            "✅ Created database connection pool with {} max connections",
            config.max_connections
        );

        Ok(Self { pool })
    }

    /// Get the inner SQLx pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get a connection from the pool
    #[instrument(level = "debug")]
    pub async fn get_conn(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        let start = Instant::now();
        counter!("db.pool.connections.checked_out", 1);

        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))?;

        histogram!("db.pool.acquire.time", start.elapsed());
        Ok(conn)
    }
}

/// Create a raw SQLx connection pool (without metrics)
#[instrument(level = "debug")]
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    debug!("🔧 Creating database connection pool");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout))
        .min_connections(config.min_idle.unwrap_or(0))
        .max_lifetime(config.max_lifetime.map(Duration::from_secs))
        .connect(&config.url)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;

    info!(
        "✅ Created database connection pool with {} max connections",
        config.max_connections
    );
    Ok(pool)
}

/// Check if the database connection pool is healthy
#[instrument(level = "debug")]
pub async fn check_pool_health(pool: &PgPool) -> Result<bool> {
    debug!("🔧 Checking database connection pool health");

    let result = sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;

    let is_healthy = result.get::<i32, _>(0) == 1;
    debug!("✅ Database connection pool health check: {}", is_healthy);

    Ok(is_healthy)
}
