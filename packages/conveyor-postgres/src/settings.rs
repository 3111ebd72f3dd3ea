//! Connection settings loaded from environment variables.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;

#[derive(Debug, Clone)]
pub struct PgSettings {
    pub database_url: String,
    pub max_connections: u32,
}

impl PgSettings {
    /// Load settings from environment variables (`.env` honored in
    /// development).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env::var("CONVEYOR_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("CONVEYOR_MAX_CONNECTIONS must be a valid number")?,
        })
    }

    /// Open a connection pool.
    pub async fn connect(&self) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .context("failed to connect to database")
    }
}

/// Apply this crate's migrations (`jobs`, `queue_messages`).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run migrations")
}
