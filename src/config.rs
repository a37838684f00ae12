//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::outbox::DEFAULT_SWEEP_BATCH_SIZE;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Distinct aggregates drained per sweep pass
    pub outbox_batch_size: usize,

    /// Pause between background sweeps
    pub outbox_sweep_interval: Duration,

    /// Environment (development, production)
    pub environment: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = lookup("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DATABASE_MAX_CONNECTIONS"))?;

        let outbox_batch_size: usize = lookup("OUTBOX_BATCH_SIZE")
            .unwrap_or_else(|| DEFAULT_SWEEP_BATCH_SIZE.to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("OUTBOX_BATCH_SIZE"))?;
        if outbox_batch_size == 0 {
            return Err(ConfigError::InvalidValue("OUTBOX_BATCH_SIZE"));
        }

        let outbox_sweep_interval = lookup("OUTBOX_SWEEP_INTERVAL_MS")
            .unwrap_or_else(|| "5000".to_string())
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue("OUTBOX_SWEEP_INTERVAL_MS"))?;

        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string());

        Ok(Self {
            database_url,
            database_max_connections,
            outbox_batch_size,
            outbox_sweep_interval,
            environment,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
