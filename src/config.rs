//! Configuration handling for the tenant pool server.
//!
//! Every setting comes from a CLI flag or its environment variable.

use crate::db::connection::{DatabaseType, DbConfig};
use crate::db::idle::IdleSettings;
use crate::error::{DbError, DbResult};
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_DRIVER: &str = "mysql";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5000";
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Idle registry defaults
pub const DEFAULT_IDLE_TTL_SECS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 45;
pub const DEFAULT_SWEEP_JITTER_SECS: u64 = 30;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Largest accepted idle TTL. Keeps `now + ttl` far from `Instant` overflow.
pub const MAX_IDLE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
/// Largest accepted sweep interval and sweep jitter, each.
pub const MAX_SWEEP_SECS: u64 = 24 * 60 * 60;

/// Options applied to every sqlx pool the connector registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections per pool (default: 10)
    pub max_connections: Option<u32>,
    /// Idle timeout of a single connection in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.acquire_timeout_secs == Some(0) {
            return Err("acquire_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Configuration for the tenant pool server.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tenant-pool",
    about = "Per-tenant database pool manager with idle expiry",
    version,
    author
)]
pub struct Config {
    /// Database driver (mysql or postgres)
    #[arg(long, default_value = DEFAULT_DRIVER, env = "DB_DRIVER")]
    pub driver: String,

    /// Database user shared by every tenant
    #[arg(long, default_value = "", env = "DB_USER")]
    pub db_user: String,

    /// Database password shared by every tenant
    #[arg(long, default_value = "", env = "DB_PASS", hide_env_values = true)]
    pub db_pass: String,

    /// Read-write database address: host[:port], tcp(host[:port]) or unix(/path)
    #[arg(long, env = "DB_HOST_RW")]
    pub host_rw: String,

    /// Read-only replica address, same forms as --host-rw. Empty means no replica.
    #[arg(long, env = "DB_HOST_RO")]
    pub host_ro: Option<String>,

    /// HTTP address to listen on
    #[arg(
        short,
        long,
        default_value = DEFAULT_LISTEN_ADDR,
        env = "HOST_ADDR"
    )]
    pub listen: String,

    /// Seconds an unused tenant pool is kept before it is closed
    #[arg(
        long,
        default_value_t = DEFAULT_IDLE_TTL_SECS,
        env = "PX_IDLE_TTL"
    )]
    pub idle_ttl: u64,

    /// Base seconds between idle sweeps
    #[arg(
        long,
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        env = "PX_SWEEP_INTERVAL"
    )]
    pub sweep_interval: u64,

    /// Upper bound in seconds of the random delay added to every sweep pause
    #[arg(
        long,
        default_value_t = DEFAULT_SWEEP_JITTER_SECS,
        env = "PX_SWEEP_JITTER"
    )]
    pub sweep_jitter: u64,

    /// Maximum connections per tenant pool
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_CONNECTIONS,
        env = "PX_MAX_CONNECTIONS"
    )]
    pub max_connections: u32,

    /// Connection acquire timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS,
        env = "PX_ACQUIRE_TIMEOUT"
    )]
    pub acquire_timeout: u64,

    /// Seconds an unused connection stays open inside a tenant pool
    #[arg(
        long,
        default_value_t = DEFAULT_IDLE_TIMEOUT_SECS,
        env = "PX_CONN_IDLE_TIMEOUT"
    )]
    pub conn_idle_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "PX_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "PX_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            driver: DEFAULT_DRIVER.to_string(),
            db_user: String::new(),
            db_pass: String::new(),
            host_rw: "127.0.0.1".to_string(),
            host_ro: None,
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            idle_ttl: DEFAULT_IDLE_TTL_SECS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL_SECS,
            sweep_jitter: DEFAULT_SWEEP_JITTER_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            conn_idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            json_logs: false,
        }
    }

    /// Build the tenant database settings.
    pub fn db_config(&self) -> DbResult<DbConfig> {
        let driver: DatabaseType = self.driver.parse()?;
        let mut config = DbConfig::new(driver, &self.db_user, &self.db_pass, &self.host_rw);
        if let Some(host_ro) = &self.host_ro {
            config = config.with_replica(host_ro);
        }
        config.validate()?;
        Ok(config)
    }

    /// Build the idle registry timing.
    pub fn idle_settings(&self) -> DbResult<IdleSettings> {
        if self.idle_ttl > MAX_IDLE_TTL_SECS {
            return Err(DbError::invalid_input(format!(
                "idle TTL of {}s exceeds the maximum of {}s",
                self.idle_ttl, MAX_IDLE_TTL_SECS
            )));
        }
        if self.sweep_interval == 0 {
            return Err(DbError::invalid_input(
                "sweep interval must be greater than 0",
            ));
        }
        for (name, secs) in [
            ("sweep interval", self.sweep_interval),
            ("sweep jitter", self.sweep_jitter),
        ] {
            if secs > MAX_SWEEP_SECS {
                return Err(DbError::invalid_input(format!(
                    "{} of {}s exceeds the maximum of {}s",
                    name, secs, MAX_SWEEP_SECS
                )));
            }
        }

        Ok(IdleSettings {
            ttl: Duration::from_secs(self.idle_ttl),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            sweep_jitter: Duration::from_secs(self.sweep_jitter),
        })
    }

    /// Build the options for every sqlx pool.
    pub fn pool_options(&self) -> DbResult<PoolOptions> {
        let options = PoolOptions {
            max_connections: Some(self.max_connections),
            idle_timeout_secs: Some(self.conn_idle_timeout),
            acquire_timeout_secs: Some(self.acquire_timeout),
        };
        options.validate().map_err(DbError::invalid_input)?;
        Ok(options)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
