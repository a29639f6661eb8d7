//! Connection parameters shared by every tenant pool.
//!
//! A single [`DbConfig`] describes one logical database server. Each tenant
//! lives in its own database on that server, so the tenant ID becomes the
//! database name in the DSN.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// Includes MariaDB
    MySQL,
    PostgreSQL,
}

impl DatabaseType {
    /// URL scheme used when handing a DSN to sqlx.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::MySQL => "mysql",
            Self::PostgreSQL => "postgres",
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySQL => "MySQL",
            Self::PostgreSQL => "PostgreSQL",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for DatabaseType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySQL),
            "postgres" | "postgresql" | "pgx" => Ok(Self::PostgreSQL),
            other => Err(DbError::invalid_input(format!(
                "Unknown database driver '{}'. Supported: mysql, postgres",
                other
            ))),
        }
    }
}

/// Connection parameters for one database server.
///
/// Immutable once built and shared read-only by every pool the manager opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub driver: DatabaseType,
    pub user: String,
    pub pass: String,
    /// Address of the read-write server: `host[:port]`, `tcp(host[:port])`
    /// or `unix(/path/to/socket)`
    pub host_rw: String,
    /// Optional read-only replica. `None` means no replica.
    pub host_ro: Option<String>,
}

impl DbConfig {
    /// Create a config without a replica.
    pub fn new(
        driver: DatabaseType,
        user: impl Into<String>,
        pass: impl Into<String>,
        host_rw: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            user: user.into(),
            pass: pass.into(),
            host_rw: host_rw.into(),
            host_ro: None,
        }
    }

    /// Set the replica host. Empty strings are treated as "no replica".
    pub fn with_replica(mut self, host_ro: impl Into<String>) -> Self {
        let host_ro = host_ro.into();
        self.host_ro = (!host_ro.is_empty()).then_some(host_ro);
        self
    }

    /// Whether a read-only replica is configured.
    pub fn has_replica(&self) -> bool {
        self.host_ro.is_some()
    }

    /// Host for the read-write (`true`) or read-only (`false`) side.
    pub fn host(&self, rw: bool) -> &str {
        if rw {
            &self.host_rw
        } else {
            self.host_ro.as_deref().unwrap_or_default()
        }
    }

    /// Build the DSN for a tenant database: `user:pass@host/tenant_id`.
    pub fn dsn(&self, tenant_id: &str, rw: bool) -> String {
        format!("{}:{}@{}/{}", self.user, self.pass, self.host(rw), tenant_id)
    }

    /// Validate the config and return an error if unusable.
    pub fn validate(&self) -> DbResult<()> {
        if self.host_rw.trim().is_empty() {
            return Err(DbError::invalid_input(
                "Read-write host must not be empty",
            ));
        }
        Ok(())
    }
}
