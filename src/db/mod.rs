//! Per-tenant database pools.
//!
//! This module provides:
//! - Connection parameters and DSN construction
//! - The seam to the sqlx pool primitive
//! - Reference-counted tenant pools
//! - The idle registry with its TTL sweep
//! - The tenant manager that ties them together

pub mod connection;
pub mod connector;
pub mod flight;
pub mod idle;
pub mod manager;
pub mod pool;

pub use connection::{DatabaseType, DbConfig};
pub use connector::{Connector, DbPool, PoolHandle, SqlxConnector};
pub use flight::SingleFlight;
pub use idle::{Clock, IdleRegistry, IdleSettings, ManualClock, SweepReport, TokioClock};
pub use manager::TenantManager;
pub use pool::{CONN_MAX_LIFETIME, PoolGuard, TenantPool};
