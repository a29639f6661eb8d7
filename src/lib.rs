//! Tenant Pool Library
//!
//! Lazily opened, reference-counted database pools keyed by tenant, with
//! idle pools closed after a TTL.

pub mod config;
pub mod db;
pub mod error;
pub mod transport;

pub use config::Config;
pub use db::TenantManager;
pub use error::{DbError, DbResult};
