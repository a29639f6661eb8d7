//! Transport layer for the tenant pool server.
//!
//! - HTTP: per-tenant routes served with axum

pub mod http;

pub use http::{AppState, HttpTransport, build_router, is_valid_tenant_id};

use crate::error::DbResult;
use std::future::Future;

/// Trait for server transports.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling requests.
    ///
    /// This method should block until the transport is shut down.
    fn run(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
