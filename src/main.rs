//! Tenant Pool Server - Main entry point.
//!
//! Serves per-tenant HTTP routes backed by one lazily opened database pool
//! per tenant.

use clap::Parser;
use tenant_pool::config::Config;
use tenant_pool::db::{SqlxConnector, TenantManager};
use tenant_pool::transport::{HttpTransport, Transport};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    init_tracing(&config);

    info!(
        listen = %config.listen,
        "Starting Tenant Pool Server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db_config = config.db_config()?;
    let idle_settings = config.idle_settings()?;
    let connector = SqlxConnector::new(config.pool_options()?);

    let manager = TenantManager::new(db_config, idle_settings, connector);

    let transport = HttpTransport::new(manager, &config.listen);
    info!(transport = transport.name(), "Using HTTP transport");

    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
