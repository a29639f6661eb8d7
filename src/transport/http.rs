//! HTTP front end for tenant requests.
//!
//! Every route is scoped by a tenant ID in the first path segment. Handlers
//! acquire that tenant's pool from the [`TenantManager`] for the duration of
//! the request.

use crate::db::connector::Connector;
use crate::db::manager::TenantManager;
use crate::error::{DbError, DbResult};
use crate::transport::Transport;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Shared state handed to every handler.
pub struct AppState<C: Connector> {
    pub manager: Arc<TenantManager<C>>,
}

impl<C: Connector> AppState<C> {
    pub fn new(manager: Arc<TenantManager<C>>) -> Self {
        Self { manager }
    }
}

// Derive would require `C: Clone`
impl<C: Connector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

/// Build the router serving every tenant endpoint.
pub fn build_router<C: Connector>(state: AppState<C>) -> Router {
    Router::new()
        .route("/{tenant}/hello", get(hello::<C>))
        .with_state(state)
}

/// Tenant IDs are lowercase letters optionally followed by digits.
pub fn is_valid_tenant_id(tenant_id: &str) -> bool {
    let digits_from = tenant_id
        .find(|c: char| !c.is_ascii_lowercase())
        .unwrap_or(tenant_id.len());
    let (letters, digits) = tenant_id.split_at(digits_from);
    !letters.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

async fn hello<C: Connector>(
    State(state): State<AppState<C>>,
    Path(tenant_id): Path<String>,
) -> Response {
    let span = info_span!(
        "request",
        request_id = %Uuid::new_v4(),
        tenant_id = %tenant_id
    );

    async move {
        if !is_valid_tenant_id(&tenant_id) {
            warn!("Rejected invalid tenant ID");
            return error_response(
                StatusCode::BAD_REQUEST,
                &DbError::invalid_input(format!("Invalid tenant ID '{}'", tenant_id)),
            );
        }

        let guard = match state.manager.acquire(&tenant_id).await {
            Ok(guard) => guard,
            Err(e) => {
                error!(error = %e, "Failed to acquire tenant pool");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e);
            }
        };

        debug!(usage_count = guard.usage_count(), "Serving request");
        format!("Hello! AppID = {}", guard.tenant_id()).into_response()
    }
    .instrument(span)
    .await
}

fn error_response(status: StatusCode, err: &DbError) -> Response {
    #[derive(Serialize)]
    struct ErrorResponse<'a> {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<&'a str>,
    }

    let body = ErrorResponse {
        error: err.to_string(),
        suggestion: err.suggestion(),
    };
    let json = serde_json::to_string(&body)
        .unwrap_or_else(|_| r#"{"error":"Internal error"}"#.to_string());

    (status, [(header::CONTENT_TYPE, "application/json")], json).into_response()
}

/// HTTP transport serving the tenant router.
pub struct HttpTransport<C: Connector> {
    manager: Arc<TenantManager<C>>,
    /// Address to bind to, `host:port`
    listen: String,
}

impl<C: Connector> HttpTransport<C> {
    pub fn new(manager: Arc<TenantManager<C>>, listen: impl Into<String>) -> Self {
        Self {
            manager,
            listen: listen.into(),
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> &str {
        &self.listen
    }
}

impl<C: Connector> Transport for HttpTransport<C> {
    async fn run(&self) -> DbResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting tenant pool server on {}", bind_addr);

        let app = build_router(AppState::new(Arc::clone(&self.manager)));

        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            DbError::connection(
                format!("Failed to bind to {}: {}", bind_addr, e),
                "Check that the port is available",
            )
        })?;

        // Keep-alive connections may hold the server open, so force exit
        // after a timeout once the shutdown signal is received
        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();

        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        // Race between: server completing normally vs forced timeout/second signal after shutdown
        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        return Err(DbError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for connections to close (send signal again to force exit)..."
                );

                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        info!("Closing tenant pools");
        let report = self.manager.shutdown().await;
        info!(
            closed = report.closed,
            failed = report.failed,
            still_active = self.manager.active_count(),
            "Tenant pools closed"
        );

        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::{DatabaseType, DbConfig};
    use crate::db::connector::SqlxConnector;
    use crate::db::idle::IdleSettings;

    #[test]
    fn test_valid_tenant_ids() {
        for id in ["demoa", "a", "tenant1", "abc123", "z0"] {
            assert!(is_valid_tenant_id(id), "should accept '{}'", id);
        }
    }

    #[test]
    fn test_invalid_tenant_ids() {
        for id in ["", "1abc", "Demo", "demo-a", "a1b", "demo_1", "ab 1", "ümlaut"] {
            assert!(!is_valid_tenant_id(id), "should reject '{}'", id);
        }
    }

    #[test]
    fn test_error_response_body() {
        let err = DbError::connection("refused", "Check the host");
        let response = error_response(StatusCode::INTERNAL_SERVER_ERROR, &err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_http_transport_creation() {
        let manager = TenantManager::new(
            DbConfig::new(DatabaseType::MySQL, "user", "password", "127.0.0.1"),
            IdleSettings::default(),
            SqlxConnector::default(),
        );
        let transport = HttpTransport::new(manager, "127.0.0.1:5000");
        assert_eq!(transport.name(), "http");
        assert_eq!(transport.bind_addr(), "127.0.0.1:5000");
    }
}
