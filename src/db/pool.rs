//! Per-tenant connection pools and usage accounting.
//!
//! A [`TenantPool`] owns the read-write handle and the optional read-only
//! replica handle for one tenant database, plus a count of how many callers
//! currently use it. The manager moves pools with a zero count into the idle
//! registry.

use crate::db::connection::DbConfig;
use crate::db::connector::{Connector, PoolHandle};
use crate::db::manager::TenantManager;
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Max lifetime of a single pooled connection. Bounds staleness without
/// explicit health checks.
pub const CONN_MAX_LIFETIME: Duration = Duration::from_secs(3 * 60);

/// Connection handles for one tenant database.
///
/// Shared behind an `Arc`; the usage counter is the only mutable state callers
/// touch, and it is private to the pool so counting never waits on the
/// manager's locks.
pub struct TenantPool<H> {
    tenant_id: String,
    rw: H,
    ro: Option<H>,
    /// Count of callers currently holding this pool.
    usage_count: AtomicUsize,
    closed: AtomicBool,
}

impl<H: PoolHandle> TenantPool<H> {
    /// Open the pools for `tenant_id`.
    ///
    /// When a replica is configured and its pool fails to open, the already
    /// opened read-write pool is closed before the error is returned.
    pub async fn open<C>(tenant_id: &str, config: &DbConfig, connector: &C) -> DbResult<Self>
    where
        C: Connector<Handle = H>,
    {
        let rw = connector
            .open(config.driver, &config.dsn(tenant_id, true), CONN_MAX_LIFETIME)
            .await?;

        let ro = if config.has_replica() {
            match connector
                .open(config.driver, &config.dsn(tenant_id, false), CONN_MAX_LIFETIME)
                .await
            {
                Ok(ro) => Some(ro),
                Err(e) => {
                    if let Err(close_err) = rw.close().await {
                        warn!(
                            tenant_id = %tenant_id,
                            error = %close_err,
                            "Failed to close read-write pool after replica open failure"
                        );
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        info!(
            tenant_id = %tenant_id,
            replica = ro.is_some(),
            "Opened tenant pool"
        );

        Ok(Self::from_handles(tenant_id, rw, ro))
    }

    /// Build a pool from handles that are already open.
    pub fn from_handles(tenant_id: impl Into<String>, rw: H, ro: Option<H>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            rw,
            ro,
            usage_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Close the replica pool, then the read-write pool.
    ///
    /// Only the first call does any work. The first close error is returned
    /// as [`DbError::Close`] after both handles have been attempted.
    pub async fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let ro_result = match &self.ro {
            Some(ro) => ro.close().await,
            None => Ok(()),
        };
        let rw_result = self.rw.close().await;

        info!(tenant_id = %self.tenant_id, "Closed tenant pool");
        ro_result
            .and(rw_result)
            .map_err(|e| DbError::close(&self.tenant_id, e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<H> TenantPool<H> {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Read-write pool. Always present.
    pub fn rw(&self) -> &H {
        &self.rw
    }

    /// Read-only replica pool, if one is configured.
    pub fn ro(&self) -> Option<&H> {
        self.ro.as_ref()
    }

    /// Record one more active user. Call before handing the pool out.
    pub fn mark_in_use(&self) {
        self.usage_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Record that one user is done with the pool.
    ///
    /// # Panics
    ///
    /// Panics when the count is already zero: an extra release means the
    /// manager's bookkeeping is corrupt and continuing would break the
    /// active/idle exclusivity.
    pub fn mark_released(&self) {
        let result = self
            .usage_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });

        if result.is_err() {
            error!(
                tenant_id = %self.tenant_id,
                "Usage count underflow - release without matching get"
            );
            panic!(
                "usage count underflow for tenant '{}': release without matching get",
                self.tenant_id
            );
        }
    }

    /// Whether anybody is using this pool right now.
    pub fn is_in_use(&self) -> bool {
        self.usage_count() > 0
    }

    pub fn usage_count(&self) -> usize {
        self.usage_count.load(Ordering::Acquire)
    }
}

impl<H: std::fmt::Debug> std::fmt::Debug for TenantPool<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPool")
            .field("tenant_id", &self.tenant_id)
            .field("rw", &self.rw)
            .field("ro", &self.ro)
            .field("usage_count", &self.usage_count.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII guard for tenant pool usage.
///
/// Releases the pool back to the manager when dropped, so an error return or
/// a panic while handling a request can never leak a usage count.
///
/// # Usage
///
/// ```ignore
/// let guard = manager.acquire("demoa").await?;
/// let rw = guard.rw();
/// // ... run the request ...
/// guard.release(); // or just let it drop
/// ```
pub struct PoolGuard<C: Connector> {
    pool: Arc<TenantPool<C::Handle>>,
    manager: Arc<TenantManager<C>>,
    released: bool,
}

impl<C: Connector> std::fmt::Debug for PoolGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("pool", &self.pool)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PoolGuard<C> {
    pub(crate) fn new(pool: Arc<TenantPool<C::Handle>>, manager: Arc<TenantManager<C>>) -> Self {
        Self {
            pool,
            manager,
            released: false,
        }
    }

    /// Get a reference to the shared pool.
    pub fn pool(&self) -> &Arc<TenantPool<C::Handle>> {
        &self.pool
    }

    /// Release the pool now instead of at the end of scope.
    pub fn release(mut self) {
        self.released = true;
        self.manager.release(&self.pool);
    }
}

impl<C: Connector> std::ops::Deref for PoolGuard<C> {
    type Target = TenantPool<C::Handle>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl<C: Connector> Drop for PoolGuard<C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.manager.release(&self.pool);
    }
}
