//! Tenant → pool resolution.
//!
//! [`TenantManager`] hands out one shared [`TenantPool`] per tenant, counts
//! its users and parks it in the [`IdleRegistry`] once the last user is
//! done. At any instant a tenant is in the active map, in the idle registry,
//! or in neither; never in both.
//!
//! # Locking
//!
//! - The active map sits behind a `std::sync::RwLock` held only for map
//!   reads/writes, never across an await point
//! - Pool creation runs on its own task inside a per-tenant [`SingleFlight`]
//!   call without any manager lock, so a slow open for one tenant never
//!   blocks lookups for another
//! - Lock order is active map → idle registry

use crate::db::connection::DbConfig;
use crate::db::connector::Connector;
use crate::db::flight::SingleFlight;
use crate::db::idle::{Clock, IdleRegistry, IdleSettings, SweepReport, TokioClock};
use crate::db::pool::{PoolGuard, TenantPool};
use crate::error::DbResult;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

type SharedPool<C> = Arc<TenantPool<<C as Connector>::Handle>>;

pub struct TenantManager<C: Connector> {
    config: DbConfig,
    connector: C,
    active: RwLock<HashMap<String, SharedPool<C>>>,
    idle: Arc<IdleRegistry<C::Handle>>,
    flights: SingleFlight,
}

impl<C: Connector> TenantManager<C> {
    /// Create the manager. Must be called from within a tokio runtime since
    /// the idle registry spawns its sweep task.
    pub fn new(config: DbConfig, settings: IdleSettings, connector: C) -> Arc<Self> {
        Self::with_clock(config, settings, connector, Arc::new(TokioClock))
    }

    /// Create the manager with an explicit clock for idle expiry.
    pub fn with_clock(
        config: DbConfig,
        settings: IdleSettings,
        connector: C,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        info!(
            driver = %config.driver,
            host_rw = %config.host_rw,
            host_ro = ?config.host_ro,
            idle_ttl_secs = settings.ttl.as_secs(),
            "Created tenant pool manager"
        );

        Arc::new(Self {
            config,
            connector,
            active: RwLock::new(HashMap::new()),
            idle: IdleRegistry::new(settings, clock),
            flights: SingleFlight::new(),
        })
    }

    fn read_active(&self) -> RwLockReadGuard<'_, HashMap<String, SharedPool<C>>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_active(&self) -> RwLockWriteGuard<'_, HashMap<String, SharedPool<C>>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the pool for `tenant_id`, opening it if needed.
    ///
    /// Every successful call must be paired with exactly one
    /// [`release`](Self::release); prefer [`acquire`](Self::acquire), which
    /// does that automatically.
    ///
    /// Cancelling the returned future leaves any open already under way to
    /// finish for the callers still waiting on it.
    pub async fn get(self: &Arc<Self>, tenant_id: &str) -> DbResult<SharedPool<C>> {
        loop {
            if let Some(pool) = self.checkout_active(tenant_id) {
                return Ok(pool);
            }
            if let Some(pool) = self.checkout_idle(tenant_id) {
                return Ok(pool);
            }

            // Concurrent misses for the same tenant share one open. The new
            // pool is parked, so if every caller has gone away by the time
            // it is ready it simply expires like any other idle pool.
            let manager = Arc::clone(self);
            let tenant = tenant_id.to_string();
            self.flights
                .run(tenant_id, move || async move { manager.open_parked(&tenant).await })
                .await?;
        }
    }

    /// Get the pool for `tenant_id` wrapped in a guard that releases it on drop.
    pub async fn acquire(self: &Arc<Self>, tenant_id: &str) -> DbResult<PoolGuard<C>> {
        let pool = self.get(tenant_id).await?;
        Ok(PoolGuard::new(pool, Arc::clone(self)))
    }

    /// Hand a pool obtained from [`get`](Self::get) back to the manager.
    ///
    /// When no one else is using it, the pool moves from the active map into
    /// the idle registry.
    pub fn release(&self, pool: &SharedPool<C>) {
        pool.mark_released();

        let mut active = self.write_active();
        if pool.is_in_use() {
            return;
        }

        let tenant_id = pool.tenant_id();
        let is_current = active
            .get(tenant_id)
            .is_some_and(|current| Arc::ptr_eq(current, pool));
        if !is_current {
            // Another releaser already parked it
            return;
        }

        if self.idle.contains(tenant_id) {
            invariant_violation(tenant_id, "tenant is both active and idle");
        }

        active.remove(tenant_id);
        self.idle.put(Arc::clone(pool));
        debug!(tenant_id = %tenant_id, "Released pool to idle registry");
    }

    /// Bump the usage count of an active pool and return it.
    fn checkout_active(&self, tenant_id: &str) -> Option<SharedPool<C>> {
        let active = self.read_active();
        let pool = active.get(tenant_id)?;
        pool.mark_in_use();
        Some(Arc::clone(pool))
    }

    /// Move the tenant's idle pool into the active map and bump its usage.
    ///
    /// Also covers a racing caller that activated the pool between our read
    /// and write lock.
    fn checkout_idle(&self, tenant_id: &str) -> Option<SharedPool<C>> {
        let mut active = self.write_active();
        if let Some(pool) = active.get(tenant_id) {
            pool.mark_in_use();
            return Some(Arc::clone(pool));
        }

        let pool = self.idle.take(tenant_id)?;
        debug!(tenant_id = %tenant_id, "Reusing idle pool");
        pool.mark_in_use();
        active.insert(tenant_id.to_string(), Arc::clone(&pool));
        Some(pool)
    }

    /// Open a pool for `tenant_id` and park it in the idle registry.
    async fn open_parked(&self, tenant_id: &str) -> DbResult<()> {
        // A previous flight may have finished between our miss and now
        if self.is_active(tenant_id) || self.is_idle(tenant_id) {
            return Ok(());
        }

        let pool = Arc::new(TenantPool::open(tenant_id, &self.config, &self.connector).await?);

        let active = self.write_active();
        if active.contains_key(tenant_id) || self.idle.contains(tenant_id) {
            invariant_violation(tenant_id, "tenant opened twice");
        }
        self.idle.put(pool);
        drop(active);
        Ok(())
    }

    /// Run one idle sweep now instead of waiting for the background task.
    pub async fn sweep_idle(&self) -> SweepReport {
        self.idle.sweep().await
    }

    /// Stop the sweep task and close every idle pool.
    ///
    /// Pools still in use are left alone and reported.
    pub async fn shutdown(&self) -> SweepReport {
        let still_active: Vec<(String, usize)> = self
            .read_active()
            .iter()
            .map(|(tenant_id, pool)| (tenant_id.clone(), pool.usage_count()))
            .collect();
        for (tenant_id, usage_count) in still_active {
            warn!(
                tenant_id = %tenant_id,
                usage_count = usage_count,
                "Pool still in use at shutdown, not closing"
            );
        }

        self.idle.shutdown().await
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// The idle registry backing this manager.
    pub fn idle(&self) -> &IdleRegistry<C::Handle> {
        &self.idle
    }

    pub fn is_active(&self, tenant_id: &str) -> bool {
        self.read_active().contains_key(tenant_id)
    }

    pub fn is_idle(&self, tenant_id: &str) -> bool {
        self.idle.contains(tenant_id)
    }

    /// The active pool of a tenant, without touching its usage count.
    pub fn active_pool(&self, tenant_id: &str) -> Option<SharedPool<C>> {
        self.read_active().get(tenant_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.read_active().len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }
}

impl<C: Connector> std::fmt::Debug for TenantManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantManager")
            .field("driver", &self.config.driver)
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .finish_non_exhaustive()
    }
}

/// Abort on corrupted bookkeeping; carrying on would hand out closed or
/// duplicate pools.
fn invariant_violation(tenant_id: &str, what: &str) -> ! {
    error!(tenant_id = %tenant_id, "Invariant violation: {}", what);
    panic!("invariant violation for tenant '{}': {}", tenant_id, what);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::DatabaseType;
    use crate::db::connector::SqlxConnector;
    use std::time::Duration;

    fn test_settings() -> IdleSettings {
        IdleSettings {
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(3600),
            sweep_jitter: Duration::ZERO,
        }
    }

    fn test_manager() -> Arc<TenantManager<SqlxConnector>> {
        TenantManager::new(
            DbConfig::new(DatabaseType::MySQL, "user", "password", "127.0.0.1"),
            test_settings(),
            SqlxConnector::default(),
        )
    }

    #[tokio::test]
    async fn test_new_manager_is_empty() {
        let manager = test_manager();
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.idle_count(), 0);
        assert_eq!(manager.idle().ttl(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_get_registers_active_pool() {
        let manager = test_manager();
        let pool = manager.get("demoa").await.unwrap();
        assert_eq!(pool.tenant_id(), "demoa");
        assert!(manager.is_active("demoa"));

        let registered = manager.active_pool("demoa").unwrap();
        assert!(Arc::ptr_eq(&registered, &pool));
        assert!(pool.is_in_use());
        assert_eq!(pool.usage_count(), 1);
    }

    #[tokio::test]
    async fn test_release_moves_pool_to_idle() {
        let manager = test_manager();
        let pool = manager.get("demoa").await.unwrap();

        manager.release(&pool);
        assert!(!pool.is_in_use());
        assert!(!manager.is_active("demoa"));
        assert!(manager.is_idle("demoa"));
    }

    #[tokio::test]
    async fn test_nested_get_keeps_pool_active() {
        let manager = test_manager();
        let first = manager.get("demoa").await.unwrap();
        let second = manager.get("demoa").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.usage_count(), 2);

        manager.release(&second);
        assert!(manager.is_active("demoa"));
        assert!(!manager.is_idle("demoa"));

        manager.release(&first);
        assert!(manager.is_idle("demoa"));
    }

    #[tokio::test]
    async fn test_get_reuses_idle_pool() {
        let manager = test_manager();
        let pool = manager.get("demoa").await.unwrap();
        manager.release(&pool);

        let again = manager.get("demoa").await.unwrap();
        assert!(Arc::ptr_eq(&pool, &again));
        assert!(manager.is_active("demoa"));
        assert!(!manager.is_idle("demoa"));
    }

    #[tokio::test]
    async fn test_acquire_guard_releases_on_drop() {
        let manager = test_manager();
        {
            let guard = manager.acquire("demoa").await.unwrap();
            assert_eq!(guard.tenant_id(), "demoa");
            assert!(manager.is_active("demoa"));
        }
        assert!(!manager.is_active("demoa"));
        assert!(manager.is_idle("demoa"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_pools() {
        let manager = test_manager();
        let pool = manager.get("demoa").await.unwrap();
        manager.release(&pool);

        let report = manager.shutdown().await;
        assert_eq!(report.closed, 1);
        assert!(pool.is_closed());
        assert_eq!(manager.idle_count(), 0);
    }
}
