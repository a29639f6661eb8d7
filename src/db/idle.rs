//! Registry of tenant pools that nobody is using.
//!
//! Released pools wait here for `ttl`. A request for the same tenant within
//! that window takes the pool back without reopening it; otherwise the
//! background sweep closes it.
//!
//! # Ordering
//!
//! Entries are owned by a `HashMap` keyed by tenant ID. A `BTreeMap` keyed by
//! `(expire_at, seq)` orders them oldest first, so the sweep can stop at the
//! first entry that has not expired yet. Refreshing an entry updates the
//! owned record and moves its ordering key to the newest position.
//!
//! # Concurrency
//!
//! - One `std::sync::Mutex` guards both indices; it is never held across an
//!   await point
//! - Expired pools are unlinked under the lock and closed after it is
//!   released, so driver I/O never blocks `take`/`put` for other tenants
//! - The sweep task holds a `Weak` reference and stops when the registry is
//!   dropped or its `CancellationToken` fires

use crate::config::{
    DEFAULT_IDLE_TTL_SECS, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_SWEEP_JITTER_SECS,
};
use crate::db::connector::PoolHandle;
use crate::db::pool::TenantPool;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of the current time for expiry decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Clock backed by tokio's time driver (pausable in tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Timing for the idle registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSettings {
    /// How long an unused pool is kept before the sweep closes it.
    pub ttl: Duration,
    /// Base pause between sweeps.
    pub sweep_interval: Duration,
    /// Upper bound (exclusive) of the random delay added to every pause.
    pub sweep_jitter: Duration,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            sweep_jitter: Duration::from_secs(DEFAULT_SWEEP_JITTER_SECS),
        }
    }
}

/// Outcome of one sweep or shutdown pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pools removed and closed successfully.
    pub closed: usize,
    /// Pools removed whose close returned an error. They are not retried.
    pub failed: usize,
    /// Entries left in the registry afterwards.
    pub remaining: usize,
}

struct IdleEntry<H> {
    pool: Arc<TenantPool<H>>,
    expire_at: Instant,
    seq: u64,
}

struct IdleState<H> {
    entries: HashMap<String, IdleEntry<H>>,
    /// Oldest first. Values are keys into `entries`.
    order: BTreeMap<(Instant, u64), String>,
    next_seq: u64,
    ttl: Duration,
}

pub struct IdleRegistry<H> {
    state: Mutex<IdleState<H>>,
    sweep_interval: Duration,
    sweep_jitter: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    /// Sweep task handle. Uses std::sync::Mutex for synchronous storage.
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<H: PoolHandle> IdleRegistry<H> {
    /// Create a registry and spawn its sweep task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: IdleSettings, clock: Arc<dyn Clock>) -> Arc<Self> {
        let registry = Arc::new(Self {
            state: Mutex::new(IdleState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                ttl: settings.ttl,
            }),
            sweep_interval: settings.sweep_interval,
            sweep_jitter: settings.sweep_jitter,
            clock,
            cancel: CancellationToken::new(),
            sweep_handle: Mutex::new(None),
        });

        // Weak reference so the task does not keep the registry alive
        let weak = Arc::downgrade(&registry);
        let cancel = registry.cancel.clone();
        let handle = tokio::spawn(Self::sweep_task(weak, cancel));

        *registry
            .sweep_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        registry
    }

    fn lock_state(&self) -> MutexGuard<'_, IdleState<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the tenant currently has an idle pool.
    pub fn contains(&self, tenant_id: &str) -> bool {
        self.lock_state().entries.contains_key(tenant_id)
    }

    /// Remove and return the idle pool of `tenant_id`, if any.
    pub fn take(&self, tenant_id: &str) -> Option<Arc<TenantPool<H>>> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let entry = state.entries.remove(tenant_id)?;
        state.order.remove(&(entry.expire_at, entry.seq));
        debug!(tenant_id = %tenant_id, "Took pool from idle registry");
        Some(entry.pool)
    }

    /// Park an unused pool until `now + ttl`.
    ///
    /// # Panics
    ///
    /// Panics if a different pool is already parked for the same tenant.
    pub fn put(&self, pool: Arc<TenantPool<H>>) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let expire_at = self.clock.now() + state.ttl;
        let seq = state.next_seq;
        state.next_seq += 1;
        let tenant_id = pool.tenant_id().to_string();

        match state.entries.get_mut(&tenant_id) {
            Some(entry) => {
                assert!(
                    Arc::ptr_eq(&entry.pool, &pool),
                    "two pools parked for tenant '{}'",
                    tenant_id
                );
                state.order.remove(&(entry.expire_at, entry.seq));
                entry.expire_at = expire_at;
                entry.seq = seq;
                state.order.insert((expire_at, seq), tenant_id.clone());
                debug!(tenant_id = %tenant_id, "Refreshed idle pool expiry");
            }
            None => {
                state.order.insert((expire_at, seq), tenant_id.clone());
                state.entries.insert(
                    tenant_id.clone(),
                    IdleEntry {
                        pool,
                        expire_at,
                        seq,
                    },
                );
                debug!(tenant_id = %tenant_id, "Parked pool in idle registry");
            }
        }
    }

    /// Number of idle pools.
    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.lock_state().ttl
    }

    /// Change the TTL applied to pools parked from now on.
    pub fn set_ttl(&self, ttl: Duration) {
        self.lock_state().ttl = ttl;
    }

    /// Expiry deadline of a tenant's idle pool.
    pub fn expires_at(&self, tenant_id: &str) -> Option<Instant> {
        self.lock_state()
            .entries
            .get(tenant_id)
            .map(|entry| entry.expire_at)
    }

    /// Tenant IDs from the oldest to the newest entry.
    pub fn tenants_by_age(&self) -> Vec<String> {
        self.lock_state().order.values().cloned().collect()
    }

    /// Pause before the next sweep: interval plus a random jitter.
    ///
    /// Saturates at `Duration::MAX`.
    pub fn sleep_time(&self) -> Duration {
        let jitter_ms = u64::try_from(self.sweep_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.sweep_interval
            .saturating_add(Duration::from_millis(jitter))
    }

    /// Close and forget every pool whose expiry has passed.
    ///
    /// Stops at the first entry that is still live; everything after it in
    /// the ordering expires later.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let (expired, remaining) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let mut expired = Vec::new();

            while let Some(first) = state.order.first_entry() {
                if first.key().0 > now {
                    break;
                }
                let tenant_id = first.remove();
                if let Some(entry) = state.entries.remove(&tenant_id) {
                    expired.push(entry.pool);
                }
            }
            (expired, state.entries.len())
        }; // Lock released here

        let mut report = Self::close_all(expired).await;
        report.remaining = remaining;

        if report.closed > 0 || report.failed > 0 {
            info!(
                closed = report.closed,
                failed = report.failed,
                remaining = report.remaining,
                "Idle sweep finished"
            );
        }
        report
    }

    /// Stop the sweep task and close every idle pool.
    pub async fn shutdown(&self) -> SweepReport {
        self.cancel.cancel();

        let handle = self
            .sweep_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Idle sweep task ended abnormally");
            }
        }

        let drained: Vec<_> = {
            let mut state = self.lock_state();
            state.order.clear();
            state.entries.drain().map(|(_, entry)| entry.pool).collect()
        };

        let report = Self::close_all(drained).await;
        info!(
            closed = report.closed,
            failed = report.failed,
            "Idle registry shut down"
        );
        report
    }

    /// Whether the sweep task has been asked to stop.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn close_all(pools: Vec<Arc<TenantPool<H>>>) -> SweepReport {
        let mut report = SweepReport::default();
        for pool in pools {
            match pool.close().await {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    // Abandoned rather than retried
                    warn!(
                        tenant_id = %pool.tenant_id(),
                        error = %e,
                        "Failed to close idle pool"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn sweep_task(weak: Weak<Self>, cancel: CancellationToken) {
        loop {
            let Some(sleep) = weak.upgrade().map(|registry| registry.sleep_time()) else {
                return;
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = cancel.cancelled() => {
                    debug!("Idle sweep task cancelled");
                    return;
                }
            }

            // Exit if the registry was dropped while sleeping
            let Some(registry) = weak.upgrade() else {
                debug!("Idle registry dropped, sweep task exiting");
                return;
            };
            registry.sweep().await;
        }
    }
}

impl<H> Drop for IdleRegistry<H> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<H> std::fmt::Debug for IdleRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleRegistry")
            .field("sweep_interval", &self.sweep_interval)
            .field("sweep_jitter", &self.sweep_jitter)
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
