//! Shared helpers for integration tests.
//!
//! [`FakeConnector`] stands in for sqlx: it records every DSN it is asked to
//! open and can be told to fail or to take a while.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tenant_pool::db::{
    Connector, DatabaseType, DbConfig, IdleSettings, ManualClock, PoolHandle, TenantManager,
};
use tenant_pool::error::{DbError, DbResult};

#[derive(Debug)]
pub struct FakeHandle {
    pub dsn: String,
    closed: AtomicBool,
    fail_close: bool,
}

impl FakeHandle {
    pub fn new(dsn: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            closed: AtomicBool::new(false),
            fail_close: false,
        }
    }

    /// A handle whose close always reports an error.
    pub fn failing(dsn: &str) -> Self {
        Self {
            fail_close: true,
            ..Self::new(dsn)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PoolHandle for FakeHandle {
    async fn close(&self) -> DbResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(DbError::internal(format!("close refused for {}", self.dsn)));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeState {
    opens: AtomicUsize,
    opened: Mutex<Vec<String>>,
    /// Fail every open whose DSN contains this text
    fail_matching: Mutex<Option<String>>,
    fail_close: AtomicBool,
    delay: Mutex<Duration>,
}

/// Cheap to clone; clones share counters and switches.
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `open` calls so far, failed ones included.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// DSNs of the handles opened successfully, in order.
    pub fn opened(&self) -> Vec<String> {
        self.state.opened.lock().unwrap().clone()
    }

    pub fn fail_matching(&self, needle: &str) {
        *self.state.fail_matching.lock().unwrap() = Some(needle.to_string());
    }

    pub fn succeed(&self) {
        *self.state.fail_matching.lock().unwrap() = None;
    }

    pub fn fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }
}

impl Connector for FakeConnector {
    type Handle = FakeHandle;

    async fn open(
        &self,
        _driver: DatabaseType,
        dsn: &str,
        _max_lifetime: Duration,
    ) -> DbResult<FakeHandle> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .state
            .fail_matching
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|needle| dsn.contains(needle));
        if should_fail {
            return Err(DbError::connection(
                format!("connection refused: {}", dsn),
                "Check that the database server is running",
            ));
        }

        self.state.opened.lock().unwrap().push(dsn.to_string());
        Ok(FakeHandle {
            dsn: dsn.to_string(),
            closed: AtomicBool::new(false),
            fail_close: self.state.fail_close.load(Ordering::SeqCst),
        })
    }
}

pub fn test_config() -> DbConfig {
    DbConfig::new(DatabaseType::MySQL, "user", "password", "tcp(db1)")
}

/// Settings whose background sweep never fires during a test.
pub fn quiet_settings(ttl: Duration) -> IdleSettings {
    IdleSettings {
        ttl,
        sweep_interval: Duration::from_secs(24 * 60 * 60),
        sweep_jitter: Duration::ZERO,
    }
}

pub fn test_manager(
    config: DbConfig,
    connector: FakeConnector,
) -> (Arc<TenantManager<FakeConnector>>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let manager = TenantManager::with_clock(
        config,
        quiet_settings(Duration::from_secs(300)),
        connector,
        clock.clone(),
    );
    (manager, clock)
}
