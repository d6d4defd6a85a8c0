//! Pool construction and metrics.

use crate::config::PoolSettings;
use crate::error::{DatabaseError, DbResult};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_postgres::NoTls;

const APPLICATION_NAME: &str = "pg-admin-mcp";

/// Builds a lazily-connecting pool for one connection string.
///
/// Nothing is dialed here; the first `get()` opens the first connection.
pub fn build_pool(connection_string: &str, settings: &PoolSettings) -> DbResult<Pool> {
    let mut pg_config: tokio_postgres::Config = connection_string
        .parse()
        .map_err(|e: tokio_postgres::Error| DatabaseError::InvalidConnectionString(e.to_string()))?;

    pg_config.connect_timeout(settings.connect_timeout);

    if pg_config.get_application_name().is_none() {
        pg_config.application_name(APPLICATION_NAME);
    }

    if let Some(timeout) = settings.statement_timeout {
        let option = format!("-c statement_timeout={}", timeout.as_millis());
        let options = match pg_config.get_options() {
            Some(existing) if !existing.is_empty() => format!("{} {}", existing, option),
            _ => option,
        };
        pg_config.options(&options);
    }

    let mut manager_config = ManagerConfig::default();
    manager_config.recycling_method = RecyclingMethod::Fast;
    let manager = Manager::from_config(pg_config, NoTls, manager_config);

    Pool::builder(manager)
        .max_size(settings.max_size)
        .runtime(Runtime::Tokio1)
        .wait_timeout(Some(settings.connect_timeout))
        .create_timeout(Some(settings.connect_timeout))
        .build()
        .map_err(|e| DatabaseError::InvalidConnectionString(e.to_string()))
}

/// Counters shared by the connection manager and every handle it hands out.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub pools_created: AtomicU64,
    pub pools_closed: AtomicU64,
    pub connection_errors: AtomicU64,
    pub queries_executed: AtomicU64,
    pub query_errors: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pool_created(&self) {
        self.pools_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pools_closed(&self, count: u64) {
        self.pools_closed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_executed(&self) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_error(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            pools_created: self.pools_created.load(Ordering::Relaxed),
            pools_closed: self.pools_closed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetricsSnapshot {
    pub pools_created: u64,
    pub pools_closed: u64,
    pub connection_errors: u64,
    pub queries_executed: u64,
    pub query_errors: u64,
}

/// Per-pool occupancy as reported by deadpool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub max_size: usize,
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
}

impl PoolStatus {
    pub fn of(pool: &Pool) -> Self {
        let status = pool.status();
        Self {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_metrics() {
        let metrics = PoolMetrics::new();
        metrics.record_query_executed();
        metrics.record_query_executed();
        metrics.record_query_error();
        metrics.record_pools_closed(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queries_executed, 2);
        assert_eq!(snapshot.query_errors, 1);
        assert_eq!(snapshot.pools_closed, 3);
    }

    #[tokio::test]
    async fn test_build_pool_does_not_dial() {
        let settings = PoolSettings::default().connect_timeout(Duration::from_millis(200));
        let pool = build_pool("postgres://nobody@127.0.0.1:1/none", &settings).unwrap();
        assert_eq!(pool.status().size, 0);
        assert_eq!(pool.status().max_size, 10);
    }

    #[test]
    fn test_build_pool_rejects_garbage() {
        let result = build_pool("postgres://user@host:notaport/db", &PoolSettings::default());
        assert!(matches!(
            result,
            Err(DatabaseError::InvalidConnectionString(_))
        ));
    }
}
