//! `pg_monitor_database`: a point-in-time metrics snapshot with threshold alerts.

use crate::database::ConnectionHandle;
use crate::error::Result;
use crate::protocol::{CallToolResult, Tool};
use crate::tools::diagnostics::{Finding, number, sorted, text};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{Arguments, OperationArgs, OperationOutcome, simple_tool};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

pub const TOOL_NAME: &str = "pg_monitor_database";

const DATABASE_METRICS_SQL: &str = r#"
    SELECT
        current_database() AS database,
        pg_database_size(current_database())::int8 AS size_bytes,
        pg_size_pretty(pg_database_size(current_database())) AS size,
        (SELECT setting::int8 FROM pg_settings WHERE name = 'max_connections') AS max_connections,
        (SELECT count(*) FROM pg_stat_activity WHERE backend_type = 'client backend')::int8 AS connections,
        (SELECT count(*) FROM pg_stat_activity WHERE state = 'active' AND backend_type = 'client backend')::int8 AS active_connections,
        (100.0 * d.blks_hit / nullif(d.blks_hit + d.blks_read, 0))::float8 AS cache_hit_ratio,
        d.xact_commit AS commits,
        d.xact_rollback AS rollbacks,
        d.deadlocks,
        extract(epoch FROM now() - pg_postmaster_start_time())::int8 AS uptime_secs
    FROM pg_stat_database d
    WHERE d.datname = current_database()
"#;

const TABLE_METRICS_SQL: &str = r#"
    SELECT
        schemaname AS schema,
        relname AS table_name,
        pg_total_relation_size(relid)::int8 AS total_bytes,
        pg_size_pretty(pg_total_relation_size(relid)) AS total_size,
        n_live_tup AS live_rows,
        n_dead_tup AS dead_rows,
        coalesce((100.0 * n_dead_tup / nullif(n_live_tup + n_dead_tup, 0))::float8, 0) AS dead_ratio,
        seq_scan,
        coalesce(idx_scan, 0) AS idx_scan,
        last_autovacuum::text AS last_autovacuum,
        last_autoanalyze::text AS last_autoanalyze
    FROM pg_stat_user_tables
    ORDER BY pg_total_relation_size(relid) DESC
    LIMIT 20
"#;

const ACTIVE_QUERIES_SQL: &str = r#"
    SELECT
        pid,
        usename::text AS user_name,
        datname::text AS database,
        state,
        wait_event_type,
        coalesce(extract(epoch FROM now() - query_start), 0)::float8 AS duration_secs,
        left(query, 500) AS query
    FROM pg_stat_activity
    WHERE state <> 'idle'
      AND backend_type = 'client backend'
      AND pid <> pg_backend_pid()
    ORDER BY query_start
    LIMIT 50
"#;

const LOCK_METRICS_SQL: &str = r#"
    SELECT
        mode,
        count(*) FILTER (WHERE granted)::int8 AS granted,
        count(*) FILTER (WHERE NOT granted)::int8 AS waiting
    FROM pg_locks
    GROUP BY mode
    ORDER BY mode
"#;

const REPLICATION_METRICS_SQL: &str = r#"
    SELECT
        application_name,
        client_addr::text AS client,
        state,
        sync_state,
        coalesce(pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn), 0)::float8 AS lag_bytes
    FROM pg_stat_replication
    ORDER BY application_name
"#;

/// Limits past which a metric raises an alert.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertThresholds {
    pub connection_percentage: f64,
    pub cache_hit_ratio: f64,
    pub long_running_query_secs: f64,
    pub dead_tuple_ratio: f64,
    pub replication_lag_bytes: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            connection_percentage: 80.0,
            cache_hit_ratio: 95.0,
            long_running_query_secs: 300.0,
            dead_tuple_ratio: 20.0,
            replication_lag_bytes: 100.0 * 1024.0 * 1024.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorArgs {
    #[serde(default = "default_true")]
    pub include_tables: bool,
    #[serde(default = "default_true")]
    pub include_queries: bool,
    #[serde(default = "default_true")]
    pub include_locks: bool,
    #[serde(default)]
    pub include_replication: bool,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
}

fn default_true() -> bool {
    true
}

impl OperationArgs for MonitorArgs {
    const REQUIRED: &'static [&'static str] = &[];
}

/// Everything one snapshot collected; sections that were not requested stay `None`.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub database: Option<Value>,
    pub tables: Option<Vec<Value>>,
    pub queries: Option<Vec<Value>>,
    pub locks: Option<Vec<Value>>,
    pub replication: Option<Vec<Value>>,
}

pub fn alerts(snapshot: &Snapshot, thresholds: &AlertThresholds) -> Vec<Finding> {
    let mut alerts = Vec::new();

    if let Some(db) = &snapshot.database {
        if let (Some(connections), Some(max)) = (number(db, "connections"), number(db, "max_connections"))
            && max > 0.0
        {
            let usage = 100.0 * connections / max;
            if usage >= thresholds.connection_percentage {
                alerts.push(Finding::critical(format!(
                    "Connection usage {:.1}% exceeds {}% ({} of {})",
                    usage, thresholds.connection_percentage, connections, max
                )));
            }
        }
        if let Some(ratio) = number(db, "cache_hit_ratio")
            && ratio < thresholds.cache_hit_ratio
        {
            alerts.push(Finding::warning(format!(
                "Cache hit ratio {:.1}% is below {}%",
                ratio, thresholds.cache_hit_ratio
            )));
        }
    }

    for table in snapshot.tables.iter().flatten() {
        let ratio = number(table, "dead_ratio").unwrap_or(0.0);
        if ratio >= thresholds.dead_tuple_ratio && number(table, "dead_rows").unwrap_or(0.0) > 0.0 {
            alerts.push(Finding::warning(format!(
                "Table {}.{} has {:.1}% dead rows",
                text(table, "schema").unwrap_or("?"),
                text(table, "table_name").unwrap_or("?"),
                ratio
            )));
        }
    }

    for query in snapshot.queries.iter().flatten() {
        let duration = number(query, "duration_secs").unwrap_or(0.0);
        if duration >= thresholds.long_running_query_secs {
            alerts.push(Finding::warning(format!(
                "Query on pid {} has run for {:.0}s",
                number(query, "pid").unwrap_or(0.0),
                duration
            )));
        }
    }

    let waiting: f64 = snapshot
        .locks
        .iter()
        .flatten()
        .filter_map(|lock| number(lock, "waiting"))
        .sum();
    if waiting > 0.0 {
        alerts.push(Finding::warning(format!("{} lock request(s) are waiting", waiting)));
    }

    for replica in snapshot.replication.iter().flatten() {
        let lag = number(replica, "lag_bytes").unwrap_or(0.0);
        if lag >= thresholds.replication_lag_bytes {
            alerts.push(Finding::critical(format!(
                "Replica {} lags by {:.0} bytes",
                text(replica, "application_name").unwrap_or("?"),
                lag
            )));
        }
    }

    sorted(alerts)
}

async fn collect(conn: &ConnectionHandle, args: &MonitorArgs) -> Result<Snapshot> {
    let mut snapshot = Snapshot {
        database: conn.query_one_json(DATABASE_METRICS_SQL, &[]).await?,
        ..Snapshot::default()
    };
    if args.include_tables {
        snapshot.tables = Some(conn.query_json(TABLE_METRICS_SQL, &[]).await?);
    }
    if args.include_queries {
        snapshot.queries = Some(conn.query_json(ACTIVE_QUERIES_SQL, &[]).await?);
    }
    if args.include_locks {
        snapshot.locks = Some(conn.query_json(LOCK_METRICS_SQL, &[]).await?);
    }
    if args.include_replication {
        snapshot.replication = Some(conn.query_json(REPLICATION_METRICS_SQL, &[]).await?);
    }
    Ok(snapshot)
}

fn report(snapshot: Snapshot, alerts: Vec<Finding>) -> OperationOutcome {
    let mut details = Map::new();
    details.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    details.insert("database".into(), snapshot.database.unwrap_or(Value::Null));
    for (key, section) in [
        ("tables", snapshot.tables),
        ("queries", snapshot.queries),
        ("locks", snapshot.locks),
        ("replication", snapshot.replication),
    ] {
        if let Some(rows) = section {
            details.insert(key.into(), Value::Array(rows));
        }
    }
    let message = format!("Monitoring snapshot: {} alert(s)", alerts.len());
    details.insert("alerts".into(), json!(alerts));
    OperationOutcome::ok(message, Value::Object(details))
}

pub struct MonitorDatabaseTool;

#[async_trait]
impl ToolHandler for MonitorDatabaseTool {
    fn definition(&self) -> Tool {
        simple_tool(
            TOOL_NAME,
            "Take a snapshot of database metrics (size, connections, cache hit ratio, table \
            statistics, active queries, locks and replication) and raise alerts for values past \
            the given thresholds.",
            json!({
                "includeTables": {"type": "boolean", "description": "Include per-table statistics (default: true)"},
                "includeQueries": {"type": "boolean", "description": "Include active queries (default: true)"},
                "includeLocks": {"type": "boolean", "description": "Include lock counts (default: true)"},
                "includeReplication": {"type": "boolean", "description": "Include replica status (default: false)"},
                "alertThresholds": {
                    "type": "object",
                    "description": "Alert limits",
                    "properties": {
                        "connectionPercentage": {"type": "number", "description": "Default: 80"},
                        "cacheHitRatio": {"type": "number", "description": "Default: 95"},
                        "longRunningQuerySecs": {"type": "number", "description": "Default: 300"},
                        "deadTupleRatio": {"type": "number", "description": "Default: 20"},
                        "replicationLagBytes": {"type": "number", "description": "Default: 104857600"}
                    }
                }
            }),
            &[],
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_monitor_database"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let monitor: MonitorArgs = args.extract(TOOL_NAME)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let snapshot = collect(&conn, &monitor).await?;
        let alerts = alerts(&snapshot, &monitor.alert_thresholds);
        debug!("Collected monitoring snapshot with {} alert(s)", alerts.len());
        Ok(report(snapshot, alerts).into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::diagnostics::Severity;

    fn parse(value: Value) -> MonitorArgs {
        Arguments::new(value).unwrap().extract(TOOL_NAME).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(json!({}));
        assert!(args.include_tables && args.include_queries && args.include_locks);
        assert!(!args.include_replication);
        assert_eq!(args.alert_thresholds.connection_percentage, 80.0);
    }

    #[test]
    fn test_partial_thresholds_keep_other_defaults() {
        let args = parse(json!({"alertThresholds": {"cacheHitRatio": 99.5}}));
        assert_eq!(args.alert_thresholds.cache_hit_ratio, 99.5);
        assert_eq!(args.alert_thresholds.long_running_query_secs, 300.0);
    }

    #[test]
    fn test_alerts() {
        let snapshot = Snapshot {
            database: Some(json!({"connections": 90, "max_connections": 100, "cache_hit_ratio": 99.0})),
            tables: Some(vec![
                json!({"schema": "public", "table_name": "events", "dead_ratio": 40.0, "dead_rows": 4000}),
                json!({"schema": "public", "table_name": "users", "dead_ratio": 1.0, "dead_rows": 10}),
            ]),
            queries: Some(vec![json!({"pid": 42, "duration_secs": 600.0})]),
            locks: Some(vec![json!({"mode": "ExclusiveLock", "granted": 3, "waiting": 2})]),
            replication: None,
        };
        let alerts = alerts(&snapshot, &AlertThresholds::default());
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(alerts[0].message.contains("Connection usage 90.0%"));
        assert!(alerts.iter().any(|a| a.message.contains("public.events")));
        assert!(!alerts.iter().any(|a| a.message.contains("public.users")));
        assert!(alerts.iter().any(|a| a.message.contains("pid 42")));
        assert!(alerts.iter().any(|a| a.message.contains("2 lock request(s)")));
        assert!(!alerts.iter().any(|a| a.message.contains("Cache hit")));
    }

    #[test]
    fn test_report_omits_unrequested_sections() {
        let snapshot = Snapshot {
            database: Some(json!({"database": "app"})),
            tables: Some(Vec::new()),
            ..Snapshot::default()
        };
        let outcome = report(snapshot, Vec::new());
        assert!(outcome.details.get("tables").is_some());
        assert!(outcome.details.get("queries").is_none());
        assert_eq!(outcome.details["alerts"], json!([]));
    }
}
