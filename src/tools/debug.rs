//! `pg_debug_database`: targeted diagnosis of connection, performance, lock and
//! replication problems.

use crate::database::ConnectionHandle;
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::tools::diagnostics::{Finding, number, sorted, text};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{
    Arguments, OperationOutcome, OperationSet, operation_args, route, unknown_operation, wide_tool,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

const DEFAULT_LONG_RUNNING_SECS: u64 = 300;

const CONNECTION_SUMMARY_SQL: &str = r#"
    SELECT
        (SELECT setting::int8 FROM pg_settings WHERE name = 'max_connections') AS max_connections,
        (SELECT setting::int8 FROM pg_settings WHERE name = 'superuser_reserved_connections') AS reserved_connections,
        count(*)::int8 AS total_connections,
        count(*) FILTER (WHERE state = 'active')::int8 AS active,
        count(*) FILTER (WHERE state = 'idle')::int8 AS idle,
        count(*) FILTER (WHERE state LIKE 'idle in transaction%')::int8 AS idle_in_transaction,
        coalesce(max(extract(epoch FROM now() - state_change))
            FILTER (WHERE state LIKE 'idle in transaction%'), 0)::float8 AS longest_idle_in_transaction_secs
    FROM pg_stat_activity
    WHERE backend_type = 'client backend'
"#;

const CONNECTIONS_BY_CLIENT_SQL: &str = r#"
    SELECT
        usename::text AS user_name,
        datname::text AS database,
        coalesce(client_addr::text, 'local') AS client,
        application_name,
        count(*)::int8 AS connections
    FROM pg_stat_activity
    WHERE backend_type = 'client backend'
    GROUP BY usename, datname, client_addr, application_name
    ORDER BY connections DESC
    LIMIT 20
"#;

const LONG_RUNNING_SQL: &str = r#"
    SELECT
        pid,
        usename::text AS user_name,
        state,
        wait_event_type,
        wait_event,
        extract(epoch FROM now() - query_start)::float8 AS duration_secs,
        left(query, 500) AS query
    FROM pg_stat_activity
    WHERE backend_type = 'client backend'
      AND state <> 'idle'
      AND pid <> pg_backend_pid()
      AND now() - query_start > $1::float8 * interval '1 second'
    ORDER BY query_start
    LIMIT 20
"#;

const WAITING_SQL: &str = r#"
    SELECT wait_event_type, count(*)::int8 AS sessions
    FROM pg_stat_activity
    WHERE wait_event_type IS NOT NULL
      AND state = 'active'
      AND backend_type = 'client backend'
    GROUP BY wait_event_type
    ORDER BY sessions DESC
"#;

const BLOCKING_SQL: &str = r#"
    SELECT
        blocked.pid AS blocked_pid,
        blocked.usename::text AS blocked_user,
        left(blocked.query, 300) AS blocked_query,
        extract(epoch FROM now() - blocked.query_start)::float8 AS blocked_secs,
        blocking.pid AS blocking_pid,
        blocking.usename::text AS blocking_user,
        blocking.state AS blocking_state,
        left(blocking.query, 300) AS blocking_query
    FROM pg_stat_activity blocked
    JOIN LATERAL unnest(pg_blocking_pids(blocked.pid)) AS b(pid) ON true
    JOIN pg_stat_activity blocking ON blocking.pid = b.pid
    ORDER BY blocked.query_start
"#;

const LOCK_SUMMARY_SQL: &str = r#"
    SELECT
        l.locktype,
        l.mode,
        l.granted,
        coalesce(c.relname::text, '') AS relation,
        count(*)::int8 AS locks
    FROM pg_locks l
    LEFT JOIN pg_class c ON c.oid = l.relation
    WHERE l.pid <> pg_backend_pid()
    GROUP BY l.locktype, l.mode, l.granted, c.relname
    ORDER BY l.granted, locks DESC
    LIMIT 50
"#;

const RECOVERY_SQL: &str = "SELECT pg_is_in_recovery() AS in_recovery";

const REPLICAS_SQL: &str = r#"
    SELECT
        application_name,
        client_addr::text AS client,
        state,
        sync_state,
        coalesce(pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn), 0)::float8 AS replay_lag_bytes,
        coalesce(extract(epoch FROM replay_lag), 0)::float8 AS replay_lag_secs
    FROM pg_stat_replication
    ORDER BY application_name
"#;

const SLOTS_SQL: &str = r#"
    SELECT
        slot_name::text AS slot_name,
        slot_type,
        active,
        coalesce(pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn), 0)::float8 AS retained_bytes
    FROM pg_replication_slots
    ORDER BY slot_name
"#;

const STANDBY_SQL: &str = r#"
    SELECT
        coalesce(extract(epoch FROM now() - pg_last_xact_replay_timestamp()), 0)::float8 AS replay_delay_secs,
        pg_last_wal_receive_lsn()::text AS receive_lsn,
        pg_last_wal_replay_lsn()::text AS replay_lsn
"#;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugArgs {
    /// Queries running longer than this count as long-running.
    pub long_running_secs: Option<u64>,
}

operation_args! {
    DebugArgs => [],
}

impl DebugArgs {
    fn long_running_secs(&self) -> u64 {
        self.long_running_secs.unwrap_or(DEFAULT_LONG_RUNNING_SECS)
    }
}

#[derive(Debug)]
pub enum Issue {
    Connection,
    Performance(DebugArgs),
    Locks,
    Replication,
}

impl OperationSet for Issue {
    const TOOL: &'static str = "pg_debug_database";
    const OPERATIONS: &'static [&'static str] = &["connection", "performance", "locks", "replication"];
    const DISCRIMINANT: &'static str = "issue";

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        let debug: DebugArgs = args.extract(operation)?;
        match operation {
            "connection" => Ok(Self::Connection),
            "performance" => Ok(Self::Performance(debug)),
            "locks" => Ok(Self::Locks),
            "replication" => Ok(Self::Replication),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

pub fn connection_findings(summary: &Value) -> Vec<Finding> {
    let mut findings = Vec::new();
    let max = number(summary, "max_connections").unwrap_or(0.0);
    let reserved = number(summary, "reserved_connections").unwrap_or(0.0);
    let total = number(summary, "total_connections").unwrap_or(0.0);

    let available = max - reserved;
    if available > 0.0 {
        let usage = 100.0 * total / available;
        if usage >= 90.0 {
            findings.push(Finding::critical(format!(
                "{:.0}% of available connections are in use ({} of {})",
                usage, total, available
            )));
        } else if usage >= 75.0 {
            findings.push(Finding::warning(format!(
                "{:.0}% of available connections are in use ({} of {})",
                usage, total, available
            )));
        }
    }

    let idle_in_tx = number(summary, "idle_in_transaction").unwrap_or(0.0);
    if idle_in_tx > 0.0 {
        let longest = number(summary, "longest_idle_in_transaction_secs").unwrap_or(0.0);
        let finding = format!(
            "{} session(s) idle in transaction, longest for {:.0}s; they hold locks and block vacuum",
            idle_in_tx, longest
        );
        findings.push(if longest > 300.0 {
            Finding::critical(finding)
        } else {
            Finding::warning(finding)
        });
    }

    if number(summary, "idle").unwrap_or(0.0) > 0.5 * total && total > 50.0 {
        findings.push(Finding::info(
            "Most connections are idle; a connection pooler would reduce backend count",
        ));
    }
    sorted(findings)
}

pub fn performance_findings(long_running: &[Value], waiting: &[Value], threshold_secs: u64) -> Vec<Finding> {
    let mut findings = Vec::new();
    for query in long_running {
        findings.push(Finding::warning(format!(
            "pid {} has run for {:.0}s (over {}s){}",
            number(query, "pid").unwrap_or(0.0),
            number(query, "duration_secs").unwrap_or(0.0),
            threshold_secs,
            text(query, "wait_event_type")
                .map(|event| format!(", waiting on {}", event))
                .unwrap_or_default()
        )));
    }
    for wait in waiting {
        if text(wait, "wait_event_type") == Some("Lock") {
            findings.push(Finding::warning(format!(
                "{} active session(s) are waiting on locks; see issue 'locks'",
                number(wait, "sessions").unwrap_or(0.0)
            )));
        } else if text(wait, "wait_event_type") == Some("IO") {
            findings.push(Finding::info(format!(
                "{} active session(s) are waiting on I/O",
                number(wait, "sessions").unwrap_or(0.0)
            )));
        }
    }
    sorted(findings)
}

pub fn lock_findings(blocking: &[Value]) -> Vec<Finding> {
    let mut findings: Vec<Finding> = blocking
        .iter()
        .map(|edge| {
            let message = format!(
                "pid {} is blocked by pid {} ({}) for {:.0}s",
                number(edge, "blocked_pid").unwrap_or(0.0),
                number(edge, "blocking_pid").unwrap_or(0.0),
                text(edge, "blocking_state").unwrap_or("unknown"),
                number(edge, "blocked_secs").unwrap_or(0.0)
            );
            if number(edge, "blocked_secs").unwrap_or(0.0) > 60.0 {
                Finding::critical(message)
            } else {
                Finding::warning(message)
            }
        })
        .collect();

    let idle_blockers = blocking
        .iter()
        .filter(|edge| {
            text(edge, "blocking_state").is_some_and(|state| state.starts_with("idle in transaction"))
        })
        .count();
    if idle_blockers > 0 {
        findings.push(Finding::critical(format!(
            "{} lock(s) are held by sessions idle in transaction; consider pg_terminate_backend",
            idle_blockers
        )));
    }
    sorted(findings)
}

pub fn replication_findings(in_recovery: bool, replicas: &[Value], slots: &[Value], standby: Option<&Value>) -> Vec<Finding> {
    let mut findings = Vec::new();

    if in_recovery {
        if let Some(delay) = standby.and_then(|row| number(row, "replay_delay_secs"))
            && delay > 60.0
        {
            findings.push(Finding::warning(format!(
                "Standby replay is {:.0}s behind the primary",
                delay
            )));
        }
        return sorted(findings);
    }

    if replicas.is_empty() {
        findings.push(Finding::info("No replicas are connected to this server"));
    }
    for replica in replicas {
        let name = text(replica, "application_name").unwrap_or("replica");
        if text(replica, "state") != Some("streaming") {
            findings.push(Finding::warning(format!(
                "Replica {} is in state {}",
                name,
                text(replica, "state").unwrap_or("unknown")
            )));
        }
        let lag = number(replica, "replay_lag_bytes").unwrap_or(0.0);
        if lag > 1024.0 * 1024.0 * 1024.0 {
            findings.push(Finding::critical(format!(
                "Replica {} is {:.0} MB behind",
                name,
                lag / (1024.0 * 1024.0)
            )));
        } else if lag > 100.0 * 1024.0 * 1024.0 {
            findings.push(Finding::warning(format!(
                "Replica {} is {:.0} MB behind",
                name,
                lag / (1024.0 * 1024.0)
            )));
        }
    }
    for slot in slots {
        if slot.get("active").and_then(Value::as_bool) == Some(false) {
            findings.push(Finding::critical(format!(
                "Replication slot {} is inactive and retains {:.0} MB of WAL",
                text(slot, "slot_name").unwrap_or("?"),
                number(slot, "retained_bytes").unwrap_or(0.0) / (1024.0 * 1024.0)
            )));
        }
    }
    sorted(findings)
}

async fn debug_connections(conn: &ConnectionHandle) -> Result<OperationOutcome> {
    let summary = conn
        .query_one_json(CONNECTION_SUMMARY_SQL, &[])
        .await?
        .unwrap_or(Value::Null);
    let clients = conn.query_json(CONNECTIONS_BY_CLIENT_SQL, &[]).await?;
    let findings = connection_findings(&summary);
    Ok(OperationOutcome::ok(
        format!("Connection diagnosis: {} finding(s)", findings.len()),
        json!({"issue": "connection", "summary": summary, "byClient": clients, "findings": findings}),
    ))
}

async fn debug_performance(conn: &ConnectionHandle, args: DebugArgs) -> Result<OperationOutcome> {
    let threshold = args.long_running_secs();
    let threshold_param = threshold as f64;
    let long_running = conn.query_json(LONG_RUNNING_SQL, &[&threshold_param]).await?;
    let waiting = conn.query_json(WAITING_SQL, &[]).await?;
    let findings = performance_findings(&long_running, &waiting, threshold);
    Ok(OperationOutcome::ok(
        format!("Performance diagnosis: {} finding(s)", findings.len()),
        json!({
            "issue": "performance",
            "longRunningQueries": long_running,
            "waitEvents": waiting,
            "findings": findings
        }),
    ))
}

async fn debug_locks(conn: &ConnectionHandle) -> Result<OperationOutcome> {
    let blocking = conn.query_json(BLOCKING_SQL, &[]).await?;
    let locks = conn.query_json(LOCK_SUMMARY_SQL, &[]).await?;
    let findings = lock_findings(&blocking);
    Ok(OperationOutcome::ok(
        format!("Lock diagnosis: {} blocked session(s)", blocking.len()),
        json!({"issue": "locks", "blocking": blocking, "locks": locks, "findings": findings}),
    ))
}

async fn debug_replication(conn: &ConnectionHandle) -> Result<OperationOutcome> {
    let in_recovery = conn
        .query_one_json(RECOVERY_SQL, &[])
        .await?
        .and_then(|row| row.get("in_recovery").and_then(Value::as_bool))
        .unwrap_or(false);

    let (replicas, slots, standby) = if in_recovery {
        (Vec::new(), Vec::new(), conn.query_one_json(STANDBY_SQL, &[]).await?)
    } else {
        (
            conn.query_json(REPLICAS_SQL, &[]).await?,
            conn.query_json(SLOTS_SQL, &[]).await?,
            None,
        )
    };

    let findings = replication_findings(in_recovery, &replicas, &slots, standby.as_ref());
    Ok(OperationOutcome::ok(
        format!(
            "Replication diagnosis ({}): {} finding(s)",
            if in_recovery { "standby" } else { "primary" },
            findings.len()
        ),
        json!({
            "issue": "replication",
            "role": if in_recovery { "standby" } else { "primary" },
            "replicas": replicas,
            "slots": slots,
            "standby": standby,
            "findings": findings
        }),
    ))
}

pub struct DebugDatabaseTool;

#[async_trait]
impl ToolHandler for DebugDatabaseTool {
    fn definition(&self) -> Tool {
        wide_tool::<Issue>(
            "Diagnose a specific class of problem: connection saturation, slow or waiting \
            queries, lock contention or replication health.",
            json!({
                "longRunningSecs": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "performance: report queries running longer than this (default: 300)"
                }
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_debug_database"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let issue: Issue = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match issue {
            Issue::Connection => debug_connections(&conn).await?,
            Issue::Performance(debug) => debug_performance(&conn, debug).await?,
            Issue::Locks => debug_locks(&conn).await?,
            Issue::Replication => debug_replication(&conn).await?,
        };
        Ok(outcome.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::diagnostics::Severity;

    #[test]
    fn test_issue_routing() {
        let args = Arguments::new(json!({"issue": "performance", "longRunningSecs": 60})).unwrap();
        match route::<Issue>(&args).unwrap() {
            Issue::Performance(debug) => assert_eq!(debug.long_running_secs(), 60),
            other => panic!("unexpected issue: {other:?}"),
        }

        let err = route::<Issue>(&Arguments::new(json!({"issue": "disk"})).unwrap()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown operation 'disk' for pg_debug_database. Valid operations: connection, performance, locks, replication"
        );
    }

    #[test]
    fn test_connection_saturation() {
        let summary = json!({
            "max_connections": 100,
            "reserved_connections": 3,
            "total_connections": 92,
            "idle": 10,
            "idle_in_transaction": 2,
            "longest_idle_in_transaction_secs": 30.0
        });
        let findings = connection_findings(&summary);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings[0].message.contains("92 of 97"));
        assert_eq!(findings[1].severity, Severity::Warning);
        assert!(findings[1].message.contains("idle in transaction"));
    }

    #[test]
    fn test_healthy_connections_have_no_findings() {
        let summary = json!({"max_connections": 100, "reserved_connections": 3, "total_connections": 5, "idle": 3});
        assert!(connection_findings(&summary).is_empty());
    }

    #[test]
    fn test_lock_findings_flag_idle_blockers() {
        let blocking = vec![json!({
            "blocked_pid": 10,
            "blocking_pid": 20,
            "blocking_state": "idle in transaction",
            "blocked_secs": 5.0
        })];
        let findings = lock_findings(&blocking);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings[0].message.contains("idle in transaction"));
        assert!(findings[1].message.contains("pid 10 is blocked by pid 20"));
    }

    #[test]
    fn test_replication_findings() {
        let replicas = vec![json!({"application_name": "r1", "state": "catchup", "replay_lag_bytes": 0})];
        let slots = vec![json!({"slot_name": "old", "active": false, "retained_bytes": 2097152.0})];
        let findings = replication_findings(false, &replicas, &slots, None);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings[0].message.contains("Replication slot old"));
        assert!(findings.iter().any(|f| f.message.contains("Replica r1 is in state catchup")));

        let standby = json!({"replay_delay_secs": 120.0});
        let findings = replication_findings(true, &[], &[], Some(&standby));
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("120s"));
    }
}
