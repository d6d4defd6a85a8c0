//! `pg_manage_query`: execution plans and `pg_stat_statements` statistics.

use crate::database::{ConnectionHandle, SqlValue};
use crate::error::{DatabaseError, Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::security::{validate_keyword, validate_statement};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{
    Arguments, OperationOutcome, OperationSet, operation_args, route, unknown_operation, wide_tool,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

const FORMATS: &[&str] = &["TEXT", "JSON", "YAML", "XML"];
const ORDER_BY: &[&str] = &["mean_time", "total_time", "calls"];
const DEFAULT_LIMIT: i64 = 10;
const MAX_LIMIT: i64 = 1000;

const HAS_EXTENSION_SQL: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'pg_stat_statements') AS present";

const SLOW_QUERIES_SQL: &str = r#"
    SELECT
        s.queryid AS query_id,
        s.query,
        s.calls,
        round(s.total_exec_time::numeric, 2)::float8 AS total_time_ms,
        round(s.mean_exec_time::numeric, 2)::float8 AS mean_time_ms,
        round(s.max_exec_time::numeric, 2)::float8 AS max_time_ms,
        s.rows,
        round((100.0 * s.shared_blks_hit
            / nullif(s.shared_blks_hit + s.shared_blks_read, 0))::numeric, 2)::float8 AS cache_hit_percent
    FROM pg_stat_statements s
    WHERE s.mean_exec_time >= $1
    ORDER BY {order} DESC
    LIMIT $2
"#;

const QUERY_STATS_SQL: &str = r#"
    SELECT
        s.queryid AS query_id,
        s.query,
        s.calls,
        round(s.total_exec_time::numeric, 2)::float8 AS total_time_ms,
        round(s.mean_exec_time::numeric, 2)::float8 AS mean_time_ms,
        round(s.min_exec_time::numeric, 2)::float8 AS min_time_ms,
        round(s.max_exec_time::numeric, 2)::float8 AS max_time_ms,
        round(s.stddev_exec_time::numeric, 2)::float8 AS stddev_time_ms,
        s.rows,
        s.shared_blks_hit,
        s.shared_blks_read,
        s.temp_blks_written
    FROM pg_stat_statements s
    WHERE ($1::text IS NULL OR s.query ILIKE '%' || $1 || '%')
    ORDER BY s.total_exec_time DESC
    LIMIT $2
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explain {
    pub query: String,
    #[serde(default)]
    pub analyze: bool,
    #[serde(default)]
    pub buffers: bool,
    pub format: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQueries {
    pub limit: Option<i64>,
    #[serde(default)]
    pub min_duration_ms: f64,
    pub order_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub limit: Option<i64>,
    pub query_pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetStats {
    pub query_id: Option<i64>,
}

operation_args! {
    Explain => ["query"],
    SlowQueries => [],
    QueryStats => [],
    ResetStats => [],
}

#[derive(Debug)]
pub enum QueryOperation {
    Explain(Explain),
    GetSlowQueries(SlowQueries),
    GetStats(QueryStats),
    ResetStats(ResetStats),
}

impl OperationSet for QueryOperation {
    const TOOL: &'static str = "pg_manage_query";
    const OPERATIONS: &'static [&'static str] = &["explain", "get_slow_queries", "get_stats", "reset_stats"];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "explain" => args.extract(operation).map(Self::Explain),
            "get_slow_queries" => args.extract(operation).map(Self::GetSlowQueries),
            "get_stats" => args.extract(operation).map(Self::GetStats),
            "reset_stats" => args.extract(operation).map(Self::ResetStats),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

pub fn explain_sql(args: &Explain) -> std::result::Result<String, ToolError> {
    let query = validate_statement("query", &args.query)?;
    let format = validate_keyword("format", args.format.as_deref().unwrap_or("TEXT"), FORMATS)?;

    let mut options = vec![format!("FORMAT {}", format)];
    if args.analyze {
        options.insert(0, "ANALYZE".to_string());
    }
    if args.buffers {
        options.push("BUFFERS".to_string());
    }
    Ok(format!("EXPLAIN ({}) {}", options.join(", "), query))
}

/// `ORDER BY` expression for a slow-query sort key.
pub fn slow_query_order(order_by: Option<&str>) -> std::result::Result<&'static str, ToolError> {
    match validate_keyword("orderBy", order_by.unwrap_or("mean_time"), ORDER_BY)? {
        "total_time" => Ok("s.total_exec_time"),
        "calls" => Ok("s.calls"),
        _ => Ok("s.mean_exec_time"),
    }
}

async fn require_statements_extension(conn: &ConnectionHandle) -> Result<()> {
    let present = conn
        .query_one_json(HAS_EXTENSION_SQL, &[])
        .await?
        .and_then(|row| row.get("present").and_then(Value::as_bool))
        .unwrap_or(false);
    if present {
        Ok(())
    } else {
        Err(DatabaseError::QueryFailed(
            "pg_stat_statements extension is not installed; run CREATE EXTENSION pg_stat_statements \
            and add it to shared_preload_libraries"
                .into(),
        )
        .into())
    }
}

async fn explain(conn: &ConnectionHandle, args: Explain) -> Result<OperationOutcome> {
    let sql = explain_sql(&args)?;
    let params = SqlValue::from_values(&args.parameters);
    let bound = SqlValue::refs(&params);

    let rows = if args.analyze {
        conn.query_json_then_rollback(&sql, &bound).await?
    } else {
        conn.query_json(&sql, &bound).await?
    };

    let plan: Vec<Value> = rows
        .into_iter()
        .filter_map(|row| match row {
            Value::Object(map) => map.into_iter().next().map(|(_, v)| v),
            _ => None,
        })
        .collect();
    let plan = match plan.as_slice() {
        [single] if !single.is_string() => single.clone(),
        lines => Value::String(
            lines
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    };

    Ok(OperationOutcome::ok(
        if args.analyze {
            "Execution plan (analyzed, changes rolled back)"
        } else {
            "Execution plan"
        },
        json!({
            "format": args.format.as_deref().unwrap_or("text").to_lowercase(),
            "analyzed": args.analyze,
            "plan": plan
        }),
    ))
}

async fn get_slow_queries(conn: &ConnectionHandle, args: SlowQueries) -> Result<OperationOutcome> {
    let order = slow_query_order(args.order_by.as_deref())?;
    require_statements_extension(conn).await?;

    let sql = SLOW_QUERIES_SQL.replace("{order}", order);
    let limit = clamp_limit(args.limit);
    let rows = conn
        .query_json(&sql, &[&args.min_duration_ms, &limit])
        .await?;
    Ok(OperationOutcome::rows(
        format!("Found {} slow quer(ies)", rows.len()),
        rows,
    ))
}

async fn get_stats(conn: &ConnectionHandle, args: QueryStats) -> Result<OperationOutcome> {
    require_statements_extension(conn).await?;

    let pattern = args.query_pattern.as_deref().map(str::trim).filter(|p| !p.is_empty());
    let limit = clamp_limit(args.limit);
    let rows = conn.query_json(QUERY_STATS_SQL, &[&pattern, &limit]).await?;
    Ok(OperationOutcome::rows(
        format!("Statistics for {} quer(ies)", rows.len()),
        rows,
    ))
}

async fn reset_stats(conn: &ConnectionHandle, args: ResetStats) -> Result<OperationOutcome> {
    require_statements_extension(conn).await?;

    match args.query_id {
        Some(query_id) => {
            conn.query("SELECT pg_stat_statements_reset(0, 0, $1::bigint)", &[&query_id])
                .await?;
        }
        None => {
            conn.query("SELECT pg_stat_statements_reset()", &[]).await?;
        }
    }

    info!("Reset query statistics (query id: {:?})", args.query_id);
    Ok(OperationOutcome::ok(
        match args.query_id {
            Some(id) => format!("Statistics reset for query {}", id),
            None => "All query statistics reset".to_string(),
        },
        json!({"queryId": args.query_id}),
    ))
}

pub struct ManageQueryTool;

#[async_trait]
impl ToolHandler for ManageQueryTool {
    fn definition(&self) -> Tool {
        wide_tool::<QueryOperation>(
            "Analyze query performance: show execution plans and read or reset pg_stat_statements \
            statistics.",
            json!({
                "query": {"type": "string", "description": "Statement to explain"},
                "analyze": {"type": "boolean", "description": "Execute the statement; changes are rolled back"},
                "buffers": {"type": "boolean"},
                "format": {"type": "string", "enum": ["text", "json", "yaml", "xml"]},
                "parameters": {"type": "array", "description": "Values for $1, $2, ... in the query"},
                "limit": {"type": "integer", "description": "Maximum rows (default: 10)"},
                "minDurationMs": {"type": "number", "description": "Minimum mean execution time"},
                "orderBy": {"type": "string", "enum": ORDER_BY},
                "queryPattern": {"type": "string", "description": "Case-insensitive substring of the query text"},
                "queryId": {"type": "integer", "description": "Reset only this query's statistics"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_manage_query"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: QueryOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match operation {
            QueryOperation::Explain(a) => explain(&conn, a).await?,
            QueryOperation::GetSlowQueries(a) => get_slow_queries(&conn, a).await?,
            QueryOperation::GetStats(a) => get_stats(&conn, a).await?,
            QueryOperation::ResetStats(a) => reset_stats(&conn, a).await?,
        };
        Ok(outcome.into_result())
    }
}
