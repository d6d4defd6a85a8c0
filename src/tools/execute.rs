//! `pg_execute_query`: read-only queries with bound parameters.

use crate::database::{ConnectionHandle, SqlValue};
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::security::validate_statement;
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{
    Arguments, OperationOutcome, OperationSet, operation_args, route, unknown_operation, wide_tool,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadQuery {
    pub query: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    pub limit: Option<u32>,
    pub timeout_ms: Option<u64>,
}

operation_args! {
    ReadQuery => ["query"],
}

#[derive(Debug)]
pub enum ReadOperation {
    Select(ReadQuery),
    Count(ReadQuery),
    Exists(ReadQuery),
}

impl OperationSet for ReadOperation {
    const TOOL: &'static str = "pg_execute_query";
    const OPERATIONS: &'static [&'static str] = &["select", "count", "exists"];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "select" => args.extract(operation).map(Self::Select),
            "count" => args.extract(operation).map(Self::Count),
            "exists" => args.extract(operation).map(Self::Exists),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

/// Accepts one `SELECT` or `WITH` statement and returns it without a trailing `;`.
pub fn read_only_query(query: &str) -> std::result::Result<&str, ToolError> {
    let statement = validate_statement("query", query)?;
    let first_word = statement
        .trim_start_matches('(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");
    if first_word.eq_ignore_ascii_case("SELECT") || first_word.eq_ignore_ascii_case("WITH") {
        Ok(statement)
    } else {
        Err(ToolError::invalid(
            "Only SELECT or WITH queries are allowed; use pg_execute_mutation or pg_execute_sql for changes",
        ))
    }
}

/// Wraps the caller's query so it can only be read from; data-modifying
/// `WITH` clauses are refused by the server inside a subquery.
pub fn wrapped_sql(operation: &ReadOperation) -> std::result::Result<String, ToolError> {
    Ok(match operation {
        ReadOperation::Select(q) => {
            let query = read_only_query(&q.query)?;
            match q.limit {
                Some(limit) => format!("SELECT * FROM ({}) AS result LIMIT {}", query, limit),
                None => format!("SELECT * FROM ({}) AS result", query),
            }
        }
        ReadOperation::Count(q) => format!(
            "SELECT count(*) AS count FROM ({}) AS result",
            read_only_query(&q.query)?
        ),
        ReadOperation::Exists(q) => format!(
            "SELECT EXISTS ({}) AS exists",
            read_only_query(&q.query)?
        ),
    })
}

async fn run(conn: &ConnectionHandle, operation: ReadOperation) -> Result<OperationOutcome> {
    let sql = wrapped_sql(&operation)?;
    let (kind, query) = match &operation {
        ReadOperation::Select(q) => ("select", q),
        ReadOperation::Count(q) => ("count", q),
        ReadOperation::Exists(q) => ("exists", q),
    };

    let params = SqlValue::from_values(&query.parameters);
    let rows = conn
        .query_json_with_timeout(
            &sql,
            &SqlValue::refs(&params),
            query.timeout_ms.map(Duration::from_millis),
        )
        .await?;

    Ok(match kind {
        "count" => {
            let count = rows
                .first()
                .and_then(|row| row.get("count"))
                .cloned()
                .unwrap_or(json!(0));
            OperationOutcome::ok(format!("Count: {}", count), json!({"count": count}))
        }
        "exists" => {
            let exists = rows
                .first()
                .and_then(|row| row.get("exists"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            OperationOutcome::ok(
                if exists { "Rows exist" } else { "No rows" },
                json!({"exists": exists}),
            )
        }
        _ => OperationOutcome::ok(
            format!("Query returned {} row(s)", rows.len()),
            json!({"rowCount": rows.len(), "rows": rows}),
        ),
    })
}

pub struct ExecuteQueryTool;

#[async_trait]
impl ToolHandler for ExecuteQueryTool {
    fn definition(&self) -> Tool {
        wide_tool::<ReadOperation>(
            "Run a read-only SELECT or WITH query with bound parameters. select returns rows, \
            count the number of rows, exists whether any row matches.",
            json!({
                "query": {"type": "string", "description": "SELECT or WITH statement; use $1, $2, ... for parameters"},
                "parameters": {"type": "array", "description": "Parameter values"},
                "limit": {"type": "integer", "minimum": 0, "description": "Maximum rows for select"},
                "timeoutMs": {"type": "integer", "minimum": 1, "description": "Query timeout in milliseconds"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_execute_query"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: ReadOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;
        Ok(run(&conn, operation).await?.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> ReadOperation {
        route(&Arguments::new(value).unwrap()).unwrap()
    }

    #[test]
    fn test_only_select_and_with() {
        assert!(read_only_query("select * from t").is_ok());
        assert!(read_only_query("WITH x AS (SELECT 1) SELECT * FROM x;").is_ok());
        assert!(read_only_query("(SELECT 1) UNION (SELECT 2)").is_ok());
        assert!(read_only_query("DELETE FROM t").is_err());
        assert!(read_only_query("SELECT 1; DELETE FROM t").is_err());
        assert!(read_only_query("selectx").is_err());
    }

    #[test]
    fn test_select_with_limit() {
        let op = parse(json!({
            "operation": "select",
            "query": "SELECT * FROM orders WHERE id = $1;",
            "parameters": [5],
            "limit": 20
        }));
        assert_eq!(
            wrapped_sql(&op).unwrap(),
            "SELECT * FROM (SELECT * FROM orders WHERE id = $1) AS result LIMIT 20"
        );
    }

    #[test]
    fn test_count_and_exists() {
        let count = parse(json!({"operation": "count", "query": "SELECT 1"}));
        assert_eq!(
            wrapped_sql(&count).unwrap(),
            "SELECT count(*) AS count FROM (SELECT 1) AS result"
        );
        let exists = parse(json!({"operation": "exists", "query": "SELECT 1"}));
        assert_eq!(wrapped_sql(&exists).unwrap(), "SELECT EXISTS (SELECT 1) AS exists");
    }

    #[test]
    fn test_negative_limit_is_validation_error() {
        let err = route::<ReadOperation>(
            &Arguments::new(json!({"operation": "select", "query": "SELECT 1", "limit": -1})).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
