//! `pg_execute_sql`: arbitrary statements and scripts.

use crate::database::{ConnectionHandle, SqlValue, Statement, StatementOutcome};
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{Arguments, OperationArgs, OperationOutcome, simple_tool};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, instrument};

pub const TOOL_NAME: &str = "pg_execute_sql";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteSql {
    pub sql: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(default = "default_true")]
    pub expect_rows: bool,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub transactional: bool,
}

fn default_true() -> bool {
    true
}

impl OperationArgs for ExecuteSql {
    const REQUIRED: &'static [&'static str] = &["sql"];
}

/// How a call is sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One prepared statement whose rows are returned.
    Query,
    /// One prepared statement whose affected-row count is returned.
    Execute,
    /// Simple-protocol text, possibly several statements.
    Script,
}

impl ExecuteSql {
    pub fn mode(&self) -> ExecutionMode {
        match (self.expect_rows, self.parameters.is_empty()) {
            (true, _) => ExecutionMode::Query,
            (false, false) => ExecutionMode::Execute,
            (false, true) => ExecutionMode::Script,
        }
    }

    fn time_limit(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

async fn run_transactional(conn: &ConnectionHandle, args: &ExecuteSql) -> Result<StatementOutcome> {
    let mut statement =
        Statement::execute(args.sql.as_str()).with_params(SqlValue::from_values(&args.parameters));
    if args.expect_rows {
        statement = statement.returning_rows();
    }

    conn.run_in_transaction_with_timeout(&[statement], args.time_limit())
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ToolError::ExecutionFailed("transaction returned no outcome".into()).into())
}

fn outcome_of(result: StatementOutcome) -> OperationOutcome {
    match result {
        StatementOutcome::Rows(rows) => OperationOutcome::ok(
            format!("Query returned {} row(s)", rows.len()),
            json!({"rowCount": rows.len(), "rows": rows}),
        ),
        StatementOutcome::Affected(affected) => OperationOutcome::ok(
            format!("Statement affected {} row(s)", affected),
            json!({"rowsAffected": affected}),
        ),
    }
}

async fn run(conn: &ConnectionHandle, args: ExecuteSql) -> Result<OperationOutcome> {
    let mode = args.mode();
    if args.transactional && mode != ExecutionMode::Script {
        let result = run_transactional(conn, &args).await?;
        return Ok(outcome_of(result));
    }

    let params = SqlValue::from_values(&args.parameters);
    let bound = SqlValue::refs(&params);
    let outcome = match mode {
        ExecutionMode::Query => {
            let rows = conn
                .query_json_with_timeout(&args.sql, &bound, args.time_limit())
                .await?;
            outcome_of(StatementOutcome::Rows(rows))
        }
        ExecutionMode::Execute => {
            let affected = conn
                .execute_with_timeout(&args.sql, &bound, args.time_limit())
                .await?;
            outcome_of(StatementOutcome::Affected(affected))
        }
        ExecutionMode::Script => {
            conn.batch_execute_with_timeout(&args.sql, args.time_limit())
                .await?;
            info!("Executed SQL script");
            OperationOutcome::ok("SQL executed successfully", Value::Null)
        }
    };
    Ok(outcome)
}

pub struct ExecuteSqlTool;

#[async_trait]
impl ToolHandler for ExecuteSqlTool {
    fn definition(&self) -> Tool {
        simple_tool(
            TOOL_NAME,
            "Execute arbitrary SQL. With expectRows (default) one statement runs and its rows are \
            returned; with expectRows false and parameters the affected-row count is returned; with \
            expectRows false and no parameters the text runs as a script, which may hold several \
            statements and runs atomically.",
            json!({
                "sql": {"type": "string", "description": "SQL text; use $1, $2, ... for parameters"},
                "parameters": {"type": "array", "description": "Parameter values"},
                "expectRows": {"type": "boolean", "description": "Return result rows (default: true)"},
                "timeoutMs": {"type": "integer", "minimum": 1, "description": "Timeout in milliseconds"},
                "transactional": {"type": "boolean", "description": "Run the statement inside BEGIN/COMMIT"}
            }),
            &["sql"],
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_execute_sql"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let sql: ExecuteSql = args.extract(TOOL_NAME)?;
        let conn = ctx.connect(args.connection_string()).await?;
        Ok(run(&conn, sql).await?.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> std::result::Result<ExecuteSql, ToolError> {
        Arguments::new(value).unwrap().extract(TOOL_NAME)
    }

    #[test]
    fn test_sql_is_required() {
        let err = parse(json!({"sql": "  "})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing required argument(s) for 'pg_execute_sql': sql"
        );
    }

    #[test]
    fn test_modes() {
        assert_eq!(parse(json!({"sql": "SELECT 1"})).unwrap().mode(), ExecutionMode::Query);
        assert_eq!(
            parse(json!({"sql": "DELETE FROM t WHERE id = $1", "parameters": [1], "expectRows": false}))
                .unwrap()
                .mode(),
            ExecutionMode::Execute
        );
        assert_eq!(
            parse(json!({"sql": "CREATE TABLE a(); CREATE TABLE b();", "expectRows": false}))
                .unwrap()
                .mode(),
            ExecutionMode::Script
        );
    }

    #[test]
    fn test_defaults() {
        let args = parse(json!({"sql": "SELECT 1"})).unwrap();
        assert!(args.expect_rows);
        assert!(!args.transactional);
        assert!(args.time_limit().is_none());
    }
}
