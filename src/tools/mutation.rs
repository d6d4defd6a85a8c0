//! `pg_execute_mutation`: INSERT, UPDATE, DELETE and upsert with every value bound.

use crate::database::{ConnectionHandle, SqlValue};
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::security::{quote_ident, quote_ident_list, quote_qualified, validate_fragment};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{
    Arguments, OperationOutcome, OperationSet, operation_args, route, schema_or_default,
    unknown_operation, wide_tool,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{info, instrument};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insert {
    pub table: String,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub returning: Vec<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub table: String,
    pub data: Map<String, Value>,
    #[serde(rename = "where")]
    pub where_clause: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(default)]
    pub returning: Vec<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    pub table: String,
    #[serde(rename = "where")]
    pub where_clause: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(default)]
    pub returning: Vec<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upsert {
    pub table: String,
    pub data: Map<String, Value>,
    pub conflict_columns: Vec<String>,
    #[serde(default)]
    pub returning: Vec<String>,
    pub schema: Option<String>,
}

operation_args! {
    Insert => ["table", "data"],
    Update => ["table", "data", "where"],
    Delete => ["table", "where"],
    Upsert => ["table", "data", "conflictColumns"],
}

#[derive(Debug)]
pub enum MutationOperation {
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Upsert(Upsert),
}

impl OperationSet for MutationOperation {
    const TOOL: &'static str = "pg_execute_mutation";
    const OPERATIONS: &'static [&'static str] = &["insert", "update", "delete", "upsert"];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "insert" => args.extract(operation).map(Self::Insert),
            "update" => args.extract(operation).map(Self::Update),
            "delete" => args.extract(operation).map(Self::Delete),
            "upsert" => args.extract(operation).map(Self::Upsert),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

/// Statement text plus the values for its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub returns_rows: bool,
}

/// Adds `offset` to every `$n` placeholder outside quoted literals and identifiers.
pub fn shift_placeholders(clause: &str, offset: usize) -> String {
    if offset == 0 {
        return clause.to_string();
    }

    let mut out = String::with_capacity(clause.len() + 8);
    let mut quote: Option<char> = None;
    let mut chars = clause.chars().peekable();
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' if chars.peek().is_some_and(char::is_ascii_digit) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                match digits.parse::<usize>() {
                    Ok(n) => out.push_str(&format!("${}", n + offset)),
                    Err(_) => {
                        out.push('$');
                        out.push_str(&digits);
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn require_data(data: &Map<String, Value>) -> std::result::Result<(), ToolError> {
    if data.is_empty() {
        Err(ToolError::invalid("data must contain at least one column"))
    } else {
        Ok(())
    }
}

fn returning_clause(returning: &[String]) -> std::result::Result<String, ToolError> {
    let columns: Vec<&str> = returning
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    if columns.is_empty() {
        Ok(String::new())
    } else if columns == ["*"] {
        Ok(" RETURNING *".to_string())
    } else {
        Ok(format!(" RETURNING {}", quote_ident_list(&columns)?))
    }
}

fn columns_and_values(data: &Map<String, Value>) -> (Vec<&str>, Vec<SqlValue>) {
    data.iter()
        .map(|(column, value)| (column.as_str(), SqlValue(value.clone())))
        .unzip()
}

fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|n| format!("${}", n))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn build_statement(operation: &MutationOperation) -> std::result::Result<BoundStatement, ToolError> {
    match operation {
        MutationOperation::Insert(args) => {
            require_data(&args.data)?;
            let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table.trim())?;
            let (columns, params) = columns_and_values(&args.data);
            let returning = returning_clause(&args.returning)?;
            Ok(BoundStatement {
                sql: format!(
                    "INSERT INTO {} ({}) VALUES ({}){}",
                    table,
                    quote_ident_list(&columns)?,
                    placeholders(1, columns.len()),
                    returning
                ),
                params,
                returns_rows: !returning.is_empty(),
            })
        }
        MutationOperation::Update(args) => {
            require_data(&args.data)?;
            let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table.trim())?;
            let (columns, mut params) = columns_and_values(&args.data);
            let assignments = columns
                .iter()
                .enumerate()
                .map(|(i, column)| -> std::result::Result<String, ToolError> {
                    Ok(format!("{} = ${}", quote_ident(column)?, i + 1))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let predicate = shift_placeholders(
                validate_fragment("where clause", &args.where_clause)?,
                columns.len(),
            );
            params.extend(SqlValue::from_values(&args.parameters));
            let returning = returning_clause(&args.returning)?;
            Ok(BoundStatement {
                sql: format!(
                    "UPDATE {} SET {} WHERE {}{}",
                    table,
                    assignments.join(", "),
                    predicate,
                    returning
                ),
                params,
                returns_rows: !returning.is_empty(),
            })
        }
        MutationOperation::Delete(args) => {
            let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table.trim())?;
            let predicate = validate_fragment("where clause", &args.where_clause)?;
            let returning = returning_clause(&args.returning)?;
            Ok(BoundStatement {
                sql: format!("DELETE FROM {} WHERE {}{}", table, predicate, returning),
                params: SqlValue::from_values(&args.parameters),
                returns_rows: !returning.is_empty(),
            })
        }
        MutationOperation::Upsert(args) => {
            require_data(&args.data)?;
            let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table.trim())?;
            let (columns, params) = columns_and_values(&args.data);
            let conflict: Vec<&str> = args.conflict_columns.iter().map(|c| c.trim()).collect();

            let updates = columns
                .iter()
                .filter(|column| !conflict.contains(*column))
                .map(|column| -> std::result::Result<String, ToolError> {
                    let quoted = quote_ident(column)?;
                    Ok(format!("{} = EXCLUDED.{}", quoted, quoted))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let action = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            let returning = returning_clause(&args.returning)?;

            Ok(BoundStatement {
                sql: format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}{}",
                    table,
                    quote_ident_list(&columns)?,
                    placeholders(1, columns.len()),
                    quote_ident_list(&conflict)?,
                    action,
                    returning
                ),
                params,
                returns_rows: !returning.is_empty(),
            })
        }
    }
}

fn describe(operation: &MutationOperation) -> (&'static str, &str) {
    match operation {
        MutationOperation::Insert(a) => ("insert", a.table.trim()),
        MutationOperation::Update(a) => ("update", a.table.trim()),
        MutationOperation::Delete(a) => ("delete", a.table.trim()),
        MutationOperation::Upsert(a) => ("upsert", a.table.trim()),
    }
}

async fn run(conn: &ConnectionHandle, operation: MutationOperation) -> Result<OperationOutcome> {
    let statement = build_statement(&operation)?;
    let params = SqlValue::refs(&statement.params);
    let (kind, table) = describe(&operation);

    if statement.returns_rows {
        let rows = conn.query_json(&statement.sql, &params).await?;
        info!("{} on {} returned {} row(s)", kind, table, rows.len());
        Ok(OperationOutcome::ok(
            format!("{} affected {} row(s)", kind, rows.len()),
            json!({"operation": kind, "table": table, "rowsAffected": rows.len(), "rows": rows}),
        ))
    } else {
        let affected = conn.execute(&statement.sql, &params).await?;
        info!("{} on {} affected {} row(s)", kind, table, affected);
        Ok(OperationOutcome::ok(
            format!("{} affected {} row(s)", kind, affected),
            json!({"operation": kind, "table": table, "rowsAffected": affected}),
        ))
    }
}

pub struct ExecuteMutationTool;

#[async_trait]
impl ToolHandler for ExecuteMutationTool {
    fn definition(&self) -> Tool {
        wide_tool::<MutationOperation>(
            "Insert, update, delete or upsert rows. Column values are always sent as bound \
            parameters; where clauses may use $1, $2, ... bound from parameters.",
            json!({
                "table": {"type": "string", "description": "Target table"},
                "schema": {"type": "string", "description": "Schema name (default: public)"},
                "data": {"type": "object", "description": "Column values for insert, update and upsert"},
                "where": {"type": "string", "description": "WHERE clause for update and delete (required)"},
                "parameters": {"type": "array", "description": "Values for placeholders in where"},
                "conflictColumns": {"type": "array", "items": {"type": "string"}, "description": "ON CONFLICT target for upsert"},
                "returning": {"type": "array", "items": {"type": "string"}, "description": "Columns to return, or [\"*\"]"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_execute_mutation"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: MutationOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;
        Ok(run(&conn, operation).await?.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> MutationOperation {
        route(&Arguments::new(value).unwrap()).unwrap()
    }

    #[test]
    fn test_shift_placeholders_skips_literals() {
        assert_eq!(shift_placeholders("id = $1 AND k = $2", 3), "id = $4 AND k = $5");
        assert_eq!(
            shift_placeholders("note = 'costs $1' AND id = $1", 2),
            "note = 'costs $1' AND id = $3"
        );
        assert_eq!(shift_placeholders("\"$1col\" = $10", 1), "\"$1col\" = $11");
        assert_eq!(shift_placeholders("id = $1", 0), "id = $1");
    }

    #[test]
    fn test_insert_statement() {
        let op = parse(json!({
            "operation": "insert",
            "table": "orders",
            "data": {"customer_id": 7, "total": "12.50"},
            "returning": ["id"]
        }));
        let statement = build_statement(&op).unwrap();
        assert_eq!(
            statement.sql,
            "INSERT INTO \"public\".\"orders\" (\"customer_id\", \"total\") VALUES ($1, $2) RETURNING \"id\""
        );
        assert_eq!(statement.params, vec![SqlValue(json!(7)), SqlValue(json!("12.50"))]);
        assert!(statement.returns_rows);
    }

    #[test]
    fn test_update_renumbers_where_parameters() {
        let op = parse(json!({
            "operation": "update",
            "table": "orders",
            "data": {"status": "shipped"},
            "where": "id = $1",
            "parameters": [42]
        }));
        let statement = build_statement(&op).unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"public\".\"orders\" SET \"status\" = $1 WHERE id = $2"
        );
        assert_eq!(statement.params, vec![SqlValue(json!("shipped")), SqlValue(json!(42))]);
        assert!(!statement.returns_rows);
    }

    #[test]
    fn test_update_requires_where() {
        let err = route::<MutationOperation>(
            &Arguments::new(json!({"operation": "update", "table": "t", "data": {"a": 1}})).unwrap(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Missing required argument(s) for 'update': where");
    }

    #[test]
    fn test_delete_rejects_stacked_statement() {
        let op = parse(json!({
            "operation": "delete",
            "table": "orders",
            "where": "true; DROP TABLE orders"
        }));
        assert!(build_statement(&op).is_err());
    }

    #[test]
    fn test_upsert_statement() {
        let op = parse(json!({
            "operation": "upsert",
            "table": "stock",
            "data": {"qty": 3, "sku": "A-1"},
            "conflictColumns": ["sku"],
            "returning": ["*"]
        }));
        let statement = build_statement(&op).unwrap();
        assert_eq!(
            statement.sql,
            "INSERT INTO \"public\".\"stock\" (\"qty\", \"sku\") VALUES ($1, $2) ON CONFLICT (\"sku\") \
            DO UPDATE SET \"qty\" = EXCLUDED.\"qty\" RETURNING *"
        );
    }

    #[test]
    fn test_upsert_with_only_key_columns_does_nothing() {
        let op = parse(json!({
            "operation": "upsert",
            "table": "tags",
            "data": {"name": "x"},
            "conflictColumns": ["name"]
        }));
        assert!(build_statement(&op).unwrap().sql.ends_with("ON CONFLICT (\"name\") DO NOTHING"));
    }

    #[test]
    fn test_empty_data_rejected() {
        let op = parse(json!({"operation": "insert", "table": "t", "data": {}}));
        assert!(build_statement(&op).is_err());
    }
}
