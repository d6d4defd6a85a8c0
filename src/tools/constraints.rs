//! `pg_manage_constraints`: foreign keys, unique, check and primary key constraints.

use crate::database::ConnectionHandle;
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::security::{quote_ident, quote_ident_list, quote_qualified, validate_fragment, validate_keyword};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{
    Arguments, OperationOutcome, OperationSet, operation_args, route, schema_or_default,
    unknown_operation, wide_tool,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

const REFERENTIAL_ACTIONS: &[&str] = &["NO ACTION", "RESTRICT", "CASCADE", "SET NULL", "SET DEFAULT"];
const CONSTRAINT_TYPES: &[&str] = &["UNIQUE", "CHECK", "PRIMARY_KEY"];

const GET_CONSTRAINTS_SQL: &str = r#"
    SELECT
        con.conname AS constraint_name,
        c.relname AS table_name,
        n.nspname AS schema,
        CASE con.contype
            WHEN 'p' THEN 'PRIMARY KEY'
            WHEN 'f' THEN 'FOREIGN KEY'
            WHEN 'u' THEN 'UNIQUE'
            WHEN 'c' THEN 'CHECK'
            WHEN 'x' THEN 'EXCLUDE'
            ELSE con.contype::text
        END AS constraint_type,
        pg_get_constraintdef(con.oid) AS definition,
        ARRAY(
            SELECT a.attname FROM unnest(con.conkey) AS k(attnum)
            JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
        )::text[] AS columns,
        rc.relname AS referenced_table,
        con.condeferrable AS deferrable,
        con.condeferred AS initially_deferred
    FROM pg_constraint con
    JOIN pg_class c ON c.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_class rc ON rc.oid = con.confrelid
    WHERE n.nspname = $1
      AND ($2::text IS NULL OR c.relname = $2)
      AND ($3::text IS NULL OR con.contype::text = $3)
    ORDER BY c.relname, con.conname
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConstraints {
    pub table_name: Option<String>,
    pub constraint_type: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateForeignKey {
    pub constraint_name: String,
    pub table_name: String,
    pub column_names: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub referenced_schema: Option<String>,
    pub on_update: Option<String>,
    pub on_delete: Option<String>,
    #[serde(default)]
    pub deferrable: bool,
    #[serde(default)]
    pub initially_deferred: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropConstraint {
    pub constraint_name: String,
    pub table_name: String,
    #[serde(default = "default_true")]
    pub if_exists: bool,
    #[serde(default)]
    pub cascade: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConstraint {
    pub constraint_name: String,
    pub table_name: String,
    pub constraint_type: String,
    #[serde(default)]
    pub column_names: Vec<String>,
    pub check_expression: Option<String>,
    #[serde(default)]
    pub deferrable: bool,
    pub schema: Option<String>,
}

fn default_true() -> bool {
    true
}

operation_args! {
    GetConstraints => [],
    CreateForeignKey => [
        "constraintName",
        "tableName",
        "columnNames",
        "referencedTable",
        "referencedColumns",
    ],
    DropConstraint => ["constraintName", "tableName"],
    CreateConstraint => ["constraintName", "tableName", "constraintType"],
}

#[derive(Debug)]
pub enum ConstraintOperation {
    Get(GetConstraints),
    CreateFk(CreateForeignKey),
    DropFk(DropConstraint),
    Create(CreateConstraint),
    Drop(DropConstraint),
}

impl OperationSet for ConstraintOperation {
    const TOOL: &'static str = "pg_manage_constraints";
    const OPERATIONS: &'static [&'static str] = &["get", "create_fk", "drop_fk", "create", "drop"];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "get" => args.extract(operation).map(Self::Get),
            "create_fk" => args.extract(operation).map(Self::CreateFk),
            "drop_fk" => args.extract(operation).map(Self::DropFk),
            "create" => args.extract(operation).map(Self::Create),
            "drop" => args.extract(operation).map(Self::Drop),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

/// Maps a constraint type filter to `pg_constraint.contype`.
fn contype(filter: &str) -> std::result::Result<&'static str, ToolError> {
    match filter.trim().to_uppercase().replace(['_', ' '], "").as_str() {
        "PRIMARYKEY" | "P" => Ok("p"),
        "FOREIGNKEY" | "F" => Ok("f"),
        "UNIQUE" | "U" => Ok("u"),
        "CHECK" | "C" => Ok("c"),
        "EXCLUDE" | "X" => Ok("x"),
        _ => Err(ToolError::invalid(format!(
            "Invalid constraintType '{}'. Expected one of: primary_key, foreign_key, unique, check, exclude",
            filter
        ))),
    }
}

fn trimmed(names: &[String]) -> Vec<&str> {
    names.iter().map(|n| n.trim()).collect()
}

fn deferral(deferrable: bool, initially_deferred: bool) -> &'static str {
    match (deferrable, initially_deferred) {
        (true, true) => " DEFERRABLE INITIALLY DEFERRED",
        (true, false) => " DEFERRABLE",
        (false, _) => "",
    }
}

pub fn create_fk_sql(args: &CreateForeignKey) -> std::result::Result<String, ToolError> {
    if args.column_names.len() != args.referenced_columns.len() {
        return Err(ToolError::invalid(format!(
            "columnNames has {} column(s) but referencedColumns has {}",
            args.column_names.len(),
            args.referenced_columns.len()
        )));
    }
    let schema = schema_or_default(args.schema.as_deref());
    let referenced_schema = args
        .referenced_schema
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(schema);

    let on_update = validate_keyword(
        "onUpdate",
        args.on_update.as_deref().unwrap_or("NO ACTION"),
        REFERENTIAL_ACTIONS,
    )?;
    let on_delete = validate_keyword(
        "onDelete",
        args.on_delete.as_deref().unwrap_or("NO ACTION"),
        REFERENTIAL_ACTIONS,
    )?;

    Ok(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {}{}",
        quote_qualified(schema, args.table_name.trim())?,
        quote_ident(args.constraint_name.trim())?,
        quote_ident_list(&trimmed(&args.column_names))?,
        quote_qualified(referenced_schema, args.referenced_table.trim())?,
        quote_ident_list(&trimmed(&args.referenced_columns))?,
        on_update,
        on_delete,
        deferral(args.deferrable, args.initially_deferred)
    ))
}

pub fn create_constraint_sql(args: &CreateConstraint) -> std::result::Result<String, ToolError> {
    let kind = validate_keyword(
        "constraintType",
        &args.constraint_type.replace(' ', "_"),
        CONSTRAINT_TYPES,
    )?;

    let body = match kind {
        "CHECK" => {
            let Some(expression) = args.check_expression.as_deref().filter(|e| !e.trim().is_empty())
            else {
                return Err(ToolError::MissingArgument {
                    operation: "create".into(),
                    fields: vec!["checkExpression"],
                });
            };
            format!("CHECK ({})", validate_fragment("checkExpression", expression)?)
        }
        _ => {
            if args.column_names.is_empty() {
                return Err(ToolError::MissingArgument {
                    operation: "create".into(),
                    fields: vec!["columnNames"],
                });
            }
            let keyword = if kind == "UNIQUE" { "UNIQUE" } else { "PRIMARY KEY" };
            format!("{} ({})", keyword, quote_ident_list(&trimmed(&args.column_names))?)
        }
    };

    Ok(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {}{}",
        quote_qualified(schema_or_default(args.schema.as_deref()), args.table_name.trim())?,
        quote_ident(args.constraint_name.trim())?,
        body,
        deferral(args.deferrable && kind != "CHECK", false)
    ))
}

pub fn drop_constraint_sql(args: &DropConstraint) -> std::result::Result<String, ToolError> {
    Ok(format!(
        "ALTER TABLE {} DROP CONSTRAINT {}{}{}",
        quote_qualified(schema_or_default(args.schema.as_deref()), args.table_name.trim())?,
        if args.if_exists { "IF EXISTS " } else { "" },
        quote_ident(args.constraint_name.trim())?,
        if args.cascade { " CASCADE" } else { "" }
    ))
}

async fn get_constraints(conn: &ConnectionHandle, args: GetConstraints) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let table = args.table_name.as_deref().map(str::trim);
    let kind = args
        .constraint_type
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(contype)
        .transpose()?;
    let rows = conn
        .query_json(GET_CONSTRAINTS_SQL, &[&schema, &table, &kind])
        .await?;
    Ok(OperationOutcome::rows(
        format!("Found {} constraint(s) in schema {}", rows.len(), schema),
        rows,
    ))
}

async fn create_fk(conn: &ConnectionHandle, args: CreateForeignKey) -> Result<OperationOutcome> {
    let sql = create_fk_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    info!("Created foreign key {} on {}", args.constraint_name.trim(), args.table_name.trim());
    Ok(OperationOutcome::ok(
        format!("Foreign key {} created successfully", args.constraint_name.trim()),
        json!({
            "constraint": args.constraint_name.trim(),
            "table": args.table_name.trim(),
            "columns": args.column_names,
            "referencedTable": args.referenced_table.trim(),
            "referencedColumns": args.referenced_columns
        }),
    ))
}

async fn create_constraint(conn: &ConnectionHandle, args: CreateConstraint) -> Result<OperationOutcome> {
    let sql = create_constraint_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    info!("Created constraint {} on {}", args.constraint_name.trim(), args.table_name.trim());
    Ok(OperationOutcome::ok(
        format!("Constraint {} created successfully", args.constraint_name.trim()),
        json!({
            "constraint": args.constraint_name.trim(),
            "table": args.table_name.trim(),
            "constraintType": args.constraint_type.trim().to_lowercase()
        }),
    ))
}

async fn drop_constraint(conn: &ConnectionHandle, args: DropConstraint) -> Result<OperationOutcome> {
    let sql = drop_constraint_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    info!("Dropped constraint {} on {}", args.constraint_name.trim(), args.table_name.trim());
    Ok(OperationOutcome::ok(
        format!("Constraint {} dropped successfully", args.constraint_name.trim()),
        json!({
            "constraint": args.constraint_name.trim(),
            "table": args.table_name.trim(),
            "cascade": args.cascade
        }),
    ))
}

pub struct ManageConstraintsTool;

#[async_trait]
impl ToolHandler for ManageConstraintsTool {
    fn definition(&self) -> Tool {
        wide_tool::<ConstraintOperation>(
            "Manage table constraints: list them, create and drop foreign keys, and create or \
            drop unique, check and primary key constraints.",
            json!({
                "tableName": {"type": "string"},
                "schema": {"type": "string", "description": "Schema name (default: public)"},
                "constraintName": {"type": "string"},
                "constraintType": {
                    "type": "string",
                    "description": "Filter for get (primary_key, foreign_key, unique, check, exclude) or kind for create (unique, check, primary_key)"
                },
                "columnNames": {"type": "array", "items": {"type": "string"}},
                "referencedTable": {"type": "string"},
                "referencedSchema": {"type": "string", "description": "Defaults to schema"},
                "referencedColumns": {"type": "array", "items": {"type": "string"}},
                "onUpdate": {"type": "string", "enum": REFERENTIAL_ACTIONS},
                "onDelete": {"type": "string", "enum": REFERENTIAL_ACTIONS},
                "checkExpression": {"type": "string"},
                "deferrable": {"type": "boolean"},
                "initiallyDeferred": {"type": "boolean"},
                "ifExists": {"type": "boolean"},
                "cascade": {"type": "boolean"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_manage_constraints"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: ConstraintOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match operation {
            ConstraintOperation::Get(a) => get_constraints(&conn, a).await?,
            ConstraintOperation::CreateFk(a) => create_fk(&conn, a).await?,
            ConstraintOperation::Create(a) => create_constraint(&conn, a).await?,
            ConstraintOperation::DropFk(a) | ConstraintOperation::Drop(a) => {
                drop_constraint(&conn, a).await?
            }
        };
        Ok(outcome.into_result())
    }
}
