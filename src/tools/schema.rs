//! `pg_manage_schema`: table and enum inspection plus table DDL.

use crate::database::{ConnectionHandle, Statement};
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::security::{
    quote_ident, quote_ident_list, quote_literal, quote_qualified, validate_fragment,
    validate_type_expr,
};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{
    Arguments, OperationOutcome, OperationSet, operation_args, route, schema_or_default,
    unknown_operation, wide_tool,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

const TABLES_SQL: &str = r#"
    SELECT
        t.table_name::text AS table_name,
        t.table_type::text AS table_type,
        obj_description(c.oid, 'pg_class') AS comment,
        c.reltuples::bigint AS estimated_rows,
        pg_size_pretty(pg_total_relation_size(c.oid)) AS total_size
    FROM information_schema.tables t
    JOIN pg_namespace n ON n.nspname = t.table_schema
    JOIN pg_class c ON c.relname = t.table_name AND c.relnamespace = n.oid
    WHERE t.table_schema = $1
    ORDER BY t.table_name
"#;

const COLUMNS_SQL: &str = r#"
    SELECT
        column_name::text AS column_name,
        data_type::text AS data_type,
        udt_name::text AS udt_name,
        is_nullable::text = 'YES' AS nullable,
        column_default::text AS default_value,
        character_maximum_length::int AS max_length,
        numeric_precision::int AS numeric_precision,
        numeric_scale::int AS numeric_scale,
        ordinal_position::int AS position
    FROM information_schema.columns
    WHERE table_schema = $1 AND table_name = $2
    ORDER BY ordinal_position
"#;

const TABLE_CONSTRAINTS_SQL: &str = r#"
    SELECT
        con.conname AS name,
        CASE con.contype
            WHEN 'p' THEN 'PRIMARY KEY'
            WHEN 'f' THEN 'FOREIGN KEY'
            WHEN 'u' THEN 'UNIQUE'
            WHEN 'c' THEN 'CHECK'
            WHEN 'x' THEN 'EXCLUDE'
            ELSE con.contype::text
        END AS constraint_type,
        pg_get_constraintdef(con.oid) AS definition
    FROM pg_constraint con
    JOIN pg_class c ON c.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2
    ORDER BY con.conname
"#;

const TABLE_INDEXES_SQL: &str = r#"
    SELECT indexname AS name, indexdef AS definition
    FROM pg_indexes
    WHERE schemaname = $1 AND tablename = $2
    ORDER BY indexname
"#;

const ENUMS_SQL: &str = r#"
    SELECT
        n.nspname AS schema,
        t.typname AS enum_name,
        array_agg(e.enumlabel ORDER BY e.enumsortorder)::text[] AS "values"
    FROM pg_type t
    JOIN pg_enum e ON e.enumtypid = t.oid
    JOIN pg_namespace n ON n.oid = t.typnamespace
    WHERE n.nspname = $1
      AND ($2::text IS NULL OR t.typname = $2)
    GROUP BY n.nspname, t.typname
    ORDER BY t.typname
"#;

const TYPE_EXISTS_SQL: &str = r#"
    SELECT EXISTS (
        SELECT 1 FROM pg_type t
        JOIN pg_namespace n ON n.oid = t.typnamespace
        WHERE n.nspname = $1 AND t.typname = $2
    ) AS present
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetInfo {
    pub table_name: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    pub default: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTable {
    pub table_name: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default)]
    pub if_not_exists: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub column_name: Option<String>,
    pub data_type: Option<String>,
    pub nullable: Option<bool>,
    pub default: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterTable {
    pub table_name: String,
    pub operations: Vec<AlterItem>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEnums {
    pub enum_name: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnum {
    pub enum_name: String,
    pub values: Vec<String>,
    #[serde(default)]
    pub if_not_exists: bool,
    pub schema: Option<String>,
}

fn default_true() -> bool {
    true
}

operation_args! {
    GetInfo => [],
    CreateTable => ["tableName", "columns"],
    AlterTable => ["tableName", "operations"],
    GetEnums => [],
    CreateEnum => ["enumName", "values"],
}

#[derive(Debug)]
pub enum SchemaOperation {
    GetInfo(GetInfo),
    CreateTable(CreateTable),
    AlterTable(AlterTable),
    GetEnums(GetEnums),
    CreateEnum(CreateEnum),
}

impl OperationSet for SchemaOperation {
    const TOOL: &'static str = "pg_manage_schema";
    const OPERATIONS: &'static [&'static str] =
        &["get_info", "create_table", "alter_table", "get_enums", "create_enum"];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "get_info" => args.extract(operation).map(Self::GetInfo),
            "create_table" => args.extract(operation).map(Self::CreateTable),
            "alter_table" => args.extract(operation).map(Self::AlterTable),
            "get_enums" => args.extract(operation).map(Self::GetEnums),
            "create_enum" => args.extract(operation).map(Self::CreateEnum),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

fn column_sql(column: &ColumnDefinition) -> std::result::Result<String, ToolError> {
    let mut sql = format!(
        "{} {}",
        quote_ident(column.name.trim())?,
        validate_type_expr(&column.data_type)?
    );
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = column.default.as_deref().filter(|d| !d.trim().is_empty()) {
        sql.push_str(&format!(" DEFAULT {}", validate_fragment("default", default)?));
    }
    Ok(sql)
}

pub fn create_table_sql(args: &CreateTable) -> std::result::Result<String, ToolError> {
    let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table_name.trim())?;

    let mut definitions = args
        .columns
        .iter()
        .map(column_sql)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let primary_key: Vec<&str> = args
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.trim())
        .collect();
    if !primary_key.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", quote_ident_list(&primary_key)?));
    }

    Ok(format!(
        "CREATE TABLE {}{} ({})",
        if args.if_not_exists { "IF NOT EXISTS " } else { "" },
        table,
        definitions.join(", ")
    ))
}

/// Statements for one `alter_table` call; every invalid item is reported at once.
pub fn alter_table_statements(args: &AlterTable) -> std::result::Result<Vec<String>, ToolError> {
    let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table_name.trim())?;
    let prefix = format!("ALTER TABLE {}", table);

    let mut statements = Vec::new();
    let mut problems = Vec::new();
    for (position, item) in args.operations.iter().enumerate() {
        match alter_item_clauses(item) {
            Ok(clauses) => statements.extend(
                clauses
                    .into_iter()
                    .map(|clause| format!("{} {}", prefix, clause)),
            ),
            Err(ToolError::InvalidArguments(reason)) => {
                problems.push(format!("operations[{}]: {}", position, reason))
            }
            Err(other) => problems.push(format!("operations[{}]: {}", position, other)),
        }
    }

    if !problems.is_empty() {
        return Err(ToolError::invalid(problems.join("; ")));
    }
    Ok(statements)
}

fn alter_item_clauses(item: &AlterItem) -> std::result::Result<Vec<String>, ToolError> {
    let Some(column_name) = item.column_name.as_deref().map(str::trim).filter(|c| !c.is_empty())
    else {
        return Err(ToolError::invalid("columnName is required"));
    };
    let column = quote_ident(column_name)?;

    match item.kind.trim().to_lowercase().as_str() {
        "add" => {
            let Some(data_type) = item.data_type.as_deref() else {
                return Err(ToolError::invalid("dataType is required for add"));
            };
            let definition = column_sql(&ColumnDefinition {
                name: column_name.to_string(),
                data_type: data_type.to_string(),
                nullable: item.nullable.unwrap_or(true),
                default: item.default.clone(),
                primary_key: false,
            })?;
            Ok(vec![format!("ADD COLUMN {}", definition)])
        }
        "alter" => {
            let mut clauses = Vec::new();
            if let Some(data_type) = item.data_type.as_deref() {
                let data_type = validate_type_expr(data_type)?;
                clauses.push(format!(
                    "ALTER COLUMN {} TYPE {} USING {}::{}",
                    column, data_type, column, data_type
                ));
            }
            match item.nullable {
                Some(true) => clauses.push(format!("ALTER COLUMN {} DROP NOT NULL", column)),
                Some(false) => clauses.push(format!("ALTER COLUMN {} SET NOT NULL", column)),
                None => {}
            }
            match item.default.as_deref().map(str::trim) {
                Some("") => clauses.push(format!("ALTER COLUMN {} DROP DEFAULT", column)),
                Some(default) => clauses.push(format!(
                    "ALTER COLUMN {} SET DEFAULT {}",
                    column,
                    validate_fragment("default", default)?
                )),
                None => {}
            }
            if clauses.is_empty() {
                return Err(ToolError::invalid(
                    "alter needs at least one of dataType, nullable or default",
                ));
            }
            Ok(clauses)
        }
        "drop" => Ok(vec![format!("DROP COLUMN {}", column)]),
        other => Err(ToolError::invalid(format!(
            "Invalid type '{}'. Expected one of: add, alter, drop",
            other
        ))),
    }
}

pub fn create_enum_sql(args: &CreateEnum) -> std::result::Result<String, ToolError> {
    let name = quote_qualified(schema_or_default(args.schema.as_deref()), args.enum_name.trim())?;
    let labels = args
        .values
        .iter()
        .map(|value| quote_literal(value))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(format!("CREATE TYPE {} AS ENUM ({})", name, labels.join(", ")))
}

async fn get_info(conn: &ConnectionHandle, args: GetInfo) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());

    let Some(table) = args.table_name.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
        let tables = conn.query_json(TABLES_SQL, &[&schema]).await?;
        return Ok(OperationOutcome::rows(
            format!("Found {} table(s) in schema {}", tables.len(), schema),
            tables,
        ));
    };

    let columns = conn.query_json(COLUMNS_SQL, &[&schema, &table]).await?;
    if columns.is_empty() {
        return Err(ToolError::ExecutionFailed(format!(
            "Table {}.{} does not exist or has no columns",
            schema, table
        ))
        .into());
    }
    let constraints = conn.query_json(TABLE_CONSTRAINTS_SQL, &[&schema, &table]).await?;
    let indexes = conn.query_json(TABLE_INDEXES_SQL, &[&schema, &table]).await?;

    Ok(OperationOutcome::ok(
        format!("Schema of {}.{}", schema, table),
        json!({
            "schema": schema,
            "table": table,
            "columns": columns,
            "constraints": constraints,
            "indexes": indexes
        }),
    ))
}

async fn create_table(conn: &ConnectionHandle, args: CreateTable) -> Result<OperationOutcome> {
    let sql = create_table_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    let schema = schema_or_default(args.schema.as_deref());
    info!("Created table {}.{}", schema, args.table_name.trim());
    Ok(OperationOutcome::ok(
        format!("Table {} created successfully", args.table_name.trim()),
        json!({
            "table": args.table_name.trim(),
            "schema": schema,
            "columns": args.columns.iter().map(|c| c.name.trim()).collect::<Vec<_>>()
        }),
    ))
}

async fn alter_table(conn: &ConnectionHandle, args: AlterTable) -> Result<OperationOutcome> {
    let statements: Vec<Statement> = alter_table_statements(&args)?
        .into_iter()
        .map(Statement::execute)
        .collect();
    conn.run_in_transaction(&statements).await?;

    let schema = schema_or_default(args.schema.as_deref());
    info!(
        "Altered table {}.{} ({} statement(s))",
        schema,
        args.table_name.trim(),
        statements.len()
    );
    Ok(OperationOutcome::ok(
        format!("Table {} altered successfully", args.table_name.trim()),
        json!({
            "table": args.table_name.trim(),
            "schema": schema,
            "statements": statements.iter().map(|s| s.sql.as_str()).collect::<Vec<_>>()
        }),
    ))
}

async fn get_enums(conn: &ConnectionHandle, args: GetEnums) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let name = args.enum_name.as_deref().map(str::trim);
    let rows = conn.query_json(ENUMS_SQL, &[&schema, &name]).await?;
    Ok(OperationOutcome::rows(
        format!("Found {} enum type(s) in schema {}", rows.len(), schema),
        rows,
    ))
}

async fn create_enum(conn: &ConnectionHandle, args: CreateEnum) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let name = args.enum_name.trim();
    let sql = create_enum_sql(&args)?;

    if args.if_not_exists {
        let exists = conn
            .query_one_json(TYPE_EXISTS_SQL, &[&schema, &name])
            .await?
            .and_then(|row| row.get("present").and_then(Value::as_bool))
            .unwrap_or(false);
        if exists {
            return Ok(OperationOutcome::ok(
                format!("Enum type {} already exists", name),
                json!({"enum": name, "schema": schema, "created": false}),
            ));
        }
    }

    conn.execute_ddl(&sql).await?;
    info!("Created enum type {}.{}", schema, name);
    Ok(OperationOutcome::ok(
        format!("Enum type {} created successfully", name),
        json!({"enum": name, "schema": schema, "values": args.values, "created": true}),
    ))
}

pub struct ManageSchemaTool;

#[async_trait]
impl ToolHandler for ManageSchemaTool {
    fn definition(&self) -> Tool {
        wide_tool::<SchemaOperation>(
            "Inspect and change table structure: list tables or describe one, create and alter \
            tables, list and create enum types.",
            json!({
                "tableName": {"type": "string", "description": "Table name"},
                "schema": {"type": "string", "description": "Schema name (default: public)"},
                "columns": {
                    "type": "array",
                    "description": "Column definitions for create_table",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "type": {"type": "string"},
                            "nullable": {"type": "boolean"},
                            "default": {"type": "string"},
                            "primaryKey": {"type": "boolean"}
                        },
                        "required": ["name", "type"]
                    }
                },
                "operations": {
                    "type": "array",
                    "description": "Column changes for alter_table, applied in one transaction",
                    "items": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": ["add", "alter", "drop"]},
                            "columnName": {"type": "string"},
                            "dataType": {"type": "string"},
                            "nullable": {"type": "boolean"},
                            "default": {"type": "string", "description": "Empty string drops the default"}
                        },
                        "required": ["type", "columnName"]
                    }
                },
                "enumName": {"type": "string"},
                "values": {"type": "array", "items": {"type": "string"}},
                "ifNotExists": {"type": "boolean"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_manage_schema"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: SchemaOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match operation {
            SchemaOperation::GetInfo(a) => get_info(&conn, a).await?,
            SchemaOperation::CreateTable(a) => create_table(&conn, a).await?,
            SchemaOperation::AlterTable(a) => alter_table(&conn, a).await?,
            SchemaOperation::GetEnums(a) => get_enums(&conn, a).await?,
            SchemaOperation::CreateEnum(a) => create_enum(&conn, a).await?,
        };
        Ok(outcome.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> std::result::Result<SchemaOperation, ToolError> {
        route(&Arguments::new(value).unwrap())
    }

    #[test]
    fn test_create_table_sql() {
        let SchemaOperation::CreateTable(args) = parse(json!({
            "operation": "create_table",
            "tableName": "accounts",
            "ifNotExists": true,
            "columns": [
                {"name": "id", "type": "bigint", "nullable": false, "primaryKey": true},
                {"name": "email", "type": "varchar(255)", "nullable": false},
                {"name": "created_at", "type": "timestamp with time zone", "default": "now()"}
            ]
        }))
        .unwrap() else {
            panic!("expected create_table");
        };
        assert_eq!(
            create_table_sql(&args).unwrap(),
            "CREATE TABLE IF NOT EXISTS \"public\".\"accounts\" (\"id\" bigint NOT NULL, \
            \"email\" varchar(255) NOT NULL, \"created_at\" timestamp with time zone DEFAULT now(), \
            PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_create_table_rejects_bad_type() {
        let SchemaOperation::CreateTable(args) = parse(json!({
            "operation": "create_table",
            "tableName": "t",
            "columns": [{"name": "a", "type": "int); DROP TABLE x; --"}]
        }))
        .unwrap() else {
            panic!("expected create_table");
        };
        assert!(create_table_sql(&args).is_err());
    }

    #[test]
    fn test_alter_table_statements() {
        let SchemaOperation::AlterTable(args) = parse(json!({
            "operation": "alter_table",
            "tableName": "accounts",
            "operations": [
                {"type": "add", "columnName": "nickname", "dataType": "text"},
                {"type": "alter", "columnName": "email", "nullable": true, "default": ""},
                {"type": "drop", "columnName": "legacy"}
            ]
        }))
        .unwrap() else {
            panic!("expected alter_table");
        };
        assert_eq!(
            alter_table_statements(&args).unwrap(),
            vec![
                "ALTER TABLE \"public\".\"accounts\" ADD COLUMN \"nickname\" text",
                "ALTER TABLE \"public\".\"accounts\" ALTER COLUMN \"email\" DROP NOT NULL",
                "ALTER TABLE \"public\".\"accounts\" ALTER COLUMN \"email\" DROP DEFAULT",
                "ALTER TABLE \"public\".\"accounts\" DROP COLUMN \"legacy\"",
            ]
        );
    }

    #[test]
    fn test_alter_table_reports_every_bad_item() {
        let SchemaOperation::AlterTable(args) = parse(json!({
            "operation": "alter_table",
            "tableName": "accounts",
            "operations": [
                {"type": "add", "columnName": "a"},
                {"type": "drop", "columnName": "ok"},
                {"type": "rename", "columnName": "b"}
            ]
        }))
        .unwrap() else {
            panic!("expected alter_table");
        };
        let message = alter_table_statements(&args).unwrap_err().to_string();
        assert!(message.contains("operations[0]"), "{message}");
        assert!(message.contains("operations[2]"), "{message}");
        assert!(!message.contains("operations[1]"), "{message}");
    }

    #[test]
    fn test_create_enum_sql_quotes_labels() {
        let SchemaOperation::CreateEnum(args) = parse(json!({
            "operation": "create_enum",
            "enumName": "mood",
            "values": ["happy", "it's fine"]
        }))
        .unwrap() else {
            panic!("expected create_enum");
        };
        assert_eq!(
            create_enum_sql(&args).unwrap(),
            "CREATE TYPE \"public\".\"mood\" AS ENUM ('happy', 'it''s fine')"
        );
    }

    #[test]
    fn test_create_enum_requires_values() {
        let err = parse(json!({"operation": "create_enum", "enumName": "mood", "values": []}))
            .unwrap_err();
        assert!(err.to_string().ends_with("values"));
    }
}
