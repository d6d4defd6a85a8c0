//! `pg_manage_functions`: inspect, create and drop functions.

use crate::database::ConnectionHandle;
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::security::{
    dollar_quote, quote_ident, quote_qualified, validate_fragment, validate_keyword,
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

const VOLATILITY: &[&str] = &["VOLATILE", "STABLE", "IMMUTABLE"];
const SECURITY: &[&str] = &["INVOKER", "DEFINER"];

const GET_FUNCTIONS_SQL: &str = r#"
    SELECT
        p.proname AS name,
        n.nspname AS schema,
        pg_get_function_arguments(p.oid) AS arguments,
        pg_get_function_result(p.oid) AS return_type,
        l.lanname AS language,
        CASE p.provolatile
            WHEN 'i' THEN 'IMMUTABLE'
            WHEN 's' THEN 'STABLE'
            ELSE 'VOLATILE'
        END AS volatility,
        p.prosecdef AS security_definer,
        pg_get_functiondef(p.oid) AS definition
    FROM pg_proc p
    JOIN pg_namespace n ON n.oid = p.pronamespace
    JOIN pg_language l ON l.oid = p.prolang
    WHERE n.nspname = $1
      AND p.prokind = 'f'
      AND ($2::text IS NULL OR p.proname = $2)
    ORDER BY p.proname, pg_get_function_arguments(p.oid)
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFunctions {
    pub function_name: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFunction {
    pub function_name: String,
    pub return_type: String,
    pub function_body: String,
    #[serde(default)]
    pub parameters: String,
    pub language: Option<String>,
    pub volatility: Option<String>,
    pub security: Option<String>,
    #[serde(default)]
    pub replace: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropFunction {
    pub function_name: String,
    pub parameters: Option<String>,
    #[serde(default = "default_true")]
    pub if_exists: bool,
    #[serde(default)]
    pub cascade: bool,
    pub schema: Option<String>,
}

fn default_true() -> bool {
    true
}

operation_args! {
    GetFunctions => [],
    CreateFunction => ["functionName", "returnType", "functionBody"],
    DropFunction => ["functionName"],
}

#[derive(Debug)]
pub enum FunctionOperation {
    Get(GetFunctions),
    Create(CreateFunction),
    Drop(DropFunction),
}

impl OperationSet for FunctionOperation {
    const TOOL: &'static str = "pg_manage_functions";
    const OPERATIONS: &'static [&'static str] = &["get", "create", "drop"];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "get" => args.extract(operation).map(Self::Get),
            "create" => args.extract(operation).map(Self::Create),
            "drop" => args.extract(operation).map(Self::Drop),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

/// Parameter list of a signature; empty means no parameters.
fn parameter_list(parameters: &str) -> std::result::Result<&str, ToolError> {
    let trimmed = parameters.trim();
    if trimmed.is_empty() {
        Ok("")
    } else {
        validate_fragment("parameters", trimmed)
    }
}

/// Language for a body given without one: a PL/pgSQL block (`BEGIN`, `DECLARE`
/// or a `<<label>>`) is `plpgsql`, a bare query is `sql`.
fn default_language(body: &str) -> &'static str {
    let head = body.trim_start();
    let opens_block = head.starts_with("<<")
        || ["begin", "declare"].iter().any(|keyword| {
            head.get(..keyword.len())
                .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
                && !head[keyword.len()..].starts_with(|c: char| c.is_alphanumeric() || c == '_')
        });
    if opens_block { "plpgsql" } else { "sql" }
}

pub fn create_function_sql(args: &CreateFunction) -> std::result::Result<String, ToolError> {
    let schema = schema_or_default(args.schema.as_deref());
    let name = quote_qualified(schema, args.function_name.trim())?;
    let parameters = parameter_list(&args.parameters)?;
    let return_type = validate_type_expr(&args.return_type)?;
    let language = quote_ident(
        &args
            .language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| default_language(&args.function_body))
            .to_lowercase(),
    )?;
    let volatility = validate_keyword(
        "volatility",
        args.volatility.as_deref().unwrap_or("VOLATILE"),
        VOLATILITY,
    )?;
    let security = validate_keyword(
        "security",
        args.security.as_deref().unwrap_or("INVOKER"),
        SECURITY,
    )?;

    Ok(format!(
        "CREATE {}FUNCTION {}({}) RETURNS {} LANGUAGE {} {} SECURITY {} AS {}",
        if args.replace { "OR REPLACE " } else { "" },
        name,
        parameters,
        return_type,
        language,
        volatility,
        security,
        dollar_quote(&args.function_body)
    ))
}

pub fn drop_function_sql(args: &DropFunction) -> std::result::Result<String, ToolError> {
    let schema = schema_or_default(args.schema.as_deref());
    let name = quote_qualified(schema, args.function_name.trim())?;
    let signature = match args.parameters.as_deref() {
        Some(parameters) => format!("({})", parameter_list(parameters)?),
        None => String::new(),
    };
    Ok(format!(
        "DROP FUNCTION {}{}{}{}",
        if args.if_exists { "IF EXISTS " } else { "" },
        name,
        signature,
        if args.cascade { " CASCADE" } else { "" }
    ))
}

async fn get_functions(conn: &ConnectionHandle, args: GetFunctions) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let name = args.function_name.as_deref().map(str::trim);
    let rows = conn.query_json(GET_FUNCTIONS_SQL, &[&schema, &name]).await?;
    Ok(OperationOutcome::rows(
        format!("Found {} function(s) in schema {}", rows.len(), schema),
        rows,
    ))
}

async fn create_function(conn: &ConnectionHandle, args: CreateFunction) -> Result<OperationOutcome> {
    let sql = create_function_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    let schema = schema_or_default(args.schema.as_deref());
    let name = args.function_name.trim();
    info!("Created function {}.{}", schema, name);
    Ok(OperationOutcome::ok(
        format!("Function {} created successfully", name),
        json!({
            "name": name,
            "schema": schema,
            "kind": "function",
            "parameters": args.parameters.trim(),
            "returnType": args.return_type.trim(),
            "replaced": args.replace
        }),
    ))
}

async fn drop_function(conn: &ConnectionHandle, args: DropFunction) -> Result<OperationOutcome> {
    let sql = drop_function_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    let schema = schema_or_default(args.schema.as_deref());
    let name = args.function_name.trim();
    info!("Dropped function {}.{}", schema, name);
    Ok(OperationOutcome::ok(
        format!("Function {} dropped successfully", name),
        json!({"name": name, "schema": schema, "kind": "function", "cascade": args.cascade}),
    ))
}

pub struct ManageFunctionsTool;

#[async_trait]
impl ToolHandler for ManageFunctionsTool {
    fn definition(&self) -> Tool {
        wide_tool::<FunctionOperation>(
            "Manage PostgreSQL functions: list them with their definitions, create or replace \
            them, and drop them.",
            json!({
                "functionName": {"type": "string", "description": "Function name (required for create and drop)"},
                "schema": {"type": "string", "description": "Schema name (default: public)"},
                "parameters": {"type": "string", "description": "Parameter list, e.g. 'a integer, b text'"},
                "returnType": {"type": "string", "description": "Return type (required for create)"},
                "functionBody": {"type": "string", "description": "Function body (required for create)"},
                "language": {"type": "string", "description": "Function language (default: plpgsql for a BEGIN or DECLARE block, otherwise sql)"},
                "volatility": {"type": "string", "enum": VOLATILITY},
                "security": {"type": "string", "enum": SECURITY},
                "replace": {"type": "boolean", "description": "Use CREATE OR REPLACE"},
                "ifExists": {"type": "boolean", "description": "Add IF EXISTS to drop (default: true)"},
                "cascade": {"type": "boolean", "description": "Drop dependent objects"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_manage_functions"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: FunctionOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match operation {
            FunctionOperation::Get(a) => get_functions(&conn, a).await?,
            FunctionOperation::Create(a) => create_function(&conn, a).await?,
            FunctionOperation::Drop(a) => drop_function(&conn, a).await?,
        };
        Ok(outcome.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> std::result::Result<FunctionOperation, ToolError> {
        route(&Arguments::new(value).unwrap())
    }

    fn create_args(value: Value) -> CreateFunction {
        match parse(value).unwrap() {
            FunctionOperation::Create(args) => args,
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[test]
    fn test_create_requires_name_type_and_body() {
        let err = parse(json!({"operation": "create", "parameters": ""})).unwrap_err();
        let message = err.to_string();
        for field in ["functionName", "returnType", "functionBody"] {
            assert!(message.contains(field), "{message}");
        }
    }

    #[test]
    fn test_create_sql() {
        let args = create_args(json!({
            "operation": "create",
            "functionName": "f",
            "parameters": "",
            "returnType": "TEXT",
            "functionBody": "SELECT 1"
        }));
        assert_eq!(
            create_function_sql(&args).unwrap(),
            "CREATE FUNCTION \"public\".\"f\"() RETURNS TEXT LANGUAGE \"sql\" VOLATILE \
            SECURITY INVOKER AS $body$SELECT 1$body$"
        );
    }

    #[test]
    fn test_block_bodies_default_to_plpgsql() {
        for body in [
            "BEGIN RETURN 1; END",
            "  declare n int; begin return n; end",
            "<<outer>> BEGIN RETURN 1; END",
        ] {
            let args = create_args(json!({
                "operation": "create",
                "functionName": "f",
                "returnType": "int",
                "functionBody": body
            }));
            assert!(
                create_function_sql(&args).unwrap().contains("LANGUAGE \"plpgsql\""),
                "{body}"
            );
        }
        for body in ["SELECT 1", "beginning()", "SELECT declare_x FROM t"] {
            assert_eq!(default_language(body), "sql", "{body}");
        }
    }

    #[test]
    fn test_enum_casing_matches_accepted_spelling() {
        let definition = ManageFunctionsTool.definition();
        let properties = &definition.input_schema["properties"];
        assert_eq!(properties["volatility"]["enum"], json!(["VOLATILE", "STABLE", "IMMUTABLE"]));
        assert_eq!(properties["security"]["enum"], json!(["INVOKER", "DEFINER"]));
    }

    #[test]
    fn test_create_sql_options() {
        let args = create_args(json!({
            "operation": "create",
            "functionName": "add",
            "schema": "math",
            "parameters": "a integer, b integer",
            "returnType": "integer",
            "functionBody": "SELECT a + b",
            "language": "sql",
            "volatility": "immutable",
            "security": "definer",
            "replace": true
        }));
        let sql = create_function_sql(&args).unwrap();
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION \"math\".\"add\"(a integer, b integer)"));
        assert!(sql.contains("LANGUAGE \"sql\" IMMUTABLE SECURITY DEFINER"));
    }

    #[test]
    fn test_create_rejects_injected_return_type() {
        let args = create_args(json!({
            "operation": "create",
            "functionName": "f",
            "returnType": "int; DROP TABLE users",
            "functionBody": "SELECT 1"
        }));
        assert!(create_function_sql(&args).is_err());
    }

    #[test]
    fn test_drop_sql() {
        let args = match parse(json!({
            "operation": "drop",
            "functionName": "f",
            "parameters": "integer",
            "cascade": true
        }))
        .unwrap()
        {
            FunctionOperation::Drop(args) => args,
            other => panic!("unexpected operation: {other:?}"),
        };
        assert_eq!(
            drop_function_sql(&args).unwrap(),
            "DROP FUNCTION IF EXISTS \"public\".\"f\"(integer) CASCADE"
        );
    }

    #[test]
    fn test_get_needs_nothing() {
        assert!(matches!(
            parse(json!({"operation": "get"})).unwrap(),
            FunctionOperation::Get(_)
        ));
    }
}
