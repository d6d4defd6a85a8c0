//! `pg_manage_triggers`: list, create, drop, enable and disable triggers.

use crate::database::ConnectionHandle;
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::security::{quote_ident, quote_qualified, validate_fragment, validate_keyword};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{
    Arguments, OperationOutcome, OperationSet, operation_args, route, schema_or_default,
    unknown_operation, wide_tool,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

const TIMINGS: &[&str] = &["BEFORE", "AFTER", "INSTEAD OF"];
const EVENTS: &[&str] = &["INSERT", "UPDATE", "DELETE", "TRUNCATE"];
const FOR_EACH: &[&str] = &["ROW", "STATEMENT"];

const GET_TRIGGERS_SQL: &str = r#"
    SELECT
        t.tgname AS trigger_name,
        c.relname AS table_name,
        n.nspname AS schema,
        p.proname AS function_name,
        pn.nspname AS function_schema,
        CASE t.tgenabled
            WHEN 'O' THEN 'ENABLED'
            WHEN 'D' THEN 'DISABLED'
            WHEN 'R' THEN 'REPLICA'
            WHEN 'A' THEN 'ALWAYS'
        END AS state,
        pg_get_triggerdef(t.oid) AS definition
    FROM pg_trigger t
    JOIN pg_class c ON c.oid = t.tgrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_proc p ON p.oid = t.tgfoid
    JOIN pg_namespace pn ON pn.oid = p.pronamespace
    WHERE NOT t.tgisinternal
      AND n.nspname = $1
      AND ($2::text IS NULL OR c.relname = $2)
    ORDER BY c.relname, t.tgname
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTriggers {
    pub table_name: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTrigger {
    pub trigger_name: String,
    pub table_name: String,
    pub function_name: String,
    pub function_schema: Option<String>,
    pub timing: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
    pub for_each: Option<String>,
    pub when: Option<String>,
    #[serde(default)]
    pub replace: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropTrigger {
    pub trigger_name: String,
    pub table_name: String,
    #[serde(default = "default_true")]
    pub if_exists: bool,
    #[serde(default)]
    pub cascade: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTriggerState {
    pub trigger_name: String,
    pub table_name: String,
    pub enable: bool,
    pub schema: Option<String>,
}

fn default_true() -> bool {
    true
}

operation_args! {
    GetTriggers => [],
    CreateTrigger => ["triggerName", "tableName", "functionName"],
    DropTrigger => ["triggerName", "tableName"],
    SetTriggerState => ["triggerName", "tableName", "enable"],
}

#[derive(Debug)]
pub enum TriggerOperation {
    Get(GetTriggers),
    Create(CreateTrigger),
    Drop(DropTrigger),
    SetState(SetTriggerState),
}

impl OperationSet for TriggerOperation {
    const TOOL: &'static str = "pg_manage_triggers";
    const OPERATIONS: &'static [&'static str] = &["get", "create", "drop", "set_state"];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "get" => args.extract(operation).map(Self::Get),
            "create" => args.extract(operation).map(Self::Create),
            "drop" => args.extract(operation).map(Self::Drop),
            "set_state" => args.extract(operation).map(Self::SetState),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

pub fn create_trigger_sql(args: &CreateTrigger) -> std::result::Result<String, ToolError> {
    let schema = schema_or_default(args.schema.as_deref());
    let trigger = quote_ident(args.trigger_name.trim())?;
    let table = quote_qualified(schema, args.table_name.trim())?;
    let function = quote_qualified(
        schema_or_default(args.function_schema.as_deref().or(args.schema.as_deref())),
        args.function_name.trim(),
    )?;
    let timing = validate_keyword("timing", args.timing.as_deref().unwrap_or("AFTER"), TIMINGS)?;
    let for_each = validate_keyword("forEach", args.for_each.as_deref().unwrap_or("ROW"), FOR_EACH)?;

    let events = if args.events.is_empty() {
        vec!["INSERT"]
    } else {
        args.events
            .iter()
            .map(|event| validate_keyword("event", event, EVENTS))
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut sql = format!(
        "CREATE {}TRIGGER {} {} {} ON {} FOR EACH {}",
        if args.replace { "OR REPLACE " } else { "" },
        trigger,
        timing,
        events.join(" OR "),
        table,
        for_each
    );
    if let Some(condition) = args.when.as_deref().filter(|w| !w.trim().is_empty()) {
        sql.push_str(&format!(" WHEN ({})", validate_fragment("when condition", condition)?));
    }
    sql.push_str(&format!(" EXECUTE FUNCTION {}()", function));
    Ok(sql)
}

pub fn drop_trigger_sql(args: &DropTrigger) -> std::result::Result<String, ToolError> {
    let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table_name.trim())?;
    Ok(format!(
        "DROP TRIGGER {}{} ON {}{}",
        if args.if_exists { "IF EXISTS " } else { "" },
        quote_ident(args.trigger_name.trim())?,
        table,
        if args.cascade { " CASCADE" } else { "" }
    ))
}

pub fn set_state_sql(args: &SetTriggerState) -> std::result::Result<String, ToolError> {
    let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table_name.trim())?;
    Ok(format!(
        "ALTER TABLE {} {} TRIGGER {}",
        table,
        if args.enable { "ENABLE" } else { "DISABLE" },
        quote_ident(args.trigger_name.trim())?
    ))
}

async fn get_triggers(conn: &ConnectionHandle, args: GetTriggers) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let table = args.table_name.as_deref().map(str::trim);
    let rows = conn.query_json(GET_TRIGGERS_SQL, &[&schema, &table]).await?;
    Ok(OperationOutcome::rows(
        format!("Found {} trigger(s) in schema {}", rows.len(), schema),
        rows,
    ))
}

async fn create_trigger(conn: &ConnectionHandle, args: CreateTrigger) -> Result<OperationOutcome> {
    let sql = create_trigger_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    let schema = schema_or_default(args.schema.as_deref());
    info!("Created trigger {} on {}.{}", args.trigger_name.trim(), schema, args.table_name.trim());
    Ok(OperationOutcome::ok(
        format!("Trigger {} created successfully", args.trigger_name.trim()),
        json!({
            "trigger": args.trigger_name.trim(),
            "table": args.table_name.trim(),
            "schema": schema,
            "function": args.function_name.trim(),
            "replaced": args.replace
        }),
    ))
}

async fn drop_trigger(conn: &ConnectionHandle, args: DropTrigger) -> Result<OperationOutcome> {
    let sql = drop_trigger_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    info!("Dropped trigger {}", args.trigger_name.trim());
    Ok(OperationOutcome::ok(
        format!("Trigger {} dropped successfully", args.trigger_name.trim()),
        json!({
            "trigger": args.trigger_name.trim(),
            "table": args.table_name.trim(),
            "schema": schema_or_default(args.schema.as_deref())
        }),
    ))
}

async fn set_state(conn: &ConnectionHandle, args: SetTriggerState) -> Result<OperationOutcome> {
    let sql = set_state_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    let state = if args.enable { "enabled" } else { "disabled" };
    Ok(OperationOutcome::ok(
        format!("Trigger {} {}", args.trigger_name.trim(), state),
        json!({
            "trigger": args.trigger_name.trim(),
            "table": args.table_name.trim(),
            "enabled": args.enable
        }),
    ))
}

pub struct ManageTriggersTool;

#[async_trait]
impl ToolHandler for ManageTriggersTool {
    fn definition(&self) -> Tool {
        wide_tool::<TriggerOperation>(
            "Manage PostgreSQL triggers: list, create, drop, enable and disable them.",
            json!({
                "tableName": {"type": "string", "description": "Table name"},
                "schema": {"type": "string", "description": "Schema name (default: public)"},
                "triggerName": {"type": "string"},
                "functionName": {"type": "string", "description": "Trigger function to execute"},
                "functionSchema": {"type": "string", "description": "Schema of the trigger function (default: schema)"},
                "timing": {"type": "string", "enum": TIMINGS},
                "events": {"type": "array", "items": {"type": "string", "enum": EVENTS}},
                "forEach": {"type": "string", "enum": FOR_EACH},
                "when": {"type": "string", "description": "WHEN condition"},
                "replace": {"type": "boolean", "description": "Use CREATE OR REPLACE (PostgreSQL 14+)"},
                "ifExists": {"type": "boolean"},
                "cascade": {"type": "boolean"},
                "enable": {"type": "boolean", "description": "Target state for set_state"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_manage_triggers"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: TriggerOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match operation {
            TriggerOperation::Get(a) => get_triggers(&conn, a).await?,
            TriggerOperation::Create(a) => create_trigger(&conn, a).await?,
            TriggerOperation::Drop(a) => drop_trigger(&conn, a).await?,
            TriggerOperation::SetState(a) => set_state(&conn, a).await?,
        };
        Ok(outcome.into_result())
    }
}
