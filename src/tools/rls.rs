//! `pg_manage_rls`: row-level security switches and policies.

use crate::database::{ConnectionHandle, Statement};
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

const COMMANDS: &[&str] = &["ALL", "SELECT", "INSERT", "UPDATE", "DELETE"];

/// Role names that are keywords rather than identifiers.
const ROLE_KEYWORDS: &[&str] = &["PUBLIC", "CURRENT_USER", "SESSION_USER", "CURRENT_ROLE"];

const GET_POLICIES_SQL: &str = r#"
    SELECT
        p.schemaname AS schema,
        p.tablename AS table_name,
        p.policyname AS policy_name,
        p.permissive,
        p.roles::text[] AS roles,
        p.cmd AS command,
        p.qual AS using_expression,
        p.with_check AS check_expression,
        c.relrowsecurity AS rls_enabled
    FROM pg_policies p
    JOIN pg_namespace n ON n.nspname = p.schemaname
    JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = p.tablename
    WHERE p.schemaname = $1
      AND ($2::text IS NULL OR p.tablename = $2)
    ORDER BY p.tablename, p.policyname
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableTarget {
    pub table_name: String,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePolicy {
    pub table_name: String,
    pub policy_name: String,
    pub using: String,
    pub check: Option<String>,
    pub command: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub replace: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPolicy {
    pub table_name: String,
    pub policy_name: String,
    pub roles: Option<Vec<String>>,
    pub using: Option<String>,
    pub check: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropPolicy {
    pub table_name: String,
    pub policy_name: String,
    #[serde(default = "default_true")]
    pub if_exists: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPolicies {
    pub table_name: Option<String>,
    pub schema: Option<String>,
}

fn default_true() -> bool {
    true
}

operation_args! {
    TableTarget => ["tableName"],
    CreatePolicy => ["tableName", "policyName", "using"],
    EditPolicy => ["tableName", "policyName"],
    DropPolicy => ["tableName", "policyName"],
    GetPolicies => [],
}

#[derive(Debug)]
pub enum RlsOperation {
    Enable(TableTarget),
    Disable(TableTarget),
    CreatePolicy(CreatePolicy),
    EditPolicy(EditPolicy),
    DropPolicy(DropPolicy),
    GetPolicies(GetPolicies),
}

impl OperationSet for RlsOperation {
    const TOOL: &'static str = "pg_manage_rls";
    const OPERATIONS: &'static [&'static str] = &[
        "enable",
        "disable",
        "create_policy",
        "edit_policy",
        "drop_policy",
        "get_policies",
    ];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "enable" => args.extract(operation).map(Self::Enable),
            "disable" => args.extract(operation).map(Self::Disable),
            "create_policy" => args.extract(operation).map(Self::CreatePolicy),
            "edit_policy" => args.extract(operation).map(Self::EditPolicy),
            "drop_policy" => args.extract(operation).map(Self::DropPolicy),
            "get_policies" => args.extract(operation).map(Self::GetPolicies),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

/// A role in a `TO` list: keywords pass through, names are quoted.
fn role_spec(role: &str) -> std::result::Result<String, ToolError> {
    let role = role.trim();
    match ROLE_KEYWORDS
        .iter()
        .find(|keyword| keyword.eq_ignore_ascii_case(role))
    {
        Some(keyword) => Ok((*keyword).to_string()),
        None => quote_ident(role),
    }
}

fn role_list(roles: &[String]) -> std::result::Result<String, ToolError> {
    if roles.is_empty() {
        return Err(ToolError::invalid("roles cannot be empty"));
    }
    roles
        .iter()
        .map(|role| role_spec(role))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(|specs| specs.join(", "))
}

pub fn create_policy_sql(args: &CreatePolicy) -> std::result::Result<String, ToolError> {
    let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table_name.trim())?;
    let policy = quote_ident(args.policy_name.trim())?;
    let command = validate_keyword("command", args.command.as_deref().unwrap_or("ALL"), COMMANDS)?;
    let role = role_spec(args.role.as_deref().unwrap_or("PUBLIC"))?;
    let using = validate_fragment("using expression", &args.using)?;

    let mut sql = format!(
        "CREATE POLICY {} ON {} FOR {} TO {} USING ({})",
        policy, table, command, role, using
    );
    if let Some(check) = args.check.as_deref().filter(|c| !c.trim().is_empty()) {
        sql.push_str(&format!(
            " WITH CHECK ({})",
            validate_fragment("check expression", check)?
        ));
    }
    Ok(sql)
}

/// One `ALTER POLICY` per changed aspect.
pub fn edit_policy_statements(args: &EditPolicy) -> std::result::Result<Vec<String>, ToolError> {
    let table = quote_qualified(schema_or_default(args.schema.as_deref()), args.table_name.trim())?;
    let policy = quote_ident(args.policy_name.trim())?;
    let prefix = format!("ALTER POLICY {} ON {}", policy, table);

    let mut statements = Vec::new();
    if let Some(roles) = &args.roles {
        statements.push(format!("{} TO {}", prefix, role_list(roles)?));
    }
    if let Some(using) = args.using.as_deref().filter(|u| !u.trim().is_empty()) {
        statements.push(format!(
            "{} USING ({})",
            prefix,
            validate_fragment("using expression", using)?
        ));
    }
    if let Some(check) = args.check.as_deref().filter(|c| !c.trim().is_empty()) {
        statements.push(format!(
            "{} WITH CHECK ({})",
            prefix,
            validate_fragment("check expression", check)?
        ));
    }

    if statements.is_empty() {
        return Err(ToolError::invalid(
            "edit_policy needs at least one of roles, using or check",
        ));
    }
    Ok(statements)
}

async fn set_rls(conn: &ConnectionHandle, args: TableTarget, enable: bool) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let table = quote_qualified(schema, args.table_name.trim())?;
    let action = if enable { "ENABLE" } else { "DISABLE" };
    conn.execute_ddl(&format!("ALTER TABLE {} {} ROW LEVEL SECURITY", table, action))
        .await?;

    info!("{} row level security on {}.{}", action, schema, args.table_name.trim());
    Ok(OperationOutcome::ok(
        format!(
            "Row level security {} on {}.{}",
            if enable { "enabled" } else { "disabled" },
            schema,
            args.table_name.trim()
        ),
        json!({
            "table": args.table_name.trim(),
            "schema": schema,
            "rlsEnabled": enable
        }),
    ))
}

async fn create_policy(conn: &ConnectionHandle, args: CreatePolicy) -> Result<OperationOutcome> {
    let sql = create_policy_sql(&args)?;
    let schema = schema_or_default(args.schema.as_deref());

    if args.replace {
        let drop = format!(
            "DROP POLICY IF EXISTS {} ON {}",
            quote_ident(args.policy_name.trim())?,
            quote_qualified(schema, args.table_name.trim())?
        );
        conn.run_in_transaction(&[Statement::execute(drop), Statement::execute(sql)])
            .await?;
    } else {
        conn.execute_ddl(&sql).await?;
    }

    Ok(OperationOutcome::ok(
        format!(
            "Policy {} created on {}.{}",
            args.policy_name.trim(),
            schema,
            args.table_name.trim()
        ),
        json!({
            "policy": args.policy_name.trim(),
            "table": args.table_name.trim(),
            "schema": schema,
            "command": args.command.as_deref().unwrap_or("ALL").to_uppercase(),
            "role": args.role.as_deref().unwrap_or("PUBLIC"),
            "using": args.using.trim(),
            "check": args.check,
            "replaced": args.replace
        }),
    ))
}

async fn edit_policy(conn: &ConnectionHandle, args: EditPolicy) -> Result<OperationOutcome> {
    let statements: Vec<Statement> = edit_policy_statements(&args)?
        .into_iter()
        .map(Statement::execute)
        .collect();
    conn.run_in_transaction(&statements).await?;

    let schema = schema_or_default(args.schema.as_deref());
    Ok(OperationOutcome::ok(
        format!(
            "Policy {} updated on {}.{}",
            args.policy_name.trim(),
            schema,
            args.table_name.trim()
        ),
        json!({
            "policy": args.policy_name.trim(),
            "table": args.table_name.trim(),
            "schema": schema,
            "roles": args.roles,
            "using": args.using,
            "check": args.check,
            "statements": statements.len()
        }),
    ))
}

async fn drop_policy(conn: &ConnectionHandle, args: DropPolicy) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let sql = format!(
        "DROP POLICY {}{} ON {}",
        if args.if_exists { "IF EXISTS " } else { "" },
        quote_ident(args.policy_name.trim())?,
        quote_qualified(schema, args.table_name.trim())?
    );
    conn.execute_ddl(&sql).await?;

    Ok(OperationOutcome::ok(
        format!(
            "Policy {} dropped from {}.{}",
            args.policy_name.trim(),
            schema,
            args.table_name.trim()
        ),
        json!({
            "policy": args.policy_name.trim(),
            "table": args.table_name.trim(),
            "schema": schema
        }),
    ))
}

async fn get_policies(conn: &ConnectionHandle, args: GetPolicies) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let table = args.table_name.as_deref().map(str::trim);
    let rows = conn.query_json(GET_POLICIES_SQL, &[&schema, &table]).await?;
    Ok(OperationOutcome::rows(
        format!("Found {} polic(ies)", rows.len()),
        rows,
    ))
}

pub struct ManageRlsTool;

#[async_trait]
impl ToolHandler for ManageRlsTool {
    fn definition(&self) -> Tool {
        wide_tool::<RlsOperation>(
            "Manage row level security: enable or disable it per table and create, edit, drop \
            or list policies.",
            json!({
                "tableName": {"type": "string", "description": "Table name"},
                "schema": {"type": "string", "description": "Schema name (default: public)"},
                "policyName": {"type": "string", "description": "Policy name"},
                "using": {"type": "string", "description": "USING expression"},
                "check": {"type": "string", "description": "WITH CHECK expression"},
                "command": {"type": "string", "enum": COMMANDS},
                "role": {"type": "string", "description": "Role the policy applies to (default: PUBLIC)"},
                "roles": {"type": "array", "items": {"type": "string"}, "description": "New role list for edit_policy"},
                "replace": {"type": "boolean", "description": "Drop an existing policy of the same name first"},
                "ifExists": {"type": "boolean", "description": "Add IF EXISTS to drop_policy (default: true)"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_manage_rls"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: RlsOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match operation {
            RlsOperation::Enable(a) => set_rls(&conn, a, true).await?,
            RlsOperation::Disable(a) => set_rls(&conn, a, false).await?,
            RlsOperation::CreatePolicy(a) => create_policy(&conn, a).await?,
            RlsOperation::EditPolicy(a) => edit_policy(&conn, a).await?,
            RlsOperation::DropPolicy(a) => drop_policy(&conn, a).await?,
            RlsOperation::GetPolicies(a) => get_policies(&conn, a).await?,
        };
        Ok(outcome.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> std::result::Result<RlsOperation, ToolError> {
        route(&Arguments::new(value).unwrap())
    }

    #[test]
    fn test_unknown_operation_lists_all_six() {
        let message = parse(json!({"operation": "enable_rls"})).unwrap_err().to_string();
        assert!(message.contains(
            "enable, disable, create_policy, edit_policy, drop_policy, get_policies"
        ));
    }

    #[test]
    fn test_create_policy_missing_fields() {
        let err = parse(json!({"operation": "create_policy", "tableName": "t"})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing required argument(s) for 'create_policy': policyName, using"
        );
    }

    #[test]
    fn test_create_policy_sql() {
        let RlsOperation::CreatePolicy(args) = parse(json!({
            "operation": "create_policy",
            "tableName": "docs",
            "policyName": "owner_only",
            "using": "owner = current_user",
            "check": "owner = current_user",
            "command": "update",
            "role": "app_user"
        }))
        .unwrap() else {
            panic!("expected create_policy");
        };
        assert_eq!(
            create_policy_sql(&args).unwrap(),
            "CREATE POLICY \"owner_only\" ON \"public\".\"docs\" FOR UPDATE TO \"app_user\" \
            USING (owner = current_user) WITH CHECK (owner = current_user)"
        );
    }

    #[test]
    fn test_create_policy_rejects_statement_in_using() {
        let RlsOperation::CreatePolicy(args) = parse(json!({
            "operation": "create_policy",
            "tableName": "docs",
            "policyName": "p",
            "using": "true); DROP TABLE docs; --"
        }))
        .unwrap() else {
            panic!("expected create_policy");
        };
        assert!(create_policy_sql(&args).is_err());
    }

    #[test]
    fn test_edit_policy_builds_one_statement_per_change() {
        let RlsOperation::EditPolicy(args) = parse(json!({
            "operation": "edit_policy",
            "tableName": "docs",
            "policyName": "p",
            "roles": ["public", "auditor"],
            "using": "true"
        }))
        .unwrap() else {
            panic!("expected edit_policy");
        };
        let statements = edit_policy_statements(&args).unwrap();
        assert_eq!(
            statements,
            vec![
                "ALTER POLICY \"p\" ON \"public\".\"docs\" TO PUBLIC, \"auditor\"".to_string(),
                "ALTER POLICY \"p\" ON \"public\".\"docs\" USING (true)".to_string(),
            ]
        );
    }

    #[test]
    fn test_edit_policy_without_changes_is_rejected() {
        let RlsOperation::EditPolicy(args) = parse(json!({
            "operation": "edit_policy",
            "tableName": "docs",
            "policyName": "p"
        }))
        .unwrap() else {
            panic!("expected edit_policy");
        };
        assert!(edit_policy_statements(&args).is_err());
    }
}
