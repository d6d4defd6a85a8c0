//! `pg_manage_users`: roles, role attributes and privileges.

use crate::database::{ConnectionHandle, Statement};
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::security::{quote_ident, quote_literal, quote_qualified, validate_keyword};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{
    Arguments, OperationOutcome, OperationSet, operation_args, route, schema_or_default,
    unknown_operation, wide_tool,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

const PRIVILEGES: &[&str] = &[
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "TRUNCATE",
    "REFERENCES",
    "TRIGGER",
    "USAGE",
    "CREATE",
    "CONNECT",
    "TEMPORARY",
    "EXECUTE",
    "ALL",
];
const TARGET_TYPES: &[&str] = &["TABLE", "SCHEMA", "DATABASE", "SEQUENCE", "FUNCTION"];

const PERMISSIONS_SQL: &str = r#"
    SELECT
        grantee::text AS grantee,
        table_schema::text AS schema,
        table_name::text AS object_name,
        'TABLE' AS object_type,
        array_agg(privilege_type::text ORDER BY privilege_type)::text[] AS privileges,
        bool_or(is_grantable::text = 'YES') AS grantable
    FROM information_schema.role_table_grants
    WHERE ($1::text IS NULL OR grantee = $1)
      AND ($2::text IS NULL OR table_schema = $2)
      AND table_schema NOT IN ('pg_catalog', 'information_schema')
    GROUP BY grantee, table_schema, table_name
    UNION ALL
    SELECT
        r.rolname::text AS grantee,
        n.nspname::text AS schema,
        n.nspname::text AS object_name,
        'SCHEMA' AS object_type,
        array_remove(ARRAY[
            CASE WHEN has_schema_privilege(r.oid, n.oid, 'USAGE') THEN 'USAGE' END,
            CASE WHEN has_schema_privilege(r.oid, n.oid, 'CREATE') THEN 'CREATE' END
        ], NULL)::text[] AS privileges,
        false AS grantable
    FROM pg_roles r
    CROSS JOIN pg_namespace n
    WHERE $1::text IS NOT NULL AND r.rolname = $1
      AND ($2::text IS NULL OR n.nspname = $2)
      AND n.nspname NOT LIKE 'pg\_%'
      AND n.nspname <> 'information_schema'
    ORDER BY grantee, object_type, schema, object_name
"#;

const LIST_ROLES_SQL: &str = r#"
    SELECT
        r.rolname AS username,
        r.rolcanlogin AS can_login,
        r.rolsuper AS superuser,
        r.rolcreatedb AS create_db,
        r.rolcreaterole AS create_role,
        r.rolinherit AS inherit,
        r.rolreplication AS replication,
        r.rolconnlimit AS connection_limit,
        r.rolvaliduntil AS valid_until,
        ARRAY(
            SELECT b.rolname FROM pg_auth_members m
            JOIN pg_roles b ON b.oid = m.roleid
            WHERE m.member = r.oid
            ORDER BY b.rolname
        )::text[] AS member_of
    FROM pg_roles r
    WHERE $1 OR r.rolname !~ '^pg_'
    ORDER BY r.rolname
"#;

/// Role attributes shared by `create` and `alter`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAttributes {
    pub password: Option<String>,
    pub login: Option<bool>,
    pub superuser: Option<bool>,
    pub createdb: Option<bool>,
    pub createrole: Option<bool>,
    pub inherit: Option<bool>,
    pub replication: Option<bool>,
    pub connection_limit: Option<i32>,
    pub valid_until: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUser {
    pub username: String,
    #[serde(flatten)]
    pub attributes: RoleAttributes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropUser {
    pub username: String,
    #[serde(default = "default_true")]
    pub if_exists: bool,
    #[serde(default)]
    pub cascade: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterUser {
    pub username: String,
    #[serde(flatten)]
    pub attributes: RoleAttributes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Privileges {
    pub username: String,
    pub permissions: Vec<String>,
    pub target: String,
    pub target_type: String,
    #[serde(default)]
    pub with_grant_option: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPermissions {
    pub username: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUsers {
    #[serde(default)]
    pub include_system_roles: bool,
}

fn default_true() -> bool {
    true
}

operation_args! {
    CreateUser => ["username"],
    DropUser => ["username"],
    AlterUser => ["username"],
    Privileges => ["username", "permissions", "target", "targetType"],
    GetPermissions => [],
    ListUsers => [],
}

#[derive(Debug)]
pub enum UserOperation {
    Create(CreateUser),
    Drop(DropUser),
    Alter(AlterUser),
    Grant(Privileges),
    Revoke(Privileges),
    GetPermissions(GetPermissions),
    List(ListUsers),
}

impl OperationSet for UserOperation {
    const TOOL: &'static str = "pg_manage_users";
    const OPERATIONS: &'static [&'static str] = &[
        "create",
        "drop",
        "alter",
        "grant",
        "revoke",
        "get_permissions",
        "list",
    ];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "create" => args.extract(operation).map(Self::Create),
            "drop" => args.extract(operation).map(Self::Drop),
            "alter" => args.extract(operation).map(Self::Alter),
            "grant" => args.extract(operation).map(Self::Grant),
            "revoke" => args.extract(operation).map(Self::Revoke),
            "get_permissions" => args.extract(operation).map(Self::GetPermissions),
            "list" => args.extract(operation).map(Self::List),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

fn flag(options: &mut Vec<String>, value: Option<bool>, on: &str, off: &str) {
    if let Some(value) = value {
        options.push(if value { on } else { off }.to_string());
    }
}

/// Role options in `CREATE ROLE`/`ALTER ROLE` order.
fn role_options(attributes: &RoleAttributes) -> std::result::Result<Vec<String>, ToolError> {
    let mut options = Vec::new();
    flag(&mut options, attributes.login, "LOGIN", "NOLOGIN");
    flag(&mut options, attributes.superuser, "SUPERUSER", "NOSUPERUSER");
    flag(&mut options, attributes.createdb, "CREATEDB", "NOCREATEDB");
    flag(&mut options, attributes.createrole, "CREATEROLE", "NOCREATEROLE");
    flag(&mut options, attributes.inherit, "INHERIT", "NOINHERIT");
    flag(&mut options, attributes.replication, "REPLICATION", "NOREPLICATION");
    if let Some(limit) = attributes.connection_limit {
        if limit < -1 {
            return Err(ToolError::invalid("connectionLimit must be -1 or greater"));
        }
        options.push(format!("CONNECTION LIMIT {}", limit));
    }
    if let Some(password) = attributes.password.as_deref() {
        options.push(format!("PASSWORD {}", quote_literal(password)?));
    }
    if let Some(valid_until) = attributes.valid_until.as_deref().filter(|v| !v.trim().is_empty()) {
        options.push(format!("VALID UNTIL {}", quote_literal(valid_until.trim())?));
    }
    Ok(options)
}

pub fn create_user_sql(args: &CreateUser) -> std::result::Result<String, ToolError> {
    let mut attributes = role_options(&args.attributes)?;
    if args.attributes.login.is_none() {
        attributes.insert(0, "LOGIN".to_string());
    }
    Ok(format!(
        "CREATE ROLE {} WITH {}",
        quote_ident(args.username.trim())?,
        attributes.join(" ")
    ))
}

pub fn alter_user_sql(args: &AlterUser) -> std::result::Result<String, ToolError> {
    let attributes = role_options(&args.attributes)?;
    if attributes.is_empty() {
        return Err(ToolError::invalid("alter needs at least one role attribute"));
    }
    Ok(format!(
        "ALTER ROLE {} WITH {}",
        quote_ident(args.username.trim())?,
        attributes.join(" ")
    ))
}

pub fn drop_user_statements(args: &DropUser) -> std::result::Result<Vec<String>, ToolError> {
    let role = quote_ident(args.username.trim())?;
    let mut statements = Vec::new();
    if args.cascade {
        statements.push(format!("REASSIGN OWNED BY {} TO CURRENT_USER", role));
        statements.push(format!("DROP OWNED BY {}", role));
    }
    statements.push(format!(
        "DROP ROLE {}{}",
        if args.if_exists { "IF EXISTS " } else { "" },
        role
    ));
    Ok(statements)
}

fn privilege_list(permissions: &[String]) -> std::result::Result<String, ToolError> {
    let privileges = permissions
        .iter()
        .map(|p| validate_keyword("permission", p, PRIVILEGES))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if privileges.contains(&"ALL") {
        Ok("ALL PRIVILEGES".to_string())
    } else {
        Ok(privileges.join(", "))
    }
}

/// The `ON ...` clause of a GRANT or REVOKE.
fn privilege_object(args: &Privileges) -> std::result::Result<String, ToolError> {
    let target_type = validate_keyword("targetType", &args.target_type, TARGET_TYPES)?;
    let target = args.target.trim();
    let schema = schema_or_default(args.schema.as_deref());
    let all = target.eq_ignore_ascii_case("ALL");

    match target_type {
        "TABLE" | "SEQUENCE" | "FUNCTION" if all => Ok(format!(
            "ALL {}S IN SCHEMA {}",
            target_type,
            quote_ident(schema)?
        )),
        "TABLE" | "SEQUENCE" | "FUNCTION" => Ok(format!(
            "{} {}",
            target_type,
            quote_qualified(schema, target)?
        )),
        _ => Ok(format!("{} {}", target_type, quote_ident(target)?)),
    }
}

pub fn grant_sql(args: &Privileges) -> std::result::Result<String, ToolError> {
    Ok(format!(
        "GRANT {} ON {} TO {}{}",
        privilege_list(&args.permissions)?,
        privilege_object(args)?,
        quote_ident(args.username.trim())?,
        if args.with_grant_option { " WITH GRANT OPTION" } else { "" }
    ))
}

pub fn revoke_sql(args: &Privileges) -> std::result::Result<String, ToolError> {
    Ok(format!(
        "REVOKE {}{} ON {} FROM {}",
        if args.with_grant_option { "GRANT OPTION FOR " } else { "" },
        privilege_list(&args.permissions)?,
        privilege_object(args)?,
        quote_ident(args.username.trim())?
    ))
}

async fn create_user(conn: &ConnectionHandle, args: CreateUser) -> Result<OperationOutcome> {
    let sql = create_user_sql(&args)?;
    let username = args.username.trim();
    conn.execute_ddl_sensitive(&sql, &format!("CREATE ROLE {}", username))
        .await?;

    info!("Created role {}", username);
    Ok(OperationOutcome::ok(
        format!("User {} created successfully", username),
        json!({
            "username": username,
            "login": args.attributes.login.unwrap_or(true),
            "passwordSet": args.attributes.password.is_some()
        }),
    ))
}

async fn drop_user(conn: &ConnectionHandle, args: DropUser) -> Result<OperationOutcome> {
    let statements = drop_user_statements(&args)?;
    if statements.len() == 1 {
        conn.execute_ddl(&statements[0]).await?;
    } else {
        let batch: Vec<Statement> = statements.iter().cloned().map(Statement::execute).collect();
        conn.run_in_transaction(&batch).await?;
    }

    let username = args.username.trim();
    info!("Dropped role {}", username);
    Ok(OperationOutcome::ok(
        format!("User {} dropped successfully", username),
        json!({"username": username, "cascade": args.cascade}),
    ))
}

async fn alter_user(conn: &ConnectionHandle, args: AlterUser) -> Result<OperationOutcome> {
    let sql = alter_user_sql(&args)?;
    let username = args.username.trim();
    conn.execute_ddl_sensitive(&sql, &format!("ALTER ROLE {}", username))
        .await?;

    info!("Altered role {}", username);
    Ok(OperationOutcome::ok(
        format!("User {} altered successfully", username),
        json!({"username": username, "passwordChanged": args.attributes.password.is_some()}),
    ))
}

async fn change_privileges(
    conn: &ConnectionHandle,
    args: Privileges,
    grant: bool,
) -> Result<OperationOutcome> {
    let sql = if grant { grant_sql(&args)? } else { revoke_sql(&args)? };
    conn.execute_ddl(&sql).await?;

    let verb = if grant { "granted to" } else { "revoked from" };
    info!("{}", sql);
    Ok(OperationOutcome::ok(
        format!("Privileges {} {}", verb, args.username.trim()),
        json!({
            "username": args.username.trim(),
            "permissions": args.permissions,
            "target": args.target.trim(),
            "targetType": args.target_type.trim().to_lowercase(),
            "statement": sql
        }),
    ))
}

async fn get_permissions(conn: &ConnectionHandle, args: GetPermissions) -> Result<OperationOutcome> {
    let username = args.username.as_deref().map(str::trim).filter(|u| !u.is_empty());
    let schema = args.schema.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let rows = conn.query_json(PERMISSIONS_SQL, &[&username, &schema]).await?;
    Ok(OperationOutcome::rows(
        format!("Found {} privilege grant(s)", rows.len()),
        rows,
    ))
}

async fn list_users(conn: &ConnectionHandle, args: ListUsers) -> Result<OperationOutcome> {
    let rows = conn
        .query_json(LIST_ROLES_SQL, &[&args.include_system_roles])
        .await?;
    Ok(OperationOutcome::rows(format!("Found {} role(s)", rows.len()), rows))
}

pub struct ManageUsersTool;

#[async_trait]
impl ToolHandler for ManageUsersTool {
    fn definition(&self) -> Tool {
        wide_tool::<UserOperation>(
            "Manage PostgreSQL roles: create, alter and drop them, grant and revoke privileges, \
            and list roles and their permissions.",
            json!({
                "username": {"type": "string", "description": "Role name"},
                "password": {"type": "string"},
                "login": {"type": "boolean", "description": "Role can log in (default: true on create)"},
                "superuser": {"type": "boolean"},
                "createdb": {"type": "boolean"},
                "createrole": {"type": "boolean"},
                "inherit": {"type": "boolean"},
                "replication": {"type": "boolean"},
                "connectionLimit": {"type": "integer", "description": "-1 for no limit"},
                "validUntil": {"type": "string", "description": "Password expiry timestamp"},
                "ifExists": {"type": "boolean"},
                "cascade": {"type": "boolean", "description": "Reassign and drop owned objects before dropping the role"},
                "permissions": {"type": "array", "items": {"type": "string", "enum": PRIVILEGES}},
                "target": {"type": "string", "description": "Object name, or ALL for every table, sequence or function in the schema"},
                "targetType": {"type": "string", "enum": ["table", "schema", "database", "sequence", "function"]},
                "withGrantOption": {"type": "boolean"},
                "schema": {"type": "string", "description": "Schema of the target (default: public)"},
                "includeSystemRoles": {"type": "boolean", "description": "Include pg_* roles in list"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_manage_users"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: UserOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match operation {
            UserOperation::Create(a) => create_user(&conn, a).await?,
            UserOperation::Drop(a) => drop_user(&conn, a).await?,
            UserOperation::Alter(a) => alter_user(&conn, a).await?,
            UserOperation::Grant(a) => change_privileges(&conn, a, true).await?,
            UserOperation::Revoke(a) => change_privileges(&conn, a, false).await?,
            UserOperation::GetPermissions(a) => get_permissions(&conn, a).await?,
            UserOperation::List(a) => list_users(&conn, a).await?,
        };
        Ok(outcome.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> std::result::Result<UserOperation, ToolError> {
        route(&Arguments::new(value).unwrap())
    }

    fn privileges(value: Value) -> Privileges {
        match parse(value).unwrap() {
            UserOperation::Grant(args) | UserOperation::Revoke(args) => args,
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[test]
    fn test_create_user_sql() {
        let UserOperation::Create(args) = parse(json!({
            "operation": "create",
            "username": "reporter",
            "password": "s3cr'et",
            "createdb": false,
            "connectionLimit": 5
        }))
        .unwrap() else {
            panic!("expected create");
        };
        assert_eq!(
            create_user_sql(&args).unwrap(),
            "CREATE ROLE \"reporter\" WITH LOGIN NOCREATEDB CONNECTION LIMIT 5 PASSWORD 's3cr''et'"
        );
    }

    #[test]
    fn test_alter_without_attributes_rejected() {
        let UserOperation::Alter(args) = parse(json!({"operation": "alter", "username": "u"})).unwrap()
        else {
            panic!("expected alter");
        };
        assert!(alter_user_sql(&args).is_err());
    }

    #[test]
    fn test_drop_cascade_statements() {
        let UserOperation::Drop(args) = parse(json!({
            "operation": "drop",
            "username": "old",
            "cascade": true
        }))
        .unwrap() else {
            panic!("expected drop");
        };
        assert_eq!(
            drop_user_statements(&args).unwrap(),
            vec![
                "REASSIGN OWNED BY \"old\" TO CURRENT_USER",
                "DROP OWNED BY \"old\"",
                "DROP ROLE IF EXISTS \"old\"",
            ]
        );
    }

    #[test]
    fn test_grant_on_all_tables() {
        let args = privileges(json!({
            "operation": "grant",
            "username": "reporter",
            "permissions": ["select"],
            "target": "ALL",
            "targetType": "table",
            "schema": "sales"
        }));
        assert_eq!(
            grant_sql(&args).unwrap(),
            "GRANT SELECT ON ALL TABLES IN SCHEMA \"sales\" TO \"reporter\""
        );
    }

    #[test]
    fn test_grant_on_schema_with_grant_option() {
        let args = privileges(json!({
            "operation": "grant",
            "username": "app",
            "permissions": ["usage", "create"],
            "target": "sales",
            "targetType": "schema",
            "withGrantOption": true
        }));
        assert_eq!(
            grant_sql(&args).unwrap(),
            "GRANT USAGE, CREATE ON SCHEMA \"sales\" TO \"app\" WITH GRANT OPTION"
        );
    }

    #[test]
    fn test_revoke_all_privileges_on_table() {
        let args = privileges(json!({
            "operation": "revoke",
            "username": "app",
            "permissions": ["all"],
            "target": "orders",
            "targetType": "table"
        }));
        assert_eq!(
            revoke_sql(&args).unwrap(),
            "REVOKE ALL PRIVILEGES ON TABLE \"public\".\"orders\" FROM \"app\""
        );
    }

    #[test]
    fn test_grant_rejects_unknown_privilege() {
        let args = privileges(json!({
            "operation": "grant",
            "username": "app",
            "permissions": ["SELECT; DROP TABLE x"],
            "target": "orders",
            "targetType": "table"
        }));
        assert!(grant_sql(&args).is_err());
    }

    #[test]
    fn test_grant_reports_all_missing_fields() {
        let err = parse(json!({"operation": "grant", "username": "app"})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing required argument(s) for 'grant': permissions, target, targetType"
        );
    }
}
