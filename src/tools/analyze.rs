//! `pg_analyze_database`: configuration, performance and security reviews.

use crate::database::ConnectionHandle;
use crate::error::{Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use crate::tools::diagnostics::{Finding, NoArguments, number, setting, sorted, text};
use crate::tools::registry::{ToolContext, ToolHandler};
use crate::tools::router::{
    Arguments, OperationOutcome, OperationSet, route, unknown_operation, wide_tool,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::instrument;

const MIB: f64 = 1024.0 * 1024.0;

const SETTINGS_SQL: &str = r#"
    SELECT
        name,
        setting,
        unit,
        CASE unit
            WHEN '8kB' THEN setting::float8 * 8192
            WHEN 'kB' THEN setting::float8 * 1024
            WHEN 'MB' THEN setting::float8 * 1048576
            ELSE NULL
        END AS bytes,
        short_desc AS description
    FROM pg_settings
    WHERE name IN (
        'shared_buffers', 'effective_cache_size', 'work_mem', 'maintenance_work_mem',
        'max_connections', 'random_page_cost', 'checkpoint_completion_target',
        'wal_buffers', 'autovacuum', 'log_min_duration_statement', 'max_wal_size'
    )
    ORDER BY name
"#;

const DATABASE_STATS_SQL: &str = r#"
    SELECT
        datname AS database,
        numbackends AS connections,
        (100.0 * blks_hit / nullif(blks_hit + blks_read, 0))::float8 AS cache_hit_ratio,
        (100.0 * xact_commit / nullif(xact_commit + xact_rollback, 0))::float8 AS commit_ratio,
        deadlocks,
        temp_files,
        temp_bytes
    FROM pg_stat_database
    WHERE datname = current_database()
"#;

const SEQ_SCAN_TABLES_SQL: &str = r#"
    SELECT
        schemaname AS schema,
        relname AS table_name,
        seq_scan,
        coalesce(idx_scan, 0) AS idx_scan,
        n_live_tup AS live_rows
    FROM pg_stat_user_tables
    WHERE seq_scan > coalesce(idx_scan, 0)
      AND n_live_tup > 10000
    ORDER BY seq_scan DESC
    LIMIT 20
"#;

const DEAD_TUPLES_SQL: &str = r#"
    SELECT
        schemaname AS schema,
        relname AS table_name,
        n_live_tup AS live_rows,
        n_dead_tup AS dead_rows,
        (100.0 * n_dead_tup / nullif(n_live_tup + n_dead_tup, 0))::float8 AS dead_ratio,
        last_autovacuum::text AS last_autovacuum
    FROM pg_stat_user_tables
    WHERE n_dead_tup > 1000
      AND n_dead_tup > 0.1 * (n_live_tup + n_dead_tup)
    ORDER BY n_dead_tup DESC
    LIMIT 20
"#;

const UNUSED_INDEX_COUNT_SQL: &str = r#"
    SELECT count(*)::int8 AS unused_indexes,
           coalesce(sum(pg_relation_size(s.indexrelid)), 0)::int8 AS unused_bytes
    FROM pg_stat_user_indexes s
    JOIN pg_index ix ON ix.indexrelid = s.indexrelid
    WHERE s.idx_scan = 0 AND NOT ix.indisunique AND NOT ix.indisprimary
"#;

const SECURITY_SETTINGS_SQL: &str = r#"
    SELECT name, setting
    FROM pg_settings
    WHERE name IN ('ssl', 'password_encryption', 'listen_addresses', 'log_connections', 'row_security')
    ORDER BY name
"#;

const PRIVILEGED_ROLES_SQL: &str = r#"
    SELECT rolname AS role, rolsuper AS superuser, rolcreaterole AS create_role,
           rolbypassrls AS bypass_rls, rolvaliduntil::text AS valid_until
    FROM pg_roles
    WHERE rolcanlogin AND (rolsuper OR rolcreaterole OR rolbypassrls)
      AND rolname !~ '^pg_'
    ORDER BY rolname
"#;

const PUBLIC_GRANTS_SQL: &str = r#"
    SELECT table_schema::text AS schema, table_name::text AS table_name,
           array_agg(privilege_type::text ORDER BY privilege_type)::text[] AS privileges
    FROM information_schema.role_table_grants
    WHERE grantee = 'PUBLIC'
      AND table_schema NOT IN ('pg_catalog', 'information_schema')
    GROUP BY table_schema, table_name
    ORDER BY table_schema, table_name
"#;

const PUBLIC_SCHEMA_CREATE_SQL: &str =
    "SELECT has_schema_privilege('public', 'public', 'CREATE') AS public_can_create";

#[derive(Debug)]
pub enum Analysis {
    Configuration,
    Performance,
    Security,
}

impl OperationSet for Analysis {
    const TOOL: &'static str = "pg_analyze_database";
    const OPERATIONS: &'static [&'static str] = &["configuration", "performance", "security"];
    const DISCRIMINANT: &'static str = "analysisType";

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        args.extract::<NoArguments>(operation)?;
        match operation {
            "configuration" => Ok(Self::Configuration),
            "performance" => Ok(Self::Performance),
            "security" => Ok(Self::Security),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

pub fn configuration_findings(settings: &[Value]) -> Vec<Finding> {
    let mut findings = Vec::new();
    let bytes = |name: &str| setting(settings, name).and_then(|row| number(row, "bytes"));
    let value = |name: &str| setting(settings, name).and_then(|row| number(row, "setting"));

    if let Some(shared) = bytes("shared_buffers")
        && shared < 128.0 * MIB
    {
        findings.push(Finding::warning(format!(
            "shared_buffers is {:.0} MB; 25% of system memory is a common starting point",
            shared / MIB
        )));
    }
    if let (Some(shared), Some(cache)) = (bytes("shared_buffers"), bytes("effective_cache_size"))
        && cache < shared * 2.0
    {
        findings.push(Finding::info(
            "effective_cache_size is less than twice shared_buffers; the planner may undervalue index scans",
        ));
    }
    if let Some(work_mem) = bytes("work_mem")
        && work_mem <= 4.0 * MIB
    {
        findings.push(Finding::info(
            "work_mem is at the 4 MB default; sorts and hashes may spill to disk",
        ));
    }
    if let Some(maintenance) = bytes("maintenance_work_mem")
        && maintenance < 64.0 * MIB
    {
        findings.push(Finding::info(
            "maintenance_work_mem below 64 MB slows VACUUM and index builds",
        ));
    }
    if let Some(connections) = value("max_connections")
        && connections > 300.0
    {
        findings.push(Finding::warning(format!(
            "max_connections is {}; consider a connection pooler instead of more backends",
            connections
        )));
    }
    if let Some(cost) = value("random_page_cost")
        && cost >= 4.0
    {
        findings.push(Finding::info(
            "random_page_cost is 4 or more; lower it (around 1.1) on SSD storage",
        ));
    }
    if let Some(target) = value("checkpoint_completion_target")
        && target < 0.9
    {
        findings.push(Finding::info(
            "checkpoint_completion_target below 0.9 makes checkpoint I/O burstier",
        ));
    }
    if setting(settings, "autovacuum").and_then(|row| text(row, "setting")) == Some("off") {
        findings.push(Finding::critical(
            "autovacuum is off; dead rows and transaction ID wraparound will accumulate",
        ));
    }
    if value("log_min_duration_statement") == Some(-1.0) {
        findings.push(Finding::info(
            "log_min_duration_statement is disabled; slow queries are not logged",
        ));
    }
    sorted(findings)
}

pub fn performance_findings(
    database: Option<&Value>,
    seq_scan_tables: &[Value],
    bloated_tables: &[Value],
    unused: Option<&Value>,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    if let Some(db) = database {
        if let Some(ratio) = number(db, "cache_hit_ratio") {
            if ratio < 90.0 {
                findings.push(Finding::critical(format!(
                    "Cache hit ratio is {:.1}%; the working set does not fit in shared_buffers",
                    ratio
                )));
            } else if ratio < 99.0 {
                findings.push(Finding::warning(format!(
                    "Cache hit ratio is {:.1}%; 99% or more is typical for OLTP workloads",
                    ratio
                )));
            }
        }
        if let Some(deadlocks) = number(db, "deadlocks")
            && deadlocks > 0.0
        {
            findings.push(Finding::warning(format!(
                "{} deadlock(s) recorded since the last statistics reset",
                deadlocks
            )));
        }
        if let Some(temp_files) = number(db, "temp_files")
            && temp_files > 0.0
        {
            findings.push(Finding::info(format!(
                "{} temporary file(s) written; consider raising work_mem",
                temp_files
            )));
        }
    }

    for table in seq_scan_tables {
        findings.push(Finding::warning(format!(
            "Table {}.{} is mostly read by sequential scans; check for a missing index",
            text(table, "schema").unwrap_or("?"),
            text(table, "table_name").unwrap_or("?")
        )));
    }
    for table in bloated_tables {
        findings.push(Finding::warning(format!(
            "Table {}.{} has {:.0}% dead rows; run VACUUM or tune autovacuum",
            text(table, "schema").unwrap_or("?"),
            text(table, "table_name").unwrap_or("?"),
            number(table, "dead_ratio").unwrap_or(0.0)
        )));
    }
    if let Some(count) = unused.and_then(|row| number(row, "unused_indexes"))
        && count > 0.0
    {
        findings.push(Finding::info(format!(
            "{} index(es) have never been used; see pg_manage_indexes analyze_usage",
            count
        )));
    }
    sorted(findings)
}

pub fn security_findings(
    settings: &[Value],
    privileged_roles: &[Value],
    public_grants: &[Value],
    public_can_create: bool,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let value = |name: &str| setting(settings, name).and_then(|row| text(row, "setting"));

    if value("ssl") == Some("off") {
        findings.push(Finding::critical("SSL is disabled; connections travel unencrypted"));
    }
    if value("password_encryption") == Some("md5") {
        findings.push(Finding::warning(
            "password_encryption is md5; switch to scram-sha-256",
        ));
    }
    if value("listen_addresses") == Some("*") {
        findings.push(Finding::info(
            "listen_addresses is '*'; make sure pg_hba.conf restricts client addresses",
        ));
    }
    if value("log_connections") == Some("off") {
        findings.push(Finding::info("log_connections is off; logins are not audited"));
    }

    let superusers: Vec<&str> = privileged_roles
        .iter()
        .filter(|role| role.get("superuser").and_then(Value::as_bool) == Some(true))
        .filter_map(|role| text(role, "role"))
        .collect();
    if superusers.len() > 1 {
        findings.push(Finding::warning(format!(
            "{} login roles are superusers ({}); keep superuser access to a minimum",
            superusers.len(),
            superusers.join(", ")
        )));
    }
    for role in privileged_roles {
        if role.get("bypass_rls").and_then(Value::as_bool) == Some(true)
            && role.get("superuser").and_then(Value::as_bool) != Some(true)
        {
            findings.push(Finding::warning(format!(
                "Role {} bypasses row level security",
                text(role, "role").unwrap_or("?")
            )));
        }
    }
    if !public_grants.is_empty() {
        findings.push(Finding::warning(format!(
            "{} table(s) grant privileges to PUBLIC",
            public_grants.len()
        )));
    }
    if public_can_create {
        findings.push(Finding::warning(
            "PUBLIC can create objects in schema public; REVOKE CREATE ON SCHEMA public FROM PUBLIC",
        ));
    }
    sorted(findings)
}

async fn analyze_configuration(conn: &ConnectionHandle) -> Result<OperationOutcome> {
    let settings = conn.query_json(SETTINGS_SQL, &[]).await?;
    let recommendations = configuration_findings(&settings);
    Ok(OperationOutcome::ok(
        format!("Configuration analysis: {} recommendation(s)", recommendations.len()),
        json!({"analysisType": "configuration", "settings": settings, "recommendations": recommendations}),
    ))
}

async fn analyze_performance(conn: &ConnectionHandle) -> Result<OperationOutcome> {
    let database = conn.query_one_json(DATABASE_STATS_SQL, &[]).await?;
    let seq_scans = conn.query_json(SEQ_SCAN_TABLES_SQL, &[]).await?;
    let bloated = conn.query_json(DEAD_TUPLES_SQL, &[]).await?;
    let unused = conn.query_one_json(UNUSED_INDEX_COUNT_SQL, &[]).await?;

    let recommendations = performance_findings(database.as_ref(), &seq_scans, &bloated, unused.as_ref());
    Ok(OperationOutcome::ok(
        format!("Performance analysis: {} recommendation(s)", recommendations.len()),
        json!({
            "analysisType": "performance",
            "database": database,
            "sequentialScanTables": seq_scans,
            "deadTupleTables": bloated,
            "unusedIndexes": unused,
            "recommendations": recommendations
        }),
    ))
}

async fn analyze_security(conn: &ConnectionHandle) -> Result<OperationOutcome> {
    let settings = conn.query_json(SECURITY_SETTINGS_SQL, &[]).await?;
    let roles = conn.query_json(PRIVILEGED_ROLES_SQL, &[]).await?;
    let grants = conn.query_json(PUBLIC_GRANTS_SQL, &[]).await?;
    let public_can_create = conn
        .query_one_json(PUBLIC_SCHEMA_CREATE_SQL, &[])
        .await?
        .and_then(|row| row.get("public_can_create").and_then(Value::as_bool))
        .unwrap_or(false);

    let recommendations = security_findings(&settings, &roles, &grants, public_can_create);
    Ok(OperationOutcome::ok(
        format!("Security analysis: {} recommendation(s)", recommendations.len()),
        json!({
            "analysisType": "security",
            "settings": settings,
            "privilegedRoles": roles,
            "publicGrants": grants,
            "publicSchemaCreate": public_can_create,
            "recommendations": recommendations
        }),
    ))
}

pub struct AnalyzeDatabaseTool;

#[async_trait]
impl ToolHandler for AnalyzeDatabaseTool {
    fn definition(&self) -> Tool {
        wide_tool::<Analysis>(
            "Review the database configuration, performance statistics or security posture and \
            return findings with recommendations.",
            json!({}),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_analyze_database"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let analysis: Analysis = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match analysis {
            Analysis::Configuration => analyze_configuration(&conn).await?,
            Analysis::Performance => analyze_performance(&conn).await?,
            Analysis::Security => analyze_security(&conn).await?,
        };
        Ok(outcome.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::diagnostics::Severity;

    #[test]
    fn test_discriminant_is_analysis_type() {
        let err = route::<Analysis>(&Arguments::new(json!({"operation": "security"})).unwrap())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing required argument(s) for 'pg_analyze_database': analysisType"
        );
        assert!(matches!(
            route::<Analysis>(&Arguments::new(json!({"analysisType": "security"})).unwrap()),
            Ok(Analysis::Security)
        ));
    }

    #[test]
    fn test_configuration_findings() {
        let settings = vec![
            json!({"name": "shared_buffers", "setting": "16384", "unit": "8kB", "bytes": 134217728.0}),
            json!({"name": "effective_cache_size", "setting": "16384", "unit": "8kB", "bytes": 134217728.0}),
            json!({"name": "autovacuum", "setting": "off", "unit": null, "bytes": null}),
            json!({"name": "max_connections", "setting": "500", "unit": null, "bytes": null}),
        ];
        let findings = configuration_findings(&settings);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings[0].message.contains("autovacuum"));
        assert!(findings.iter().any(|f| f.message.contains("max_connections is 500")));
        assert!(findings.iter().any(|f| f.message.contains("effective_cache_size")));
        assert!(!findings.iter().any(|f| f.message.starts_with("shared_buffers")));
    }

    #[test]
    fn test_performance_findings() {
        let database = json!({"cache_hit_ratio": 85.0, "deadlocks": 2, "temp_files": 0});
        let seq = vec![json!({"schema": "public", "table_name": "orders"})];
        let findings = performance_findings(Some(&database), &seq, &[], None);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings.iter().any(|f| f.message.contains("public.orders")));
        assert!(findings.iter().any(|f| f.message.contains("deadlock")));
        assert!(!findings.iter().any(|f| f.message.contains("temporary")));
    }

    #[test]
    fn test_security_findings() {
        let settings = vec![
            json!({"name": "ssl", "setting": "off"}),
            json!({"name": "password_encryption", "setting": "md5"}),
        ];
        let roles = vec![
            json!({"role": "postgres", "superuser": true, "bypass_rls": true}),
            json!({"role": "admin", "superuser": true, "bypass_rls": false}),
            json!({"role": "etl", "superuser": false, "bypass_rls": true}),
        ];
        let findings = security_findings(&settings, &roles, &[], true);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings.iter().any(|f| f.message.contains("postgres, admin")));
        assert!(findings.iter().any(|f| f.message.contains("Role etl bypasses")));
        assert!(!findings.iter().any(|f| f.message.contains("Role postgres bypasses")));
        assert!(findings.iter().any(|f| f.message.contains("REVOKE CREATE")));
    }
}
