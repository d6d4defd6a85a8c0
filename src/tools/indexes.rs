//! `pg_manage_indexes`: list, create, drop, rebuild and audit indexes.

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

const METHODS: &[&str] = &["btree", "hash", "gist", "gin", "spgist", "brin"];
const REINDEX_TYPES: &[&str] = &["INDEX", "TABLE", "SCHEMA", "DATABASE"];

const GET_INDEXES_SQL: &str = r#"
    SELECT
        i.schemaname AS schema,
        i.tablename AS table_name,
        i.indexname AS index_name,
        i.indexdef AS definition,
        ix.indisunique AS is_unique,
        ix.indisprimary AS is_primary,
        am.amname AS method,
        pg_relation_size(c.oid) AS size_bytes,
        pg_size_pretty(pg_relation_size(c.oid)) AS size
    FROM pg_indexes i
    JOIN pg_namespace n ON n.nspname = i.schemaname
    JOIN pg_class c ON c.relname = i.indexname AND c.relnamespace = n.oid
    JOIN pg_index ix ON ix.indexrelid = c.oid
    JOIN pg_am am ON am.oid = c.relam
    WHERE i.schemaname = $1
      AND ($2::text IS NULL OR i.tablename = $2)
    ORDER BY i.tablename, i.indexname
"#;

const GET_INDEXES_WITH_STATS_SQL: &str = r#"
    SELECT
        i.schemaname AS schema,
        i.tablename AS table_name,
        i.indexname AS index_name,
        i.indexdef AS definition,
        ix.indisunique AS is_unique,
        ix.indisprimary AS is_primary,
        am.amname AS method,
        pg_relation_size(c.oid) AS size_bytes,
        pg_size_pretty(pg_relation_size(c.oid)) AS size,
        s.idx_scan AS scans,
        s.idx_tup_read AS tuples_read,
        s.idx_tup_fetch AS tuples_fetched
    FROM pg_indexes i
    JOIN pg_namespace n ON n.nspname = i.schemaname
    JOIN pg_class c ON c.relname = i.indexname AND c.relnamespace = n.oid
    JOIN pg_index ix ON ix.indexrelid = c.oid
    JOIN pg_am am ON am.oid = c.relam
    LEFT JOIN pg_stat_user_indexes s ON s.indexrelid = c.oid
    WHERE i.schemaname = $1
      AND ($2::text IS NULL OR i.tablename = $2)
    ORDER BY i.tablename, i.indexname
"#;

const UNUSED_INDEXES_SQL: &str = r#"
    SELECT
        s.schemaname AS schema,
        s.relname AS table_name,
        s.indexrelname AS index_name,
        s.idx_scan AS scans,
        pg_relation_size(s.indexrelid) AS size_bytes,
        pg_size_pretty(pg_relation_size(s.indexrelid)) AS size
    FROM pg_stat_user_indexes s
    JOIN pg_index ix ON ix.indexrelid = s.indexrelid
    WHERE s.schemaname = $1
      AND ($2::text IS NULL OR s.relname = $2)
      AND s.idx_scan = 0
      AND NOT ix.indisprimary
      AND NOT ix.indisunique
      AND pg_relation_size(s.indexrelid) >= $3
    ORDER BY pg_relation_size(s.indexrelid) DESC
"#;

const DUPLICATE_INDEXES_SQL: &str = r#"
    SELECT
        n.nspname AS schema,
        t.relname AS table_name,
        array_agg(c.relname ORDER BY c.relname)::text[] AS indexes,
        pg_get_indexdef(min(ix.indexrelid)::regclass) AS example_definition,
        sum(pg_relation_size(ix.indexrelid))::bigint AS total_size_bytes
    FROM pg_index ix
    JOIN pg_class c ON c.oid = ix.indexrelid
    JOIN pg_class t ON t.oid = ix.indrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    WHERE n.nspname = $1
      AND ($2::text IS NULL OR t.relname = $2)
    GROUP BY n.nspname, t.relname, ix.indrelid, ix.indkey::text, ix.indclass::text,
             coalesce(pg_get_expr(ix.indexprs, ix.indrelid), ''),
             coalesce(pg_get_expr(ix.indpred, ix.indrelid), '')
    HAVING count(*) > 1
    ORDER BY total_size_bytes DESC
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetIndexes {
    pub table_name: Option<String>,
    #[serde(default)]
    pub include_stats: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIndex {
    pub index_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub concurrent: bool,
    pub method: Option<String>,
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub if_not_exists: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropIndex {
    pub index_name: String,
    #[serde(default)]
    pub concurrent: bool,
    #[serde(default = "default_true")]
    pub if_exists: bool,
    #[serde(default)]
    pub cascade: bool,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reindex {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeUsage {
    pub table_name: Option<String>,
    #[serde(default = "default_true")]
    pub show_unused: bool,
    #[serde(default = "default_true")]
    pub show_duplicates: bool,
    #[serde(default)]
    pub min_size_bytes: i64,
    pub schema: Option<String>,
}

fn default_true() -> bool {
    true
}

operation_args! {
    GetIndexes => [],
    CreateIndex => ["indexName", "tableName", "columns"],
    DropIndex => ["indexName"],
    Reindex => ["type"],
    AnalyzeUsage => [],
}

#[derive(Debug)]
pub enum IndexOperation {
    Get(GetIndexes),
    Create(CreateIndex),
    Drop(DropIndex),
    Reindex(Reindex),
    AnalyzeUsage(AnalyzeUsage),
}

impl OperationSet for IndexOperation {
    const TOOL: &'static str = "pg_manage_indexes";
    const OPERATIONS: &'static [&'static str] = &["get", "create", "drop", "reindex", "analyze_usage"];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "get" => args.extract(operation).map(Self::Get),
            "create" => args.extract(operation).map(Self::Create),
            "drop" => args.extract(operation).map(Self::Drop),
            "reindex" => args.extract(operation).map(Self::Reindex),
            "analyze_usage" => args.extract(operation).map(Self::AnalyzeUsage),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

pub fn create_index_sql(args: &CreateIndex) -> std::result::Result<String, ToolError> {
    let schema = schema_or_default(args.schema.as_deref());
    let index = quote_ident(args.index_name.trim())?;
    let table = quote_qualified(schema, args.table_name.trim())?;
    let columns: Vec<&str> = args.columns.iter().map(|c| c.trim()).collect();
    let columns = quote_ident_list(&columns)?;
    let method = validate_keyword("index method", args.method.as_deref().unwrap_or("btree"), METHODS)?;

    let mut sql = format!(
        "CREATE {}INDEX {}{}{} ON {} USING {} ({})",
        if args.unique { "UNIQUE " } else { "" },
        if args.concurrent { "CONCURRENTLY " } else { "" },
        if args.if_not_exists { "IF NOT EXISTS " } else { "" },
        index,
        table,
        method,
        columns
    );
    if let Some(predicate) = args.where_clause.as_deref().filter(|w| !w.trim().is_empty()) {
        sql.push_str(&format!(" WHERE {}", validate_fragment("where clause", predicate)?));
    }
    Ok(sql)
}

pub fn drop_index_sql(args: &DropIndex) -> std::result::Result<String, ToolError> {
    if args.concurrent && args.cascade {
        return Err(ToolError::invalid(
            "DROP INDEX CONCURRENTLY does not support CASCADE",
        ));
    }
    let index = quote_qualified(schema_or_default(args.schema.as_deref()), args.index_name.trim())?;
    Ok(format!(
        "DROP INDEX {}{}{}{}",
        if args.concurrent { "CONCURRENTLY " } else { "" },
        if args.if_exists { "IF EXISTS " } else { "" },
        index,
        if args.cascade { " CASCADE" } else { "" }
    ))
}

/// `None` means "the current database", resolved at execution time.
pub fn reindex_sql(args: &Reindex, database: Option<&str>) -> std::result::Result<String, ToolError> {
    let kind = validate_keyword("reindex type", &args.kind, REINDEX_TYPES)?;
    let target = args.target.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let schema = schema_or_default(args.schema.as_deref());

    let object = match (kind, target.or(database)) {
        ("DATABASE", None) => {
            return Err(ToolError::invalid("Cannot determine the current database"));
        }
        (_, None) => {
            return Err(ToolError::MissingArgument {
                operation: "reindex".into(),
                fields: vec!["target"],
            });
        }
        ("INDEX" | "TABLE", Some(name)) => quote_qualified(schema, name)?,
        (_, Some(name)) => quote_ident(name)?,
    };
    Ok(format!("REINDEX {} {}", kind, object))
}

async fn get_indexes(conn: &ConnectionHandle, args: GetIndexes) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let table = args.table_name.as_deref().map(str::trim);
    let sql = if args.include_stats {
        GET_INDEXES_WITH_STATS_SQL
    } else {
        GET_INDEXES_SQL
    };
    let rows = conn.query_json(sql, &[&schema, &table]).await?;
    Ok(OperationOutcome::rows(
        format!("Found {} index(es) in schema {}", rows.len(), schema),
        rows,
    ))
}

async fn create_index(conn: &ConnectionHandle, args: CreateIndex) -> Result<OperationOutcome> {
    let sql = create_index_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    let schema = schema_or_default(args.schema.as_deref());
    info!("Created index {} on {}.{}", args.index_name.trim(), schema, args.table_name.trim());
    Ok(OperationOutcome::ok(
        format!("Index {} created successfully", args.index_name.trim()),
        json!({
            "index": args.index_name.trim(),
            "table": args.table_name.trim(),
            "schema": schema,
            "columns": args.columns,
            "unique": args.unique,
            "concurrent": args.concurrent,
            "method": args.method.as_deref().unwrap_or("btree").to_lowercase()
        }),
    ))
}

async fn drop_index(conn: &ConnectionHandle, args: DropIndex) -> Result<OperationOutcome> {
    let sql = drop_index_sql(&args)?;
    conn.execute_ddl(&sql).await?;

    info!("Dropped index {}", args.index_name.trim());
    Ok(OperationOutcome::ok(
        format!("Index {} dropped successfully", args.index_name.trim()),
        json!({
            "index": args.index_name.trim(),
            "schema": schema_or_default(args.schema.as_deref()),
            "cascade": args.cascade
        }),
    ))
}

async fn reindex(conn: &ConnectionHandle, args: Reindex) -> Result<OperationOutcome> {
    let needs_current = args.kind.trim().eq_ignore_ascii_case("database")
        && args.target.as_deref().is_none_or(|t| t.trim().is_empty());
    let current = if needs_current {
        conn.query_one_json("SELECT current_database()::text AS name", &[])
            .await?
            .and_then(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
    } else {
        None
    };

    let sql = reindex_sql(&args, current.as_deref())?;
    conn.execute_ddl(&sql).await?;

    info!("{}", sql);
    Ok(OperationOutcome::ok(
        format!("Reindex of {} completed", args.kind.trim().to_lowercase()),
        json!({
            "type": args.kind.trim().to_lowercase(),
            "target": args.target.or(current),
            "statement": sql
        }),
    ))
}

async fn analyze_usage(conn: &ConnectionHandle, args: AnalyzeUsage) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let table = args.table_name.as_deref().map(str::trim);

    let unused = if args.show_unused {
        conn.query_json(UNUSED_INDEXES_SQL, &[&schema, &table, &args.min_size_bytes])
            .await?
    } else {
        Vec::new()
    };
    let duplicates = if args.show_duplicates {
        conn.query_json(DUPLICATE_INDEXES_SQL, &[&schema, &table]).await?
    } else {
        Vec::new()
    };

    let mut recommendations = Vec::new();
    if !unused.is_empty() {
        recommendations.push(format!(
            "{} index(es) have never been scanned; consider dropping them",
            unused.len()
        ));
    }
    if !duplicates.is_empty() {
        recommendations.push(format!(
            "{} group(s) of duplicate indexes found; keep one index per group",
            duplicates.len()
        ));
    }

    Ok(OperationOutcome::ok(
        format!("Index usage analysis for schema {}", schema),
        json!({
            "schema": schema,
            "unusedIndexes": unused,
            "duplicateIndexes": duplicates,
            "recommendations": recommendations
        }),
    ))
}

pub struct ManageIndexesTool;

#[async_trait]
impl ToolHandler for ManageIndexesTool {
    fn definition(&self) -> Tool {
        wide_tool::<IndexOperation>(
            "Manage PostgreSQL indexes: list them with size and usage statistics, create, drop, \
            reindex, and find unused or duplicate indexes.",
            json!({
                "tableName": {"type": "string", "description": "Table name"},
                "schema": {"type": "string", "description": "Schema name (default: public)"},
                "indexName": {"type": "string", "description": "Index name (required for create and drop)"},
                "columns": {"type": "array", "items": {"type": "string"}, "description": "Indexed columns"},
                "unique": {"type": "boolean"},
                "concurrent": {"type": "boolean", "description": "Build or drop without locking writes"},
                "method": {"type": "string", "enum": METHODS},
                "where": {"type": "string", "description": "Partial index predicate"},
                "ifNotExists": {"type": "boolean"},
                "ifExists": {"type": "boolean", "description": "Add IF EXISTS to drop (default: true)"},
                "cascade": {"type": "boolean"},
                "includeStats": {"type": "boolean", "description": "Include scan statistics in get"},
                "type": {"type": "string", "enum": ["index", "table", "schema", "database"], "description": "Reindex scope"},
                "target": {"type": "string", "description": "Reindex target; defaults to the current database for type database"},
                "showUnused": {"type": "boolean"},
                "showDuplicates": {"type": "boolean"},
                "minSizeBytes": {"type": "integer", "description": "Ignore unused indexes smaller than this"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_manage_indexes"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: IndexOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match operation {
            IndexOperation::Get(a) => get_indexes(&conn, a).await?,
            IndexOperation::Create(a) => create_index(&conn, a).await?,
            IndexOperation::Drop(a) => drop_index(&conn, a).await?,
            IndexOperation::Reindex(a) => reindex(&conn, a).await?,
            IndexOperation::AnalyzeUsage(a) => analyze_usage(&conn, a).await?,
        };
        Ok(outcome.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> std::result::Result<IndexOperation, ToolError> {
        route(&Arguments::new(value).unwrap())
    }

    #[test]
    fn test_create_requires_columns() {
        let err = parse(json!({
            "operation": "create",
            "indexName": "idx",
            "tableName": "t",
            "columns": []
        }))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing required argument(s) for 'create': columns"
        );
    }

    #[test]
    fn test_create_index_sql() {
        let IndexOperation::Create(args) = parse(json!({
            "operation": "create",
            "indexName": "orders_open_idx",
            "tableName": "orders",
            "columns": ["customer_id", "created_at"],
            "unique": true,
            "concurrent": true,
            "method": "BTREE",
            "where": "status = 'open'"
        }))
        .unwrap() else {
            panic!("expected create");
        };
        assert_eq!(
            create_index_sql(&args).unwrap(),
            "CREATE UNIQUE INDEX CONCURRENTLY \"orders_open_idx\" ON \"public\".\"orders\" \
            USING btree (\"customer_id\", \"created_at\") WHERE status = 'open'"
        );
    }

    #[test]
    fn test_create_rejects_unknown_method() {
        let IndexOperation::Create(args) = parse(json!({
            "operation": "create",
            "indexName": "i",
            "tableName": "t",
            "columns": ["a"],
            "method": "rtree"
        }))
        .unwrap() else {
            panic!("expected create");
        };
        assert!(create_index_sql(&args).is_err());
    }

    #[test]
    fn test_drop_concurrently_with_cascade_rejected() {
        let IndexOperation::Drop(args) = parse(json!({
            "operation": "drop",
            "indexName": "i",
            "concurrent": true,
            "cascade": true
        }))
        .unwrap() else {
            panic!("expected drop");
        };
        assert!(drop_index_sql(&args).is_err());
    }

    #[test]
    fn test_drop_index_sql() {
        let IndexOperation::Drop(args) = parse(json!({"operation": "drop", "indexName": "i"})).unwrap()
        else {
            panic!("expected drop");
        };
        assert_eq!(drop_index_sql(&args).unwrap(), "DROP INDEX IF EXISTS \"public\".\"i\"");
    }

    #[test]
    fn test_reindex_targets() {
        let reindex = |value: Value| match parse(value).unwrap() {
            IndexOperation::Reindex(args) => args,
            other => panic!("unexpected operation: {other:?}"),
        };

        let table = reindex(json!({"operation": "reindex", "type": "table", "target": "orders"}));
        assert_eq!(reindex_sql(&table, None).unwrap(), "REINDEX TABLE \"public\".\"orders\"");

        let database = reindex(json!({"operation": "reindex", "type": "database"}));
        assert_eq!(
            reindex_sql(&database, Some("shop")).unwrap(),
            "REINDEX DATABASE \"shop\""
        );

        let missing = reindex(json!({"operation": "reindex", "type": "index"}));
        assert!(matches!(
            reindex_sql(&missing, None),
            Err(ToolError::MissingArgument { .. })
        ));

        let bogus = reindex(json!({"operation": "reindex", "type": "cluster", "target": "x"}));
        assert!(matches!(
            reindex_sql(&bogus, None),
            Err(ToolError::InvalidArguments(_))
        ));
    }
}
