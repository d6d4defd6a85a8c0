//! `pg_manage_comments`: read and write `COMMENT ON` descriptions.

use crate::database::ConnectionHandle;
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

const OBJECT_TYPES: &[&str] = &[
    "table",
    "column",
    "index",
    "view",
    "sequence",
    "function",
    "trigger",
    "constraint",
    "schema",
];

const RELATION_COMMENT_SQL: &str = r#"
    SELECT c.relname::text AS object_name, obj_description(c.oid, 'pg_class') AS comment
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2
"#;

const COLUMN_COMMENT_SQL: &str = r#"
    SELECT c.relname::text AS table_name, a.attname::text AS column_name,
           col_description(c.oid, a.attnum) AS comment
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
    WHERE n.nspname = $1 AND c.relname = $2 AND a.attname = $3
"#;

const FUNCTION_COMMENT_SQL: &str = r#"
    SELECT p.proname::text AS object_name,
           pg_get_function_identity_arguments(p.oid) AS arguments,
           obj_description(p.oid, 'pg_proc') AS comment
    FROM pg_proc p
    JOIN pg_namespace n ON n.oid = p.pronamespace
    WHERE n.nspname = $1 AND p.proname = $2
"#;

const TRIGGER_COMMENT_SQL: &str = r#"
    SELECT t.tgname::text AS object_name, c.relname::text AS table_name,
           obj_description(t.oid, 'pg_trigger') AS comment
    FROM pg_trigger t
    JOIN pg_class c ON c.oid = t.tgrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND t.tgname = $2 AND c.relname = $3
"#;

const CONSTRAINT_COMMENT_SQL: &str = r#"
    SELECT con.conname::text AS object_name, c.relname::text AS table_name,
           obj_description(con.oid, 'pg_constraint') AS comment
    FROM pg_constraint con
    JOIN pg_class c ON c.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND con.conname = $2 AND c.relname = $3
"#;

const SCHEMA_COMMENT_SQL: &str = r#"
    SELECT n.nspname::text AS object_name, obj_description(n.oid, 'pg_namespace') AS comment
    FROM pg_namespace n
    WHERE n.nspname = $1
"#;

const BULK_COMMENTS_SQL: &str = r#"
    SELECT * FROM (
        SELECT
            CASE c.relkind
                WHEN 'r' THEN 'table' WHEN 'p' THEN 'table'
                WHEN 'v' THEN 'view' WHEN 'm' THEN 'view'
                WHEN 'i' THEN 'index' WHEN 'I' THEN 'index'
                WHEN 'S' THEN 'sequence'
                ELSE c.relkind::text
            END AS object_type,
            c.relname::text AS object_name,
            NULL::text AS table_name,
            NULL::text AS column_name,
            d.description AS comment
        FROM pg_description d
        JOIN pg_class c ON d.classoid = 'pg_class'::regclass AND d.objoid = c.oid AND d.objsubid = 0
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1
        UNION ALL
        SELECT 'column', a.attname::text, c.relname::text, a.attname::text, d.description
        FROM pg_description d
        JOIN pg_class c ON d.classoid = 'pg_class'::regclass AND d.objoid = c.oid AND d.objsubid > 0
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = d.objsubid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1
        UNION ALL
        SELECT 'function', p.proname::text, NULL, NULL, d.description
        FROM pg_description d
        JOIN pg_proc p ON d.classoid = 'pg_proc'::regclass AND d.objoid = p.oid
        JOIN pg_namespace n ON n.oid = p.pronamespace
        WHERE n.nspname = $1
        UNION ALL
        SELECT 'trigger', t.tgname::text, c.relname::text, NULL, d.description
        FROM pg_description d
        JOIN pg_trigger t ON d.classoid = 'pg_trigger'::regclass AND d.objoid = t.oid
        JOIN pg_class c ON c.oid = t.tgrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1
        UNION ALL
        SELECT 'constraint', con.conname::text, c.relname::text, NULL, d.description
        FROM pg_description d
        JOIN pg_constraint con ON d.classoid = 'pg_constraint'::regclass AND d.objoid = con.oid
        JOIN pg_class c ON c.oid = con.conrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1
        UNION ALL
        SELECT 'schema', n.nspname::text, NULL, NULL, d.description
        FROM pg_description d
        JOIN pg_namespace n ON d.classoid = 'pg_namespace'::regclass AND d.objoid = n.oid
        WHERE n.nspname = $1
    ) comments
    WHERE ($2::text IS NULL OR object_type = $2)
    ORDER BY object_type, table_name NULLS FIRST, object_name
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentTarget {
    pub object_type: String,
    pub object_name: String,
    pub column_name: Option<String>,
    pub table_name: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetComment {
    #[serde(flatten)]
    pub target: CommentTarget,
    pub comment: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkGet {
    pub object_type: Option<String>,
    pub schema: Option<String>,
}

operation_args! {
    CommentTarget => ["objectType", "objectName"],
    SetComment => ["objectType", "objectName", "comment"],
    BulkGet => [],
}

#[derive(Debug)]
pub enum CommentOperation {
    Get(CommentTarget),
    Set(SetComment),
    Remove(CommentTarget),
    BulkGet(BulkGet),
}

impl OperationSet for CommentOperation {
    const TOOL: &'static str = "pg_manage_comments";
    const OPERATIONS: &'static [&'static str] = &["get", "set", "remove", "bulk_get"];

    fn parse(operation: &str, args: &Arguments) -> std::result::Result<Self, ToolError> {
        match operation {
            "get" => args.extract(operation).map(Self::Get),
            "set" => args.extract(operation).map(Self::Set),
            "remove" => args.extract(operation).map(Self::Remove),
            "bulk_get" => args.extract(operation).map(Self::BulkGet),
            other => Err(unknown_operation::<Self>(other)),
        }
    }
}

/// A commentable object with its secondary name already checked.
#[derive(Debug, Clone, PartialEq)]
pub enum CommentObject<'a> {
    Relation { kind: &'static str, schema: &'a str, name: &'a str },
    Column { schema: &'a str, table: &'a str, column: &'a str },
    Function { schema: &'a str, name: &'a str },
    Trigger { schema: &'a str, table: &'a str, name: &'a str },
    Constraint { schema: &'a str, table: &'a str, name: &'a str },
    Schema { name: &'a str },
}

fn secondary<'a>(
    value: Option<&'a str>,
    field: &'static str,
    operation: &str,
) -> std::result::Result<&'a str, ToolError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ToolError::MissingArgument {
            operation: operation.to_string().into(),
            fields: vec![field],
        })
}

impl<'a> CommentObject<'a> {
    pub fn resolve(target: &'a CommentTarget, operation: &str) -> std::result::Result<Self, ToolError> {
        let kind = validate_keyword("objectType", &target.object_type, OBJECT_TYPES)?;
        let schema = schema_or_default(target.schema.as_deref());
        let name = target.object_name.trim();

        Ok(match kind {
            "column" => CommentObject::Column {
                schema,
                table: name,
                column: secondary(target.column_name.as_deref(), "columnName", operation)?,
            },
            "trigger" => CommentObject::Trigger {
                schema,
                table: secondary(target.table_name.as_deref(), "tableName", operation)?,
                name,
            },
            "constraint" => CommentObject::Constraint {
                schema,
                table: secondary(target.table_name.as_deref(), "tableName", operation)?,
                name,
            },
            "function" => CommentObject::Function { schema, name },
            "schema" => CommentObject::Schema { name },
            relation => CommentObject::Relation {
                kind: relation,
                schema,
                name,
            },
        })
    }

    /// Object reference as written after `COMMENT ON`.
    pub fn reference(&self) -> std::result::Result<String, ToolError> {
        Ok(match self {
            CommentObject::Relation { kind, schema, name } => {
                format!("{} {}", kind.to_uppercase(), quote_qualified(schema, name)?)
            }
            CommentObject::Column { schema, table, column } => format!(
                "COLUMN {}.{}",
                quote_qualified(schema, table)?,
                quote_ident(column)?
            ),
            CommentObject::Function { schema, name } => {
                format!("FUNCTION {}", quote_qualified(schema, name)?)
            }
            CommentObject::Trigger { schema, table, name } => format!(
                "TRIGGER {} ON {}",
                quote_ident(name)?,
                quote_qualified(schema, table)?
            ),
            CommentObject::Constraint { schema, table, name } => format!(
                "CONSTRAINT {} ON {}",
                quote_ident(name)?,
                quote_qualified(schema, table)?
            ),
            CommentObject::Schema { name } => format!("SCHEMA {}", quote_ident(name)?),
        })
    }
}

/// `COMMENT ON ... IS ...`; `None` removes the comment.
pub fn comment_sql(object: &CommentObject<'_>, comment: Option<&str>) -> std::result::Result<String, ToolError> {
    let value = match comment {
        Some(text) => quote_literal(text)?,
        None => "NULL".to_string(),
    };
    Ok(format!("COMMENT ON {} IS {}", object.reference()?, value))
}

async fn get_comment(conn: &ConnectionHandle, target: CommentTarget) -> Result<OperationOutcome> {
    let object = CommentObject::resolve(&target, "get")?;
    let rows = match &object {
        CommentObject::Relation { schema, name, .. } => {
            conn.query_json(RELATION_COMMENT_SQL, &[schema, name]).await?
        }
        CommentObject::Column { schema, table, column } => {
            conn.query_json(COLUMN_COMMENT_SQL, &[schema, table, column]).await?
        }
        CommentObject::Function { schema, name } => {
            conn.query_json(FUNCTION_COMMENT_SQL, &[schema, name]).await?
        }
        CommentObject::Trigger { schema, table, name } => {
            conn.query_json(TRIGGER_COMMENT_SQL, &[schema, name, table]).await?
        }
        CommentObject::Constraint { schema, table, name } => {
            conn.query_json(CONSTRAINT_COMMENT_SQL, &[schema, name, table]).await?
        }
        CommentObject::Schema { name } => conn.query_json(SCHEMA_COMMENT_SQL, &[name]).await?,
    };

    if rows.is_empty() {
        return Err(ToolError::ExecutionFailed(format!(
            "{} '{}' not found",
            target.object_type.trim().to_lowercase(),
            target.object_name.trim()
        ))
        .into());
    }
    Ok(OperationOutcome::ok(
        format!("Comment for {} {}", target.object_type.trim().to_lowercase(), target.object_name.trim()),
        json!({
            "objectType": target.object_type.trim().to_lowercase(),
            "objectName": target.object_name.trim(),
            "results": rows
        }),
    ))
}

async fn write_comment(
    conn: &ConnectionHandle,
    target: &CommentTarget,
    comment: Option<&str>,
    operation: &str,
) -> Result<OperationOutcome> {
    let object = CommentObject::resolve(target, operation)?;
    let sql = comment_sql(&object, comment)?;
    conn.execute_ddl(&sql).await?;

    let reference = object.reference()?;
    info!("{} comment on {}", if comment.is_some() { "Set" } else { "Removed" }, reference);
    Ok(OperationOutcome::ok(
        match comment {
            Some(_) => format!("Comment set on {}", reference),
            None => format!("Comment removed from {}", reference),
        },
        json!({
            "objectType": target.object_type.trim().to_lowercase(),
            "objectName": target.object_name.trim(),
            "comment": comment
        }),
    ))
}

async fn bulk_get(conn: &ConnectionHandle, args: BulkGet) -> Result<OperationOutcome> {
    let schema = schema_or_default(args.schema.as_deref());
    let kind = args
        .object_type
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(|t| validate_keyword("objectType", t, OBJECT_TYPES))
        .transpose()?;
    let rows = conn.query_json(BULK_COMMENTS_SQL, &[&schema, &kind]).await?;
    Ok(OperationOutcome::rows(
        format!("Found {} comment(s) in schema {}", rows.len(), schema),
        rows,
    ))
}

pub struct ManageCommentsTool;

#[async_trait]
impl ToolHandler for ManageCommentsTool {
    fn definition(&self) -> Tool {
        wide_tool::<CommentOperation>(
            "Manage object comments: read, set or remove the comment on a table, column, index, \
            view, sequence, function, trigger, constraint or schema, or list every comment in a schema.",
            json!({
                "objectType": {"type": "string", "enum": OBJECT_TYPES},
                "objectName": {"type": "string", "description": "Object name; the table name for columns"},
                "columnName": {"type": "string", "description": "Column name (objectType column)"},
                "tableName": {"type": "string", "description": "Owning table (objectType trigger or constraint)"},
                "schema": {"type": "string", "description": "Schema name (default: public)"},
                "comment": {"type": "string", "description": "Comment text for set"}
            }),
        )
    }

    #[instrument(skip(self, arguments, ctx), fields(tool = "pg_manage_comments"))]
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult> {
        let args = Arguments::new(arguments)?;
        let operation: CommentOperation = route(&args)?;
        let conn = ctx.connect(args.connection_string()).await?;

        let outcome = match operation {
            CommentOperation::Get(a) => get_comment(&conn, a).await?,
            CommentOperation::Set(a) => write_comment(&conn, &a.target, Some(&a.comment), "set").await?,
            CommentOperation::Remove(a) => write_comment(&conn, &a, None, "remove").await?,
            CommentOperation::BulkGet(a) => bulk_get(&conn, a).await?,
        };
        Ok(outcome.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(value: Value) -> CommentTarget {
        match route(&Arguments::new(value).unwrap()).unwrap() {
            CommentOperation::Get(t) | CommentOperation::Remove(t) => t,
            CommentOperation::Set(s) => s.target,
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[test]
    fn test_set_table_comment() {
        let t = target(json!({
            "operation": "set",
            "objectType": "table",
            "objectName": "orders",
            "comment": "Customer's orders"
        }));
        let object = CommentObject::resolve(&t, "set").unwrap();
        assert_eq!(
            comment_sql(&object, Some("Customer's orders")).unwrap(),
            "COMMENT ON TABLE \"public\".\"orders\" IS 'Customer''s orders'"
        );
    }

    #[test]
    fn test_remove_column_comment() {
        let t = target(json!({
            "operation": "remove",
            "objectType": "column",
            "objectName": "orders",
            "columnName": "total",
            "schema": "sales"
        }));
        let object = CommentObject::resolve(&t, "remove").unwrap();
        assert_eq!(
            comment_sql(&object, None).unwrap(),
            "COMMENT ON COLUMN \"sales\".\"orders\".\"total\" IS NULL"
        );
    }

    #[test]
    fn test_trigger_needs_table_name() {
        let t = target(json!({"operation": "get", "objectType": "trigger", "objectName": "audit"}));
        let err = CommentObject::resolve(&t, "get").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing required argument(s) for 'get': tableName"
        );
    }

    #[test]
    fn test_constraint_reference() {
        let t = target(json!({
            "operation": "get",
            "objectType": "CONSTRAINT",
            "objectName": "orders_pk",
            "tableName": "orders"
        }));
        let object = CommentObject::resolve(&t, "get").unwrap();
        assert_eq!(
            object.reference().unwrap(),
            "CONSTRAINT \"orders_pk\" ON \"public\".\"orders\""
        );
    }

    #[test]
    fn test_unknown_object_type() {
        let t = target(json!({"operation": "get", "objectType": "database", "objectName": "x"}));
        assert!(CommentObject::resolve(&t, "get").is_err());
    }

    #[test]
    fn test_set_requires_comment() {
        let err = route::<CommentOperation>(
            &Arguments::new(json!({"operation": "set", "objectType": "table", "objectName": "t"}))
                .unwrap(),
        )
        .unwrap_err();
        assert!(err.to_string().ends_with("comment"));
    }
}
