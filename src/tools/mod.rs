//! PostgreSQL administration tools and the registry they are served from.

pub mod analyze;
pub mod comments;
pub mod constraints;
pub mod debug;
pub mod diagnostics;
pub mod execute;
pub mod functions;
pub mod indexes;
pub mod monitor;
pub mod mutation;
pub mod query_stats;
pub mod registry;
pub mod rls;
pub mod router;
pub mod schema;
pub mod sql;
pub mod triggers;
pub mod users;

pub use analyze::AnalyzeDatabaseTool;
pub use comments::ManageCommentsTool;
pub use constraints::ManageConstraintsTool;
pub use debug::DebugDatabaseTool;
pub use execute::ExecuteQueryTool;
pub use functions::ManageFunctionsTool;
pub use indexes::ManageIndexesTool;
pub use monitor::MonitorDatabaseTool;
pub use mutation::ExecuteMutationTool;
pub use query_stats::ManageQueryTool;
pub use registry::{ToolContext, ToolHandler, ToolRegistry};
pub use rls::ManageRlsTool;
pub use router::{Arguments, OperationOutcome, OperationSet, route};
pub use schema::ManageSchemaTool;
pub use sql::ExecuteSqlTool;
pub use triggers::ManageTriggersTool;
pub use users::ManageUsersTool;

use std::sync::Arc;

/// Every tool this server ships, in the order `tools/list` reports them.
pub fn all_tools() -> Vec<Arc<dyn ToolHandler>> {
    vec![
        // Schema and DDL
        Arc::new(ManageFunctionsTool),
        Arc::new(ManageRlsTool),
        Arc::new(ManageIndexesTool),
        Arc::new(ManageSchemaTool),
        Arc::new(ManageTriggersTool),
        Arc::new(ManageUsersTool),
        Arc::new(ManageConstraintsTool),
        Arc::new(ManageQueryTool),
        Arc::new(ManageCommentsTool),
        // Data
        Arc::new(ExecuteQueryTool),
        Arc::new(ExecuteMutationTool),
        Arc::new(ExecuteSqlTool),
        // Diagnostics
        Arc::new(AnalyzeDatabaseTool),
        Arc::new(DebugDatabaseTool),
        Arc::new(MonitorDatabaseTool),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fifteen_uniquely_named_tools() {
        let names: Vec<String> = all_tools().iter().map(|t| t.definition().name).collect();
        assert_eq!(names.len(), 15);
        assert_eq!(names.iter().collect::<HashSet<_>>().len(), 15);
        assert!(names.iter().all(|name| name.starts_with("pg_")));
    }

    #[test]
    fn test_every_schema_offers_connection_string() {
        for tool in all_tools() {
            let definition = tool.definition();
            assert_eq!(definition.input_schema["type"], "object", "{}", definition.name);
            assert!(
                definition.input_schema["properties"]["connectionString"].is_object(),
                "{} lacks connectionString",
                definition.name
            );
            assert!(definition.description.is_some());
        }
    }
}
