//! Tool registry and the dispatch boundary every tool call passes through.

use crate::database::{ConnectionHandle, ConnectionManager, ConnectionResolver};
use crate::error::{ConfigError, ErrorKind, Result, ToolError};
use crate::protocol::{CallToolResult, Tool};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> Tool;
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<CallToolResult>;
}

/// What a tool gets to work with: the shared pools and the connection string fallbacks.
#[derive(Clone)]
pub struct ToolContext {
    connections: Arc<ConnectionManager>,
    resolver: ConnectionResolver,
}

impl ToolContext {
    pub fn new(connections: Arc<ConnectionManager>, resolver: ConnectionResolver) -> Self {
        Self {
            connections,
            resolver,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn resolver(&self) -> &ConnectionResolver {
        &self.resolver
    }

    /// Resolves the connection string for this call and checks out a client.
    pub async fn connect(&self, explicit: Option<&str>) -> Result<ConnectionHandle> {
        let connection_string = self.resolver.resolve(explicit)?;
        Ok(self.connections.connect(&connection_string).await?)
    }
}

struct RegisteredTool {
    definition: Tool,
    handler: Arc<dyn ToolHandler>,
}

/// Positions into the registry, in registry order, plus a name index.
#[derive(Default)]
struct EnabledSet {
    order: Vec<usize>,
    by_name: HashMap<String, usize>,
}

impl EnabledSet {
    fn from_positions(tools: &[RegisteredTool], order: Vec<usize>) -> Self {
        let by_name = order
            .iter()
            .map(|&position| (tools[position].definition.name.clone(), position))
            .collect();
        Self { order, by_name }
    }
}

/// The fixed set of tools a server was assembled with.
///
/// Membership never changes after construction. Only the enabled subset can be
/// recomputed, through [`ToolRegistry::apply_filter`].
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    enabled: RwLock<EnabledSet>,
}

impl ToolRegistry {
    /// Builds a registry with every tool enabled. Duplicate names are rejected.
    pub fn new(handlers: Vec<Arc<dyn ToolHandler>>) -> std::result::Result<Self, ConfigError> {
        let mut seen = HashSet::with_capacity(handlers.len());
        let mut tools = Vec::with_capacity(handlers.len());

        for handler in handlers {
            let definition = handler.definition();
            if !seen.insert(definition.name.clone()) {
                return Err(ConfigError::DuplicateTool(definition.name));
            }
            debug!("Registering tool: {}", definition.name);
            tools.push(RegisteredTool {
                definition,
                handler,
            });
        }

        let enabled = EnabledSet::from_positions(&tools, (0..tools.len()).collect());
        Ok(Self {
            tools,
            enabled: RwLock::new(enabled),
        })
    }

    /// Recomputes the enabled set from an optional allow-list.
    ///
    /// `None` enables everything. Names that match no tool are returned as
    /// warnings and otherwise ignored.
    pub fn apply_filter(&self, allow_list: Option<&[String]>) -> Vec<String> {
        let mut warnings = Vec::new();

        let order = match allow_list {
            None => (0..self.tools.len()).collect(),
            Some(names) => {
                let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
                for name in names {
                    if !self.contains(name) {
                        let warning = format!("Unknown tool in enabledTools: '{}'", name);
                        warn!("{}", warning);
                        warnings.push(warning);
                    }
                }
                self.tools
                    .iter()
                    .enumerate()
                    .filter(|(_, tool)| wanted.contains(tool.definition.name.as_str()))
                    .map(|(position, _)| position)
                    .collect()
            }
        };

        let enabled = EnabledSet::from_positions(&self.tools, order);
        info!(
            "{} of {} tools enabled",
            enabled.order.len(),
            self.tools.len()
        );
        *self.enabled.write() = enabled;
        warnings
    }

    /// Descriptors of the enabled tools, in registry order.
    pub fn list_tools(&self) -> Vec<Tool> {
        self.enabled
            .read()
            .order
            .iter()
            .map(|&position| self.tools[position].definition.clone())
            .collect()
    }

    /// Descriptors of every registered tool, enabled or not.
    pub fn all_tools(&self) -> Vec<Tool> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.definition.name == name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.read().by_name.contains_key(name)
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.read().order.len()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn lookup(&self, name: &str) -> std::result::Result<Arc<dyn ToolHandler>, ToolError> {
        let enabled = self.enabled.read();
        match enabled.by_name.get(name) {
            Some(&position) => Ok(Arc::clone(&self.tools[position].handler)),
            None => Err(ToolError::NotFound {
                name: name.to_string(),
                disabled: self.contains(name),
            }),
        }
    }

    /// Runs one tool call and always produces an envelope.
    ///
    /// The tool runs on its own task: an error it returns keeps its kind, a
    /// panic becomes `ToolExecutionFailed`, and neither reaches the caller.
    #[instrument(skip(self, arguments, ctx), fields(tool = %name))]
    pub async fn call_tool(&self, name: &str, arguments: Value, ctx: &ToolContext) -> CallToolResult {
        let handler = match self.lookup(name) {
            Ok(handler) => handler,
            Err(e) => {
                let message = e.not_found_message().unwrap_or_else(|| e.to_string());
                warn!("{}", message);
                return CallToolResult::failure(ErrorKind::ToolNotFound, message);
            }
        };

        let ctx = ctx.clone();
        let task = tokio::spawn(async move { handler.execute(arguments, &ctx).await });

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("Tool '{}' failed: {}", name, e);
                CallToolResult::failure(e.kind(), e)
            }
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                error!("Tool '{}' panicked: {}", name, message);
                CallToolResult::failure(
                    ErrorKind::ToolExecutionFailed,
                    format!("Tool '{}' failed unexpectedly: {}", name, message),
                )
            }
            Err(join_error) => {
                error!("Tool '{}' was cancelled: {}", name, join_error);
                CallToolResult::failure(
                    ErrorKind::ExecutionError,
                    format!("Tool '{}' was cancelled", name),
                )
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestTool(&'static str);

    #[async_trait]
    impl ToolHandler for TestTool {
        fn definition(&self) -> Tool {
            Tool {
                name: self.0.into(),
                description: Some("A test tool".into()),
                input_schema: json!({
                    "type": "object",
                    "properties": {}
                }),
            }
        }

        async fn execute(&self, arguments: Value, _ctx: &ToolContext) -> Result<CallToolResult> {
            match arguments.get("mode").and_then(Value::as_str) {
                Some("fail") => Err(ToolError::ExecutionFailed("told to fail".into()).into()),
                Some("panic") => panic!("told to panic"),
                _ => Ok(CallToolResult::text(format!("{} ok", self.0))),
            }
        }
    }

    fn registry(names: &[&'static str]) -> ToolRegistry {
        ToolRegistry::new(
            names
                .iter()
                .map(|&name| Arc::new(TestTool(name)) as Arc<dyn ToolHandler>)
                .collect(),
        )
        .unwrap()
    }

    fn ctx() -> ToolContext {
        ToolContext::new(
            Arc::new(ConnectionManager::default()),
            ConnectionResolver::default(),
        )
    }

    #[test]
    fn test_duplicate_names_fail_fast() {
        let result = ToolRegistry::new(vec![
            Arc::new(TestTool("a")) as Arc<dyn ToolHandler>,
            Arc::new(TestTool("a")),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicateTool(name)) if name == "a"));
    }

    #[test]
    fn test_filter_preserves_registry_order() {
        let registry = registry(&["a", "b", "c"]);
        let warnings = registry.apply_filter(Some(&["c".to_string(), "a".to_string()]));
        assert!(warnings.is_empty());

        let names: Vec<String> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(registry.all_tools().len(), 3);
    }

    #[test]
    fn test_filter_warns_on_unknown_names() {
        let registry = registry(&["a"]);
        let warnings = registry.apply_filter(Some(&["a".to_string(), "zzz".to_string()]));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("zzz"));
        assert!(registry.is_enabled("a"));
    }

    #[test]
    fn test_filter_is_idempotent_and_reversible() {
        let registry = registry(&["a", "b"]);
        let allow = vec!["b".to_string()];
        registry.apply_filter(Some(&allow));
        registry.apply_filter(Some(&allow));
        assert_eq!(registry.enabled_count(), 1);

        registry.apply_filter(None);
        assert_eq!(registry.enabled_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_tools() {
        let registry = registry(&["a", "b"]);
        registry.apply_filter(Some(&["a".to_string()]));

        let missing = registry.call_tool("nope", json!({}), &ctx()).await;
        assert!(missing.is_error());
        assert!(missing.text_content().starts_with("ToolNotFound:"));
        assert!(missing.text_content().contains("does not exist"));

        let disabled = registry.call_tool("b", json!({}), &ctx()).await;
        assert!(disabled.is_error());
        assert!(disabled.text_content().contains("exists but is disabled"));
    }

    #[tokio::test]
    async fn test_errors_and_panics_become_envelopes() {
        let registry = registry(&["a"]);

        let ok = registry.call_tool("a", json!({}), &ctx()).await;
        assert!(!ok.is_error());

        let failed = registry.call_tool("a", json!({"mode": "fail"}), &ctx()).await;
        assert!(failed.is_error());
        assert!(failed.text_content().contains("told to fail"));

        let panicked = registry.call_tool("a", json!({"mode": "panic"}), &ctx()).await;
        assert!(panicked.is_error());
        assert!(panicked.text_content().starts_with("ToolExecutionFailed:"));
        assert!(panicked.text_content().contains("told to panic"));
    }

    #[tokio::test]
    async fn test_context_without_connection_string_is_configuration_error() {
        let err = match ctx().connect(None).await {
            Err(e) => e,
            Ok(_) => panic!("connected without a connection string"),
        };
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }
}
