//! Registry, routing and dispatch through the public API. No database needed.

use async_trait::async_trait;
use pg_admin_mcp::config::ServerConfig;
use pg_admin_mcp::error::{Result, ToolError};
use pg_admin_mcp::protocol::{CallToolResult, LineTransport, McpServerBuilder, StopReason, Tool};
use pg_admin_mcp::server::{McpHandler, ServerState, ServerStateBuilder};
use pg_admin_mcp::tools::{ToolContext, ToolHandler};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Barrier;
use tokio::task::JoinSet;

fn state() -> Arc<ServerState> {
    Arc::new(
        ServerStateBuilder::new()
            .config(ServerConfig::default())
            .build()
            .unwrap(),
    )
}

async fn call(state: &ServerState, name: &str, arguments: Value) -> CallToolResult {
    state.tools.call_tool(name, arguments, state.context()).await
}

#[test]
fn test_registry_holds_fifteen_tools_in_order() {
    let state = state();
    let names: Vec<String> = state.tools.list_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names.len(), 15);
    assert_eq!(names.first().map(String::as_str), Some("pg_manage_functions"));
    assert_eq!(names.last().map(String::as_str), Some("pg_monitor_database"));
}

#[test]
fn test_allow_list_file_enables_exactly_one_tool() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"enabledTools": ["pg_manage_functions"]}}"#).unwrap();

    let config = ServerConfig::builder()
        .tools_config(Some(file.path().to_path_buf()))
        .build();
    let state = ServerStateBuilder::new().config(config).build().unwrap();

    let listed: Vec<String> = state.tools.list_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(listed, vec!["pg_manage_functions"]);
    assert!(!state.tools.is_enabled("pg_manage_rls"));
}

#[tokio::test]
async fn test_disabled_and_unknown_tools_are_distinguished() {
    let state = state();
    state.tools.apply_filter(Some(&["pg_manage_functions".to_string()]));

    let disabled = call(&state, "pg_manage_rls", json!({"operation": "enable"})).await;
    assert!(disabled.is_error());
    assert!(disabled.text_content().starts_with("ToolNotFound:"));
    assert!(disabled.text_content().contains("disabled"));

    let unknown = call(&state, "pg_launch_rockets", json!({})).await;
    assert!(unknown.is_error());
    assert!(unknown.text_content().contains("does not exist"));
}

#[tokio::test]
async fn test_unknown_operation_lists_valid_operations() {
    let state = state();
    let result = call(&state, "pg_manage_functions", json!({"operation": "explode"})).await;
    assert!(result.is_error());
    assert_eq!(
        result.text_content(),
        "UnknownOperation: Unknown operation 'explode' for pg_manage_functions. Valid operations: get, create, drop"
    );
}

#[tokio::test]
async fn test_every_missing_field_is_named() {
    let state = state();
    let result = call(&state, "pg_manage_functions", json!({"operation": "create"})).await;
    assert!(result.is_error());
    assert!(result.text_content().starts_with("MissingArgument:"));
    assert!(
        result
            .text_content()
            .ends_with("functionName, returnType, functionBody")
    );
}

#[tokio::test]
async fn test_validation_happens_before_connecting() {
    let state = state();
    let result = call(
        &state,
        "pg_execute_query",
        json!({"operation": "select", "query": "DROP TABLE users"}),
    )
    .await;
    assert!(result.text_content().starts_with("ValidationError:"));
}

#[tokio::test]
async fn test_missing_connection_string_is_configuration_error() {
    let state = state();
    let result = call(&state, "pg_execute_sql", json!({"sql": "SELECT 1"})).await;
    assert!(result.is_error());
    assert!(result.text_content().starts_with("ConfigurationError:"));

    // The server keeps serving after a failed call.
    let again = call(&state, "pg_manage_functions", json!({})).await;
    assert!(again.text_content().starts_with("MissingArgument:"));
}

/// Every instance must be inside `execute` at once for the barrier to open.
struct RendezvousTool {
    barrier: Arc<Barrier>,
}

#[async_trait]
impl ToolHandler for RendezvousTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "rendezvous".into(),
            description: None,
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(&self, arguments: Value, _ctx: &ToolContext) -> Result<CallToolResult> {
        self.barrier.wait().await;
        match arguments.get("id").and_then(Value::as_u64) {
            Some(id) => Ok(CallToolResult::text(id.to_string())),
            None => Err(ToolError::invalid("id is required").into()),
        }
    }
}

#[tokio::test]
async fn test_calls_run_concurrently() {
    const CALLS: u64 = 8;
    let state = Arc::new(
        ServerStateBuilder::new()
            .tools(vec![Arc::new(RendezvousTool {
                barrier: Arc::new(Barrier::new(CALLS as usize)),
            }) as Arc<dyn ToolHandler>])
            .build()
            .unwrap(),
    );

    let mut calls = JoinSet::new();
    for id in 0..CALLS {
        let state = Arc::clone(&state);
        calls.spawn(async move { call(&state, "rendezvous", json!({"id": id})).await });
    }

    let results = tokio::time::timeout(Duration::from_secs(5), calls.join_all())
        .await
        .expect("calls did not overlap");
    let mut ids: Vec<u64> = results
        .iter()
        .map(|r| r.text_content().parse().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..CALLS).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_stdio_session() {
    let input = [
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "it", "version": "1"}
        }}),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {
            "name": "pg_manage_rls", "arguments": {"operation": "enable"}
        }}),
        json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {
            "name": "nope", "arguments": {}
        }}),
    ]
    .iter()
    .map(Value::to_string)
    .collect::<Vec<_>>()
    .join("\n")
        + "\n";

    let (writer, mut output) = tokio::io::duplex(1 << 20);
    let transport = Arc::new(LineTransport::from_parts(
        std::io::Cursor::new(input.into_bytes()),
        writer,
    ));
    let server = McpServerBuilder::new()
        .handler(McpHandler::new(state()))
        .with_tools()
        .build()
        .unwrap();

    let reason = server
        .run_with_transport(transport, std::future::pending())
        .await
        .unwrap();
    assert_eq!(reason, StopReason::EndOfInput);

    let mut text = String::new();
    output.read_to_string(&mut text).await.unwrap();
    let responses: HashMap<i64, Value> = text
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .map(|response| (response["id"].as_i64().unwrap(), response))
        .collect();

    assert_eq!(responses.len(), 4);
    assert_eq!(responses[&1]["result"]["serverInfo"]["name"], "pg-admin-mcp");
    assert_eq!(
        responses[&1]["result"]["capabilities"]["tools"]["listChanged"],
        false
    );
    assert_eq!(
        responses[&2]["result"]["tools"].as_array().map(Vec::len),
        Some(15)
    );

    let rls = &responses[&3]["result"];
    assert_eq!(rls["isError"], true);
    assert!(
        rls["content"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("MissingArgument:")
    );

    // Tool failures never become JSON-RPC errors.
    assert!(responses[&4]["error"].is_null());
    assert_eq!(responses[&4]["result"]["isError"], true);
}
