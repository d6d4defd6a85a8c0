//! Operation routing for wide tools.
//!
//! A wide tool takes an `operation` discriminant and one flat argument object.
//! Each tool declares an enum with one variant per operation; [`route`] checks
//! the discriminant and the variant's required fields before anything touches
//! the database, then hands back a fully typed value.

use crate::error::ToolError;
use crate::protocol::{CallToolResult, Tool};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

/// Schema name used when a call does not supply one.
pub const DEFAULT_SCHEMA: &str = "public";

/// An argument record for one operation.
pub trait OperationArgs: DeserializeOwned {
    /// Fields that must be present and non-blank, in the order they are reported.
    const REQUIRED: &'static [&'static str];
}

/// Implements [`OperationArgs`] for a list of argument records.
macro_rules! operation_args {
    ($($ty:ty => [$($field:literal),* $(,)?]),* $(,)?) => {
        $(
            impl $crate::tools::router::OperationArgs for $ty {
                const REQUIRED: &'static [&'static str] = &[$($field),*];
            }
        )*
    };
}
pub(crate) use operation_args;

/// The closed set of operations one wide tool accepts.
pub trait OperationSet: Sized {
    const TOOL: &'static str;
    const OPERATIONS: &'static [&'static str];
    /// Argument that selects the operation.
    const DISCRIMINANT: &'static str = "operation";

    /// Builds the variant for `operation`, which is already known to be in [`Self::OPERATIONS`].
    fn parse(operation: &str, args: &Arguments) -> Result<Self, ToolError>;
}

/// Validates the discriminant and parses the selected operation.
pub fn route<T: OperationSet>(args: &Arguments) -> Result<T, ToolError> {
    let Some(operation) = args.str(T::DISCRIMINANT) else {
        return Err(ToolError::MissingArgument {
            operation: T::TOOL.into(),
            fields: vec![T::DISCRIMINANT],
        });
    };
    if !T::OPERATIONS.contains(&operation) {
        return Err(unknown_operation::<T>(operation));
    }
    T::parse(operation, args)
}

pub fn unknown_operation<T: OperationSet>(operation: &str) -> ToolError {
    ToolError::UnknownOperation {
        tool: T::TOOL,
        operation: operation.to_string(),
        valid: T::OPERATIONS,
    }
}

/// The raw argument object of one call.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    map: Map<String, Value>,
}

impl Arguments {
    /// Accepts an object, or `null` for "no arguments".
    pub fn new(value: Value) -> Result<Self, ToolError> {
        match value {
            Value::Object(map) => Ok(Self { map }),
            Value::Null => Ok(Self::default()),
            other => Err(ToolError::invalid(format!(
                "Arguments must be an object, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    /// Trimmed, non-empty string value.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn connection_string(&self) -> Option<&str> {
        self.str("connectionString")
    }

    /// Absent, `null`, blank strings and empty arrays count as missing.
    pub fn is_present(&self, key: &str) -> bool {
        match self.get(key) {
            None => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        }
    }

    pub fn missing(&self, fields: &[&'static str]) -> Vec<&'static str> {
        fields
            .iter()
            .copied()
            .filter(|field| !self.is_present(field))
            .collect()
    }

    /// Checks every required field of `R`, then deserializes it.
    ///
    /// All missing fields are reported together.
    pub fn extract<R: OperationArgs>(&self, operation: &str) -> Result<R, ToolError> {
        let missing = self.missing(R::REQUIRED);
        if !missing.is_empty() {
            return Err(ToolError::MissingArgument {
                operation: operation.to_string().into(),
                fields: missing,
            });
        }

        // Nulls are dropped so `Option` fields and `#[serde(default)]` behave the same.
        let object: Map<String, Value> = self
            .map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        serde_json::from_value(Value::Object(object)).map_err(|e| {
            ToolError::invalid(format!("Invalid arguments for '{}': {}", operation, e))
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Normalized result of one operation branch.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl OperationOutcome {
    pub fn ok(message: impl Into<String>, details: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            details,
        }
    }

    /// Result of a read branch: the rows themselves are the details.
    pub fn rows(message: impl Into<String>, rows: Vec<Value>) -> Self {
        Self::ok(message, Value::Array(rows))
    }

    pub fn into_result(self) -> CallToolResult {
        CallToolResult::json(&self)
    }
}

/// `schema` or [`DEFAULT_SCHEMA`].
pub fn schema_or_default(schema: Option<&str>) -> &str {
    schema
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SCHEMA)
}

/// Descriptor for a wide tool: adds the discriminant and `connectionString` to `properties`.
pub fn wide_tool<T: OperationSet>(description: &str, properties: Value) -> Tool {
    let mut properties = match properties {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    properties.insert(
        T::DISCRIMINANT.into(),
        json!({
            "type": "string",
            "enum": T::OPERATIONS,
            "description": format!("Operation to perform: {}", T::OPERATIONS.join(", "))
        }),
    );
    insert_connection_string(&mut properties);

    Tool {
        name: T::TOOL.into(),
        description: Some(description.into()),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": [T::DISCRIMINANT]
        }),
    }
}

/// Descriptor for a single-purpose tool.
pub fn simple_tool(name: &str, description: &str, properties: Value, required: &[&str]) -> Tool {
    let mut properties = match properties {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    insert_connection_string(&mut properties);

    Tool {
        name: name.into(),
        description: Some(description.into()),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required
        }),
    }
}

fn insert_connection_string(properties: &mut Map<String, Value>) {
    properties.insert(
        "connectionString".into(),
        json!({
            "type": "string",
            "description": "PostgreSQL connection string. Falls back to the server default when omitted."
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Create {
        function_name: String,
        return_type: String,
        function_body: String,
        #[serde(default)]
        replace: bool,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Get {
        schema: Option<String>,
    }

    operation_args! {
        Create => ["functionName", "returnType", "functionBody"],
        Get => [],
    }

    #[derive(Debug)]
    enum Demo {
        Create(Create),
        Get(Get),
    }

    impl OperationSet for Demo {
        const TOOL: &'static str = "demo_tool";
        const OPERATIONS: &'static [&'static str] = &["create", "get"];

        fn parse(operation: &str, args: &Arguments) -> Result<Self, ToolError> {
            match operation {
                "create" => args.extract(operation).map(Demo::Create),
                "get" => args.extract(operation).map(Demo::Get),
                other => Err(unknown_operation::<Self>(other)),
            }
        }
    }

    fn args(value: Value) -> Arguments {
        Arguments::new(value).unwrap()
    }

    #[test]
    fn test_missing_operation() {
        let err = route::<Demo>(&args(json!({}))).unwrap_err();
        assert!(matches!(err, ToolError::MissingArgument { ref fields, .. } if fields == &["operation"]));
    }

    #[test]
    fn test_unknown_operation_lists_valid_set() {
        let err = route::<Demo>(&args(json!({"operation": "explode"}))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown operation 'explode' for demo_tool. Valid operations: create, get"
        );
    }

    #[test]
    fn test_all_missing_fields_reported_at_once() {
        let err = route::<Demo>(&args(json!({"operation": "create", "parameters": ""}))).unwrap_err();
        match err {
            ToolError::MissingArgument { operation, fields } => {
                assert_eq!(operation, "create");
                assert_eq!(fields, vec!["functionName", "returnType", "functionBody"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_blank_and_null_count_as_missing() {
        let err = route::<Demo>(&args(json!({
            "operation": "create",
            "functionName": "  ",
            "returnType": null,
            "functionBody": "SELECT 1"
        })))
        .unwrap_err();
        assert!(err.to_string().contains("functionName, returnType"));
    }

    #[test]
    fn test_typed_record_is_built() {
        let parsed = route::<Demo>(&args(json!({
            "operation": "create",
            "functionName": "f",
            "returnType": "TEXT",
            "functionBody": "SELECT 1"
        })))
        .unwrap();
        match parsed {
            Demo::Create(create) => {
                assert_eq!(create.function_name, "f");
                assert_eq!(create.return_type, "TEXT");
                assert_eq!(create.function_body, "SELECT 1");
                assert!(!create.replace);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_null_optional_fields_are_absent() {
        let parsed = route::<Demo>(&args(json!({"operation": "get", "schema": null}))).unwrap();
        assert!(matches!(parsed, Demo::Get(Get { schema: None })));
    }

    #[test]
    fn test_wrong_type_is_validation_error() {
        let err = route::<Demo>(&args(json!({
            "operation": "create",
            "functionName": "f",
            "returnType": "TEXT",
            "functionBody": "SELECT 1",
            "replace": "sometimes"
        })))
        .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn test_non_object_arguments_rejected() {
        assert!(Arguments::new(json!([1, 2])).is_err());
        assert!(Arguments::new(Value::Null).is_ok());
    }

    #[test]
    fn test_schema_default() {
        assert_eq!(schema_or_default(None), "public");
        assert_eq!(schema_or_default(Some(" ")), "public");
        assert_eq!(schema_or_default(Some("audit")), "audit");
    }

    #[test]
    fn test_wide_tool_schema() {
        let tool = wide_tool::<Demo>("Demo", json!({"schema": {"type": "string"}}));
        assert_eq!(tool.name, "demo_tool");
        let schema = &tool.input_schema;
        assert_eq!(schema["properties"]["operation"]["enum"], json!(["create", "get"]));
        assert!(schema["properties"]["connectionString"].is_object());
        assert_eq!(schema["required"], json!(["operation"]));
    }

    #[test]
    fn test_outcome_envelope() {
        let result = OperationOutcome::ok("Function f created", json!({"name": "f"})).into_result();
        let body: Value = serde_json::from_str(&result.text_content()).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["details"]["name"], "f");
    }
}
