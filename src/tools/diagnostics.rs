//! Shared pieces of the analysis, debugging and monitoring tools.

use crate::tools::router::operation_args;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Argument record for operations that take nothing beyond the discriminant.
#[derive(Debug, Default, Deserialize)]
pub struct NoArguments {}

operation_args! {
    NoArguments => [],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One recommendation or alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            message: message.into(),
        }
    }
}

/// Numeric field of a JSON row; numeric columns arrive as strings.
pub fn number(row: &Value, key: &str) -> Option<f64> {
    match row.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn text<'a>(row: &'a Value, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str)
}

/// Finds the row whose `name` column equals `name`.
pub fn setting<'a>(rows: &'a [Value], name: &str) -> Option<&'a Value> {
    rows.iter().find(|row| text(row, "name") == Some(name))
}

/// Findings sorted most severe first.
pub fn sorted(mut findings: Vec<Finding>) -> Vec<Finding> {
    findings.sort_by(|a, b| b.severity.cmp(&a.severity));
    findings
}
