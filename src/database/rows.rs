//! Conversion of PostgreSQL rows into JSON objects.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use tokio_postgres::Row;
use tokio_postgres::types::FromSql;

/// Converts a row into a JSON object keyed by column name.
pub fn row_to_json(row: &Row) -> Value {
    let mut object = Map::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(
            column.name().to_string(),
            cell_to_json(row, index, column.type_().name()),
        );
    }
    Value::Object(object)
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, index: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(index).ok().flatten()
}

fn float(value: Option<f64>) -> Value {
    value
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Extract a cell value, guided by the column's type name.
fn cell_to_json(row: &Row, index: usize, type_name: &str) -> Value {
    match type_name {
        "bool" => get::<bool>(row, index).map(Value::Bool).unwrap_or(Value::Null),
        "int2" => get::<i16>(row, index).map(Value::from).unwrap_or(Value::Null),
        "int4" => get::<i32>(row, index).map(Value::from).unwrap_or(Value::Null),
        "int8" => get::<i64>(row, index).map(Value::from).unwrap_or(Value::Null),
        "oid" => get::<u32>(row, index).map(Value::from).unwrap_or(Value::Null),
        "float4" => float(get::<f32>(row, index).map(f64::from)),
        "float8" => float(get::<f64>(row, index)),
        // Numeric is reported as a string so precision survives the trip through JSON.
        "numeric" => get::<Decimal>(row, index)
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        "json" | "jsonb" => get::<Value>(row, index).unwrap_or(Value::Null),
        "timestamptz" => get::<DateTime<Utc>>(row, index)
            .map(|ts| Value::String(ts.to_rfc3339()))
            .unwrap_or(Value::Null),
        "timestamp" => get::<NaiveDateTime>(row, index)
            .map(|ts| Value::String(ts.to_string()))
            .unwrap_or(Value::Null),
        "date" => get::<NaiveDate>(row, index)
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        "_text" | "_varchar" | "_name" | "_bpchar" => get::<Vec<Option<String>>>(row, index)
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect()))
            .unwrap_or(Value::Null),
        "_int2" => get::<Vec<Option<i16>>>(row, index)
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect()))
            .unwrap_or(Value::Null),
        "_int4" => get::<Vec<Option<i32>>>(row, index)
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect()))
            .unwrap_or(Value::Null),
        "_int8" => get::<Vec<Option<i64>>>(row, index)
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect()))
            .unwrap_or(Value::Null),
        "bytea" => get::<Vec<u8>>(row, index)
            .map(|bytes| {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                Value::String(format!("\\x{}", hex))
            })
            .unwrap_or(Value::Null),
        // Fallback: try as string
        _ => get::<String>(row, index).map(Value::String).unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_rejects_nan() {
        assert_eq!(float(Some(f64::NAN)), Value::Null);
        assert_eq!(float(Some(1.5)), serde_json::json!(1.5));
        assert_eq!(float(None), Value::Null);
    }
}
