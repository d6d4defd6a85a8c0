//! Positional parameter binding for JSON argument values.
//!
//! PostgreSQL infers a type for every `$n` placeholder; [`SqlValue`] encodes the
//! caller's JSON value as that type, so values never have to be spliced into SQL text.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::error::Error;
use std::str::FromStr;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};

type BoxError = Box<dyn Error + Sync + Send>;

/// A JSON value bound to a query placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlValue(pub Value);

impl SqlValue {
    pub fn from_values(values: &[Value]) -> Vec<SqlValue> {
        values.iter().cloned().map(SqlValue).collect()
    }

    /// Borrows `values` as a parameter list.
    pub fn refs(values: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
        values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
    }

    fn text(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn as_bool(&self) -> Result<bool, BoxError> {
        match &self.0 {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(false),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(true),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "yes" | "on" | "1" => Ok(true),
                "false" | "f" | "no" | "off" | "0" => Ok(false),
                _ => Err(format!("'{}' is not a boolean", s).into()),
            },
            other => Err(format!("{} is not a boolean", other).into()),
        }
    }

    fn as_i64(&self) -> Result<i64, BoxError> {
        match &self.0 {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| format!("{} is not an integer", n).into()),
            Value::String(s) => Ok(s.trim().parse::<i64>()?),
            Value::Bool(b) => Ok(i64::from(*b)),
            other => Err(format!("{} is not an integer", other).into()),
        }
    }

    fn as_f64(&self) -> Result<f64, BoxError> {
        match &self.0 {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| format!("{} is not a number", n).into()),
            Value::String(s) => Ok(s.trim().parse::<f64>()?),
            other => Err(format!("{} is not a number", other).into()),
        }
    }

    fn as_string_array(&self) -> Result<Vec<Option<String>>, BoxError> {
        match &self.0 {
            Value::Array(items) => Ok(items
                .iter()
                .map(|item| match item {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .collect()),
            other => Err(format!("{} is not an array", other).into()),
        }
    }

    fn as_i64_array(&self) -> Result<Vec<Option<i64>>, BoxError> {
        match &self.0 {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Null => Ok(None),
                    other => SqlValue(other.clone()).as_i64().map(Some),
                })
                .collect(),
            other => Err(format!("{} is not an array", other).into()),
        }
    }
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, BoxError> {
    const FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d"];
    for format in FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(ts);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        && let Some(ts) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(ts);
    }
    Err(format!("'{}' is not a timestamp", s).into())
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if self.0.is_null() {
            return Ok(IsNull::Yes);
        }

        match ty.name() {
            "bool" => self.as_bool()?.to_sql(ty, out),
            "int2" => i16::try_from(self.as_i64()?)?.to_sql(ty, out),
            "int4" => i32::try_from(self.as_i64()?)?.to_sql(ty, out),
            "int8" => self.as_i64()?.to_sql(ty, out),
            "oid" => u32::try_from(self.as_i64()?)?.to_sql(ty, out),
            "float4" => (self.as_f64()? as f32).to_sql(ty, out),
            "float8" => self.as_f64()?.to_sql(ty, out),
            "numeric" => Decimal::from_str(self.text().trim())?.to_sql(ty, out),
            "json" | "jsonb" => self.0.to_sql(ty, out),
            "timestamptz" => DateTime::parse_from_rfc3339(self.text().trim())?
                .with_timezone(&Utc)
                .to_sql(ty, out),
            "timestamp" => parse_timestamp(self.text().trim())?.to_sql(ty, out),
            "date" => NaiveDate::parse_from_str(self.text().trim(), "%Y-%m-%d")?.to_sql(ty, out),
            "text" | "varchar" | "bpchar" | "name" | "unknown" | "citext" => {
                self.text().as_str().to_sql(ty, out)
            }
            "_text" | "_varchar" | "_name" => self.as_string_array()?.to_sql(ty, out),
            "_int4" | "_int8" => {
                if ty.name() == "_int4" {
                    let values = self
                        .as_i64_array()?
                        .into_iter()
                        .map(|v| v.map(i32::try_from).transpose())
                        .collect::<Result<Vec<_>, _>>()?;
                    values.to_sql(ty, out)
                } else {
                    self.as_i64_array()?.to_sql(ty, out)
                }
            }
            other => Err(format!(
                "cannot bind {} to a parameter of type {}; add an explicit cast such as $1::text",
                self.0, other
            )
            .into()),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: Value, ty: &Type) -> Result<BytesMut, BoxError> {
        let mut buf = BytesMut::new();
        SqlValue(value).to_sql(ty, &mut buf)?;
        Ok(buf)
    }

    #[test]
    fn test_null_is_null_for_any_type() {
        let mut buf = BytesMut::new();
        let is_null = SqlValue(Value::Null).to_sql(&Type::INT4, &mut buf).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
    }

    #[test]
    fn test_integer_encodings() {
        assert_eq!(encode(json!(7), &Type::INT4).unwrap().as_ref(), &7i32.to_be_bytes());
        assert_eq!(encode(json!("42"), &Type::INT8).unwrap().as_ref(), &42i64.to_be_bytes());
        assert!(encode(json!(70000), &Type::INT2).is_err());
    }

    #[test]
    fn test_text_takes_any_scalar() {
        assert_eq!(encode(json!("abc"), &Type::TEXT).unwrap().as_ref(), b"abc");
        assert_eq!(encode(json!(12), &Type::VARCHAR).unwrap().as_ref(), b"12");
    }

    #[test]
    fn test_bool_from_strings() {
        assert_eq!(encode(json!("yes"), &Type::BOOL).unwrap().as_ref(), &[1u8]);
        assert!(encode(json!("maybe"), &Type::BOOL).is_err());
    }

    #[test]
    fn test_unsupported_type_asks_for_cast() {
        let err = encode(json!("x"), &Type::INET).unwrap_err();
        assert!(err.to_string().contains("explicit cast"));
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp("2024-01-02T03:04:05").is_ok());
        assert!(parse_timestamp("2024-01-02 03:04:05.123").is_ok());
        assert!(parse_timestamp("2024-01-02").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
