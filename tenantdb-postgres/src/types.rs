//! Conversion between JSON values and PostgreSQL types.
//!
//! Parameters are converted using the types the server inferred when the
//! statement was prepared, so `$1` bound to `"42"` works for a `text` column
//! and `42` works for an `int4` one. Rows come back as JSON objects keyed by
//! column name.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Number, Value};
use tokio_postgres::Row;
use tokio_postgres::types::{ToSql, Type};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PgError, PgResult};

/// A boxed parameter ready to bind.
pub type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Convert `values` to parameters for a statement expecting `types`.
pub fn to_sql_params(types: &[Type], values: &[Value]) -> PgResult<Vec<SqlParam>> {
    if types.len() != values.len() {
        return Err(PgError::type_conversion(format!(
            "statement expects {} parameters, {} given",
            types.len(),
            values.len()
        )));
    }

    types
        .iter()
        .zip(values)
        .enumerate()
        .map(|(i, (ty, value))| {
            to_sql_param(ty, value).map_err(|e| match e {
                PgError::TypeConversion(msg) => PgError::type_conversion(format!("parameter ${}: {}", i + 1, msg)),
                other => other,
            })
        })
        .collect()
}

/// Convert one value to a parameter of type `ty`.
pub fn to_sql_param(ty: &Type, value: &Value) -> PgResult<SqlParam> {
    if value.is_null() {
        return null_of(ty);
    }

    let param: SqlParam = match *ty {
        Type::BOOL => Box::new(value.as_bool().ok_or_else(|| mismatch(ty, value))?),
        Type::INT2 => Box::new(i16::try_from(as_i64(ty, value)?).map_err(|_| mismatch(ty, value))?),
        Type::INT4 => Box::new(i32::try_from(as_i64(ty, value)?).map_err(|_| mismatch(ty, value))?),
        Type::INT8 => Box::new(as_i64(ty, value)?),
        Type::FLOAT4 => Box::new(as_f64(ty, value)? as f32),
        Type::FLOAT8 => Box::new(as_f64(ty, value)?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => Box::new(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        Type::JSON | Type::JSONB => Box::new(value.clone()),
        Type::UUID => Box::new(
            as_str(ty, value)?
                .parse::<Uuid>()
                .map_err(|e| PgError::type_conversion(format!("invalid uuid: {}", e)))?,
        ),
        Type::TIMESTAMPTZ => Box::new(
            DateTime::parse_from_rfc3339(as_str(ty, value)?)
                .map_err(|e| PgError::type_conversion(format!("invalid timestamp: {}", e)))?
                .with_timezone(&Utc),
        ),
        Type::TIMESTAMP => Box::new(
            as_str(ty, value)?
                .parse::<NaiveDateTime>()
                .map_err(|e| PgError::type_conversion(format!("invalid timestamp: {}", e)))?,
        ),
        Type::DATE => Box::new(
            as_str(ty, value)?
                .parse::<NaiveDate>()
                .map_err(|e| PgError::type_conversion(format!("invalid date: {}", e)))?,
        ),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => Box::new(
            as_array(ty, value)?
                .iter()
                .map(|v| as_str(&Type::TEXT, v).map(str::to_string))
                .collect::<PgResult<Vec<String>>>()?,
        ),
        Type::INT4_ARRAY => Box::new(
            as_array(ty, value)?
                .iter()
                .map(|v| i32::try_from(as_i64(&Type::INT4, v)?).map_err(|_| mismatch(&Type::INT4, v)))
                .collect::<PgResult<Vec<i32>>>()?,
        ),
        Type::INT8_ARRAY => Box::new(
            as_array(ty, value)?
                .iter()
                .map(|v| as_i64(&Type::INT8, v))
                .collect::<PgResult<Vec<i64>>>()?,
        ),
        _ => {
            return Err(PgError::type_conversion(format!(
                "no JSON conversion for type {}; cast the placeholder, e.g. $1::text",
                ty
            )));
        }
    };
    Ok(param)
}

fn null_of(ty: &Type) -> PgResult<SqlParam> {
    let param: SqlParam = match *ty {
        Type::BOOL => Box::new(None::<bool>),
        Type::INT2 => Box::new(None::<i16>),
        Type::INT4 => Box::new(None::<i32>),
        Type::INT8 => Box::new(None::<i64>),
        Type::FLOAT4 => Box::new(None::<f32>),
        Type::FLOAT8 => Box::new(None::<f64>),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => Box::new(None::<String>),
        Type::JSON | Type::JSONB => Box::new(None::<Value>),
        Type::UUID => Box::new(None::<Uuid>),
        Type::TIMESTAMPTZ => Box::new(None::<DateTime<Utc>>),
        Type::TIMESTAMP => Box::new(None::<NaiveDateTime>),
        Type::DATE => Box::new(None::<NaiveDate>),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => Box::new(None::<Vec<String>>),
        Type::INT4_ARRAY => Box::new(None::<Vec<i32>>),
        Type::INT8_ARRAY => Box::new(None::<Vec<i64>>),
        _ => {
            return Err(PgError::type_conversion(format!(
                "no JSON conversion for type {}; cast the placeholder, e.g. $1::text",
                ty
            )));
        }
    };
    Ok(param)
}

fn mismatch(ty: &Type, value: &Value) -> PgError {
    PgError::type_conversion(format!("cannot bind {} to {}", value, ty))
}

fn as_i64(ty: &Type, value: &Value) -> PgResult<i64> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| mismatch(ty, value)),
        Value::String(s) => s.trim().parse().map_err(|_| mismatch(ty, value)),
        _ => Err(mismatch(ty, value)),
    }
}

fn as_f64(ty: &Type, value: &Value) -> PgResult<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| mismatch(ty, value)),
        Value::String(s) => s.trim().parse().map_err(|_| mismatch(ty, value)),
        _ => Err(mismatch(ty, value)),
    }
}

fn as_str<'v>(ty: &Type, value: &'v Value) -> PgResult<&'v str> {
    value.as_str().ok_or_else(|| mismatch(ty, value))
}

fn as_array<'v>(ty: &Type, value: &'v Value) -> PgResult<&'v Vec<Value>> {
    value.as_array().ok_or_else(|| mismatch(ty, value))
}

/// Convert a row to a JSON object keyed by column name.
pub fn row_to_json(row: &Row) -> PgResult<Value> {
    let mut object = Map::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = column_to_json(row, i, column.type_())?;
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}

fn column_to_json(row: &Row, i: usize, ty: &Type) -> PgResult<Value> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(i)?.map(Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(i)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(i)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(i)?.map(Value::from),
        Type::OID => row.try_get::<_, Option<u32>>(i)?.map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(i)?
            .and_then(|v| Number::from_f64(f64::from(v)))
            .map(Value::Number),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(i)?
            .and_then(Number::from_f64)
            .map(Value::Number),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            row.try_get::<_, Option<String>>(i)?.map(Value::String)
        }
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(i)?,
        Type::UUID => row.try_get::<_, Option<Uuid>>(i)?.map(|v| Value::String(v.to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(i)?
            .map(|v| Value::String(v.to_rfc3339())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(i)?
            .map(|v| Value::String(v.to_string())),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(i)?.map(|v| Value::String(v.to_string())),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(i)?.map(|bytes| {
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            Value::String(format!("\\x{}", hex))
        }),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<String>>>(i)?
            .map(|v| Value::Array(v.into_iter().map(Value::String).collect())),
        Type::INT4_ARRAY => row
            .try_get::<_, Option<Vec<i32>>>(i)?
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        Type::INT8_ARRAY => row
            .try_get::<_, Option<Vec<i64>>>(i)?
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        _ => {
            debug!(column = i, pg_type = %ty, "No JSON conversion for column type; returning null");
            None
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_follow_declared_types() {
        let types = [Type::INT4, Type::TEXT, Type::BOOL, Type::JSONB, Type::UUID];
        let values = [
            json!(7),
            json!("acme"),
            json!(true),
            json!({"a": 1}),
            json!("67e55044-10b1-426f-9247-bb680e5fe0c8"),
        ];
        assert_eq!(to_sql_params(&types, &values).unwrap().len(), 5);
    }

    #[test]
    fn test_numeric_strings_bind_to_integers() {
        assert!(to_sql_param(&Type::INT8, &json!("42")).is_ok());
        assert!(to_sql_param(&Type::INT2, &json!(70000)).is_err());
        assert!(to_sql_param(&Type::INT4, &json!("forty-two")).is_err());
    }

    #[test]
    fn test_non_strings_bind_to_text() {
        assert!(to_sql_param(&Type::TEXT, &json!(42)).is_ok());
        assert!(to_sql_param(&Type::VARCHAR, &json!({"nested": true})).is_ok());
    }

    #[test]
    fn test_nulls_are_typed() {
        for ty in [Type::INT4, Type::TEXT, Type::UUID, Type::TIMESTAMPTZ, Type::JSONB] {
            assert!(to_sql_param(&ty, &Value::Null).is_ok(), "{}", ty);
        }
    }

    #[test]
    fn test_dates() {
        assert!(to_sql_param(&Type::TIMESTAMPTZ, &json!("2024-05-01T12:00:00Z")).is_ok());
        assert!(to_sql_param(&Type::TIMESTAMP, &json!("2024-05-01T12:00:00")).is_ok());
        assert!(to_sql_param(&Type::DATE, &json!("2024-05-01")).is_ok());
        assert!(to_sql_param(&Type::DATE, &json!("May 1st")).is_err());
    }

    #[test]
    fn test_arrays() {
        assert!(to_sql_param(&Type::TEXT_ARRAY, &json!(["a", "b"])).is_ok());
        assert!(to_sql_param(&Type::INT8_ARRAY, &json!([1, 2, 3])).is_ok());
        assert!(to_sql_param(&Type::INT4_ARRAY, &json!("1,2")).is_err());
    }

    #[test]
    fn test_count_mismatch() {
        let err = to_sql_params(&[Type::INT4], &[]).unwrap_err();
        assert!(err.to_string().contains("expects 1 parameters, 0 given"));
    }

    #[test]
    fn test_unsupported_type_suggests_cast() {
        let err = to_sql_params(&[Type::NUMERIC], &[json!(1.5)]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("parameter $1"));
        assert!(message.contains("$1::text"));
    }
}
