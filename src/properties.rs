//! Stage property tables.
//!
//! Every stage owns a set of named, typed configuration values and
//! publishes them as an enumerated [`PropertySpec`] table. Values arrive
//! as `serde_json::Value`s from TOML files or `--set stage.prop=value`
//! command-line flags; the helpers here convert them with clear
//! configuration errors. Applications render the tables into help text.

use serde_json::Value;

use crate::error::{Error, Result};

/// One row of a stage's property table.
#[derive(Debug, Clone, Copy)]
pub struct PropertySpec {
    pub name: &'static str,
    pub type_name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

pub fn as_string(_name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Ok(other.to_string()),
    }
}

pub fn as_f64(name: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| Error::config(format!("property '{name}' expects a number, got {value}")))
}

pub fn as_i64(name: &str, value: &Value) -> Result<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| Error::config(format!("property '{name}' expects an integer, got {value}")))
}

pub fn as_u64(name: &str, value: &Value) -> Result<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| {
            Error::config(format!(
                "property '{name}' expects an unsigned integer, got {value}"
            ))
        })
}

pub fn as_bool(name: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| Error::config(format!("property '{name}' expects a boolean, got {value}")))
}

/// Accepts a JSON array of strings or a comma-separated string.
pub fn as_string_list(name: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items.iter().map(|v| as_string(name, v)).collect(),
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        other => Err(Error::config(format!(
            "property '{name}' expects a string list, got {other}"
        ))),
    }
}

/// Accepts a JSON array of numbers or a comma-separated string.
pub fn as_f64_list(name: &str, value: &Value) -> Result<Vec<f64>> {
    match value {
        Value::Array(items) => items.iter().map(|v| as_f64(name, v)).collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f64>().map_err(|_| {
                    Error::config(format!("property '{name}': '{s}' is not a number"))
                })
            })
            .collect(),
        other => Err(Error::config(format!(
            "property '{name}' expects a number list, got {other}"
        ))),
    }
}

/// Six comma-separated values, used for `bounds` style properties.
pub fn as_bounds(name: &str, value: &Value) -> Result<[f64; 6]> {
    let values = as_f64_list(name, value)?;
    values.try_into().map_err(|v: Vec<f64>| {
        Error::config(format!(
            "property '{name}' expects 6 values, got {}",
            v.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_conversions() {
        assert_eq!(as_f64("p", &json!(2.5)).unwrap(), 2.5);
        assert_eq!(as_f64("p", &json!("2.5")).unwrap(), 2.5);
        assert_eq!(as_i64("p", &json!(-3)).unwrap(), -3);
        assert_eq!(as_u64("p", &json!("7")).unwrap(), 7);
        assert!(as_bool("p", &json!("true")).unwrap());
        assert!(as_f64("p", &json!("abc")).is_err());
        assert!(as_u64("p", &json!(-1)).is_err());
    }

    #[test]
    fn list_conversions() {
        assert_eq!(
            as_string_list("arrays", &json!(["u", "v"])).unwrap(),
            vec!["u", "v"]
        );
        assert_eq!(
            as_string_list("arrays", &json!("u, v ,w")).unwrap(),
            vec!["u", "v", "w"]
        );
        assert_eq!(
            as_f64_list("levels", &json!("1, 2.5")).unwrap(),
            vec![1.0, 2.5]
        );
    }

    #[test]
    fn bounds_require_six_values() {
        assert_eq!(
            as_bounds("bounds", &json!("0,360,-90,90,0,0")).unwrap(),
            [0.0, 360.0, -90.0, 90.0, 0.0, 0.0]
        );
        assert!(as_bounds("bounds", &json!("0,1")).is_err());
    }
}
