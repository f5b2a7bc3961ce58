//! Parses `records.config`: lines of the form `CONFIG <name> <TYPE> <value>`.

use std::collections::HashMap;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl SettingValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

pub type Settings = HashMap<String, SettingValue>;

/// Parses the contents of a `records.config` file.
///
/// Unrecognized `TYPE` tokens default to a string value, matching the
/// original loader. `INT` accepts decimal, `0x`-prefixed hex, and
/// trailing-`h` hex notation.
pub fn parse(contents: &str) -> Result<Settings> {
    let mut settings = Settings::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with("CONFIG") {
            continue;
        }

        let mut fields = line.split_whitespace().skip(1);
        let name = fields.next().ok_or_else(|| {
            CacheError::ConfigInvalid(format!("malformed CONFIG line: {line}"))
        })?;
        let ty = fields.next().ok_or_else(|| {
            CacheError::ConfigInvalid(format!("malformed CONFIG line: {line}"))
        })?;
        let value = fields.next().ok_or_else(|| {
            CacheError::ConfigInvalid(format!("malformed CONFIG line: {line}"))
        })?;

        if settings.contains_key(name) {
            tracing::debug!(name, "double-definition in records.config");
        }

        let parsed = match ty {
            "INT" => SettingValue::Int(parse_int(value)?),
            "FLOAT" => SettingValue::Float(value.parse().map_err(|_| {
                CacheError::ConfigInvalid(format!("bad FLOAT value for {name}: {value}"))
            })?),
            _ => SettingValue::Str(value.to_string()),
        };

        settings.insert(name.to_string(), parsed);
    }

    Ok(settings)
}

fn parse_int(value: &str) -> Result<i64> {
    let err = || CacheError::ConfigInvalid(format!("bad INT value: {value}"));
    if let Some(hex) = value.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).map_err(|_| err())
    } else if let Some(hex) = value.strip_suffix('h') {
        i64::from_str_radix(hex, 16).map_err(|_| err())
    } else {
        value.parse().map_err(|_| err())
    }
}
