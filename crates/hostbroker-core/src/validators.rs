//! Declarative settings validators
//!
//! Providers declare what their settings section must look like. Defaults are
//! applied first, then every rule is checked and all violations are reported
//! together.

use std::fmt;

use serde_json::{Map, Value};

use crate::timeout::parse_timeout;

/// Expected type of a settings value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Any string
    String,
    /// Integer
    Integer,
    /// true/false
    Bool,
    /// Table
    Table,
    /// Array
    List,
    /// Integer, or a timeout string such as `30s` or `2h`
    Duration,
}

impl ValueKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Table => value.is_object(),
            ValueKind::List => value.is_array(),
            ValueKind::Duration => {
                value.is_u64() || value.as_str().is_some_and(|s| parse_timeout(s).is_ok())
            }
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Bool => "bool",
            ValueKind::Table => "table",
            ValueKind::List => "list",
            ValueKind::Duration => "duration",
        };
        f.write_str(name)
    }
}

/// One settings rule
#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    /// Key must be present and non-empty
    Required(String),
    /// Fill in a value when the key is absent
    Default(String, Value),
    /// If present, the value must have this type
    IsType(String, ValueKind),
    /// At least one of the rules must hold
    AnyOf(Vec<Validator>),
    /// Every rule must hold
    AllOf(Vec<Validator>),
}

impl Validator {
    /// Key must be present
    pub fn required(key: impl Into<String>) -> Self {
        Validator::Required(key.into())
    }

    /// Default for an absent key
    pub fn default_value(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Validator::Default(key.into(), value.into())
    }

    /// Type check for a key
    pub fn is_type(key: impl Into<String>, kind: ValueKind) -> Self {
        Validator::IsType(key.into(), kind)
    }

    /// Any of the rules
    #[must_use]
    pub fn any_of(rules: Vec<Validator>) -> Self {
        Validator::AnyOf(rules)
    }

    /// All of the rules
    #[must_use]
    pub fn all_of(rules: Vec<Validator>) -> Self {
        Validator::AllOf(rules)
    }

    fn apply_default(&self, values: &mut Map<String, Value>) {
        match self {
            Validator::Default(key, value) => {
                if values.get(key).is_none_or(Value::is_null) {
                    values.insert(key.clone(), value.clone());
                }
            }
            Validator::AllOf(rules) => rules.iter().for_each(|r| r.apply_default(values)),
            Validator::AnyOf(_) | Validator::Required(_) | Validator::IsType(..) => {}
        }
    }

    fn check(&self, values: &Map<String, Value>) -> Result<(), String> {
        match self {
            Validator::Required(key) => match values.get(key) {
                None | Some(Value::Null) => Err(format!("{key} is required")),
                Some(Value::String(s)) if s.is_empty() => Err(format!("{key} is required")),
                Some(_) => Ok(()),
            },
            Validator::Default(..) => Ok(()),
            Validator::IsType(key, kind) => match values.get(key) {
                None | Some(Value::Null) => Ok(()),
                Some(v) if kind.matches(v) => Ok(()),
                Some(v) => Err(format!("{key} must be of type {kind}, got {v}")),
            },
            Validator::AllOf(rules) => {
                let failures: Vec<String> =
                    rules.iter().filter_map(|r| r.check(values).err()).collect();
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(failures.join(" and "))
                }
            }
            Validator::AnyOf(rules) => {
                if rules.iter().any(|r| r.check(values).is_ok()) {
                    Ok(())
                } else {
                    Err(format!("one of the following must hold: {self}"))
                }
            }
        }
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |rules: &[Validator], sep: &str| {
            rules
                .iter()
                .map(|r| match r {
                    Validator::AnyOf(_) | Validator::AllOf(_) => format!("({r})"),
                    _ => r.to_string(),
                })
                .collect::<Vec<_>>()
                .join(sep)
        };
        match self {
            Validator::Required(key) => write!(f, "{key}"),
            Validator::Default(key, value) => write!(f, "{key} = {value}"),
            Validator::IsType(key, kind) => write!(f, "{key}: {kind}"),
            Validator::AnyOf(rules) => f.write_str(&join(rules, " | ")),
            Validator::AllOf(rules) => f.write_str(&join(rules, " & ")),
        }
    }
}

/// Apply defaults and check every rule against `values`
///
/// Returns the completed map, or every violation found.
///
/// # Errors
/// Returns the list of violation messages when any rule fails
pub fn validate(
    rules: &[Validator],
    values: Map<String, Value>,
) -> Result<Map<String, Value>, Vec<String>> {
    let mut values = values;
    for rule in rules {
        rule.apply_default(&mut values);
    }

    let violations: Vec<String> = rules.iter().filter_map(|r| r.check(&values).err()).collect();
    if violations.is_empty() {
        Ok(values)
    } else {
        Err(violations)
    }
}
