// Stage Arguments
// Argument schema, argument values and their resolution against a stage

use crate::error::ArgumentError;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Declared type of a stage argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    Bool,
    Int,
    Float,
    Str,
    List,
    Dict,
}

impl fmt::Display for ArgumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgumentType::Bool => "bool",
            ArgumentType::Int => "int",
            ArgumentType::Float => "float",
            ArgumentType::Str => "str",
            ArgumentType::List => "list",
            ArgumentType::Dict => "dict",
        };
        write!(f, "{}", name)
    }
}

/// A supplied or default argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ArgumentValue>),
    Dict(BTreeMap<String, ArgumentValue>),
}

impl ArgumentValue {
    /// Short name of the value's kind, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            ArgumentValue::Null => "null",
            ArgumentValue::Bool(_) => "bool",
            ArgumentValue::Int(_) => "int",
            ArgumentValue::Float(_) => "float",
            ArgumentValue::String(_) => "str",
            ArgumentValue::List(_) => "list",
            ArgumentValue::Dict(_) => "dict",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgumentValue::Null)
    }

    /// Coerce to the declared type; only `int -> float` widening is allowed
    pub fn coerce(&self, ty: ArgumentType) -> Option<ArgumentValue> {
        match (ty, self) {
            (ArgumentType::Bool, ArgumentValue::Bool(_))
            | (ArgumentType::Int, ArgumentValue::Int(_))
            | (ArgumentType::Float, ArgumentValue::Float(_))
            | (ArgumentType::Str, ArgumentValue::String(_))
            | (ArgumentType::List, ArgumentValue::List(_))
            | (ArgumentType::Dict, ArgumentValue::Dict(_)) => Some(self.clone()),
            (ArgumentType::Float, ArgumentValue::Int(i)) => Some(ArgumentValue::Float(*i as f64)),
            _ => None,
        }
    }

    /// False if any float inside is NaN or infinite
    pub fn is_finite(&self) -> bool {
        match self {
            ArgumentValue::Float(f) => f.is_finite(),
            ArgumentValue::List(items) => items.iter().all(ArgumentValue::is_finite),
            ArgumentValue::Dict(map) => map.values().all(ArgumentValue::is_finite),
            _ => true,
        }
    }

    /// Normalized JSON form used for hashing: sorted keys, no negative zero
    pub fn canonical(&self) -> serde_json::Value {
        match self {
            ArgumentValue::Null => serde_json::Value::Null,
            ArgumentValue::Bool(b) => serde_json::Value::Bool(*b),
            ArgumentValue::Int(i) => serde_json::Value::from(*i),
            ArgumentValue::Float(f) => {
                let normalized = if *f == 0.0 { 0.0 } else { *f };
                serde_json::Number::from_f64(normalized)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
            ArgumentValue::String(s) => serde_json::Value::String(s.clone()),
            ArgumentValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ArgumentValue::canonical).collect())
            }
            ArgumentValue::Dict(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.canonical()))
                    .collect(),
            ),
        }
    }

    /// Command-line rendering: strings verbatim, everything else as JSON
    pub fn to_arg_string(&self) -> String {
        match self {
            ArgumentValue::String(s) => s.clone(),
            other => other.canonical().to_string(),
        }
    }
}

impl From<bool> for ArgumentValue {
    fn from(value: bool) -> Self {
        ArgumentValue::Bool(value)
    }
}

impl From<i64> for ArgumentValue {
    fn from(value: i64) -> Self {
        ArgumentValue::Int(value)
    }
}

impl From<i32> for ArgumentValue {
    fn from(value: i32) -> Self {
        ArgumentValue::Int(i64::from(value))
    }
}

impl From<f64> for ArgumentValue {
    fn from(value: f64) -> Self {
        ArgumentValue::Float(value)
    }
}

impl From<&str> for ArgumentValue {
    fn from(value: &str) -> Self {
        ArgumentValue::String(value.to_string())
    }
}

impl From<String> for ArgumentValue {
    fn from(value: String) -> Self {
        ArgumentValue::String(value)
    }
}

impl<T: Into<ArgumentValue>> From<Vec<T>> for ArgumentValue {
    fn from(values: Vec<T>) -> Self {
        ArgumentValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ArgumentValue>> From<BTreeMap<String, T>> for ArgumentValue {
    fn from(values: BTreeMap<String, T>) -> Self {
        ArgumentValue::Dict(values.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

/// Declared argument: type, optional default, and whether it must be set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ArgumentSpecRepr")]
pub struct ArgumentSpec {
    #[serde(rename = "type")]
    pub arg_type: ArgumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ArgumentValue>,
    pub required: bool,
}

impl ArgumentSpec {
    /// Must be supplied by the pipeline author
    pub fn required(arg_type: ArgumentType) -> Self {
        Self {
            arg_type,
            default: None,
            required: true,
        }
    }

    /// May be omitted; absent from the resolved arguments when omitted
    pub fn optional(arg_type: ArgumentType) -> Self {
        Self {
            arg_type,
            default: None,
            required: false,
        }
    }

    pub fn with_default(arg_type: ArgumentType, default: impl Into<ArgumentValue>) -> Self {
        Self {
            arg_type,
            default: Some(default.into()),
            required: false,
        }
    }
}

// `required` defaults to "no default declared" when omitted in YAML
#[derive(Deserialize)]
struct ArgumentSpecRepr {
    #[serde(rename = "type")]
    arg_type: ArgumentType,
    #[serde(default)]
    default: Option<ArgumentValue>,
    #[serde(default)]
    required: Option<bool>,
}

impl From<ArgumentSpecRepr> for ArgumentSpec {
    fn from(repr: ArgumentSpecRepr) -> Self {
        // An explicit `default: null` deserializes as `None` and marks the
        // argument optional without a default.
        let required = repr.required.unwrap_or(repr.default.is_none());
        Self {
            arg_type: repr.arg_type,
            default: repr.default.filter(|v| !v.is_null()),
            required,
        }
    }
}

/// Apply defaults and type-check supplied values
///
/// Every problem is collected. An explicit `null` for an optional argument
/// without a default is the same as omitting it; with a default it unsets
/// the default and stays in the result.
pub fn resolve_arguments(
    stage: &str,
    specs: &IndexMap<String, ArgumentSpec>,
    supplied: &BTreeMap<String, ArgumentValue>,
) -> Result<BTreeMap<String, ArgumentValue>, Vec<ArgumentError>> {
    let mut errors = Vec::new();
    let mut resolved = BTreeMap::new();

    for name in supplied.keys() {
        if !specs.contains_key(name) {
            errors.push(ArgumentError::Unknown {
                stage: stage.to_string(),
                argument: name.clone(),
                known: specs.keys().cloned().collect(),
            });
        }
    }

    for (name, spec) in specs {
        if let Some(default) = &spec.default {
            if default.coerce(spec.arg_type).is_none() {
                errors.push(ArgumentError::InvalidDefault {
                    stage: stage.to_string(),
                    argument: name.clone(),
                    expected: spec.arg_type,
                    actual: default.kind().to_string(),
                });
                continue;
            }
        }

        match supplied.get(name) {
            Some(ArgumentValue::Null) => {
                if spec.required {
                    errors.push(ArgumentError::NullNotAllowed {
                        stage: stage.to_string(),
                        argument: name.clone(),
                    });
                } else if spec.default.is_some() {
                    resolved.insert(name.clone(), ArgumentValue::Null);
                }
            }
            Some(value) => match value.coerce(spec.arg_type) {
                Some(coerced) if coerced.is_finite() => {
                    resolved.insert(name.clone(), coerced);
                }
                Some(_) => errors.push(ArgumentError::NonFinite {
                    stage: stage.to_string(),
                    argument: name.clone(),
                }),
                None => errors.push(ArgumentError::TypeMismatch {
                    stage: stage.to_string(),
                    argument: name.clone(),
                    expected: spec.arg_type,
                    actual: value.kind().to_string(),
                }),
            },
            None => match &spec.default {
                Some(default) => {
                    if let Some(coerced) = default.coerce(spec.arg_type) {
                        resolved.insert(name.clone(), coerced);
                    }
                }
                None if spec.required => errors.push(ArgumentError::Missing {
                    stage: stage.to_string(),
                    argument: name.clone(),
                }),
                None => {}
            },
        }
    }

    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(errors)
    }
}
