// Cache Keys
// Deterministic content hashes of a stage's configuration and its inputs

use crate::schema::Schema;
use crate::stage::{ArgumentValue, ExecutableRef};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Hex-encoded SHA-256 identifying one stage configuration and its inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        CacheKey(value)
    }
}

/// Hash the canonical form of a stage's executable, resolved arguments,
/// declared contract and upstream keys
///
/// Upstream keys are sorted, so the key does not depend on the order in
/// which edges were declared.
pub fn compute_cache_key(
    executable: &ExecutableRef,
    arguments: &BTreeMap<String, ArgumentValue>,
    consumes: &Schema,
    produces: &Schema,
    upstream_keys: &[&CacheKey],
) -> CacheKey {
    let mut upstream: Vec<&str> = upstream_keys.iter().map(|k| k.as_str()).collect();
    upstream.sort_unstable();

    let arguments: Map<String, Value> = arguments
        .iter()
        .map(|(name, value)| (name.clone(), value.canonical()))
        .collect();

    let document = json!({
        "executable": executable.fingerprint(),
        "arguments": Value::Object(arguments),
        "contract": {
            "consumes": schema_value(consumes),
            "produces": schema_value(produces),
        },
        "upstream_keys": upstream,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonicalize(document).to_string().as_bytes());
    CacheKey(format!("{:x}", hasher.finalize()))
}

fn schema_value(schema: &Schema) -> Value {
    serde_json::to_value(schema).unwrap_or(Value::Null)
}

/// Rebuild every object with its keys in sorted order
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
