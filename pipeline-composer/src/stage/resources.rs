// Stage Resources
// Accelerator, memory and node placement requests

use crate::error::ResourceError;

use serde::{Deserialize, Serialize};

/// Compute resources a stage asks for
///
/// Carried through to the execution manifest unchanged; nothing here is
/// enforced locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRequest {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub accelerator_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_kind: Option<String>,
    /// Human-readable size such as `512M` or `4G`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pool: Option<String>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accelerators(mut self, count: u32, kind: impl Into<String>) -> Self {
        self.accelerator_count = count;
        self.accelerator_kind = Some(kind.into());
        self
    }

    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    pub fn with_node_pool(mut self, pool: impl Into<String>) -> Self {
        self.node_pool = Some(pool.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Memory limit in bytes, if one is set and parses
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit
            .as_deref()
            .and_then(|limit| parse_byte_size(limit).ok())
    }

    pub fn validate(&self, stage: &str) -> Vec<ResourceError> {
        let mut errors = Vec::new();

        match self.accelerator_kind.as_deref() {
            Some(kind) if kind.trim().is_empty() => {
                errors.push(ResourceError::EmptyAcceleratorKind {
                    stage: stage.to_string(),
                })
            }
            None if self.accelerator_count > 0 => {
                errors.push(ResourceError::MissingAcceleratorKind {
                    stage: stage.to_string(),
                    count: self.accelerator_count,
                })
            }
            _ => {}
        }

        if let Some(limit) = &self.memory_limit {
            if let Err(reason) = parse_byte_size(limit) {
                errors.push(ResourceError::InvalidMemoryLimit {
                    stage: stage.to_string(),
                    value: limit.clone(),
                    reason,
                });
            }
        }

        errors
    }
}

/// Parse a byte size like `1024`, `512K`, `512M`, `4G`, `1T` or `2Gi`
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty size".to_string());
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err("size must start with a number".to_string());
    }

    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid number '{}': {}", digits, e))?;

    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1 << 10,
        "M" | "MB" | "MI" | "MIB" => 1 << 20,
        "G" | "GB" | "GI" | "GIB" => 1 << 30,
        "T" | "TB" | "TI" | "TIB" => 1 << 40,
        other => return Err(format!("unknown size suffix '{}'", other)),
    };

    if value == 0 {
        return Err("size must be greater than zero".to_string());
    }

    value
        .checked_mul(multiplier)
        .ok_or_else(|| "size overflows 64 bits".to_string())
}
