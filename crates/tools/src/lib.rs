//! Tool surface for the conversation index: a fixed, versioned set of
//! operations with named parameters and structured results, wrapped by an
//! LRU+TTL result cache and a latency/error monitor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod cache;
pub mod monitor;
pub mod surface;

pub use cache::{CacheStats, ResultCache};
pub use monitor::{MonitorSnapshot, PerfMonitor, ToolMetrics};
pub use surface::ToolSurface;

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Static metadata about a tool, used by the host to decide which to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

impl ToolSpec {
    fn new(name: &str, description: &str, params: &[(&str, &str, bool)]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params: params
                .iter()
                .map(|(name, description, required)| ToolParam {
                    name: name.to_string(),
                    description: description.to_string(),
                    required: *required,
                })
                .collect(),
        }
    }
}

/// The structured record every tool call returns.  Tools never throw past
/// this boundary: failures are records carrying `error` plus a stable
/// machine-readable `kind` code.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub operation: String,
    pub ok: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub cache_hit: bool,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(operation: &str, data: Value, cache_hit: bool, duration_ms: u64) -> Self {
        Self {
            operation: operation.to_string(),
            ok: true,
            data,
            error: None,
            kind: None,
            cache_hit,
            duration_ms,
        }
    }

    pub fn failure(
        operation: &str,
        kind: &str,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            operation: operation.to_string(),
            ok: false,
            data: Value::Null,
            error: Some(message.into()),
            kind: Some(kind.to_string()),
            cache_hit: false,
            duration_ms,
        }
    }
}
