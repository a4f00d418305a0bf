//! Tool registry and builtin tools
//!
//! The file, shell, and web-search tools ship outside the core and are
//! registered at startup; the registry and the HTTP tool live here.

mod http;
mod registry;

pub use http::HttpTool;
pub use registry::ToolRegistry;

pub use ensemble_core::{Tool, ToolInfo, ToolResult};

use schemars::JsonSchema;

pub fn generate_schema<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({}))
}
