use crate::errors::ToolError;
use serde_json::Value;

pub mod assets;
pub mod discovery;
pub mod query;

/// One MCP tool. Managers dispatch on the `action` argument and return the
/// text payload the agent sees.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, args: Value) -> Result<Value, ToolError>;
}
