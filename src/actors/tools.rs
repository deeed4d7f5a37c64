//! Built-in local tools and the glue that turns their output into chat
//! messages.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::actors::Actor;
use crate::errors::ActorFailure;
use crate::runtime::{fd, NodeRuntime};

/// Spec of a built-in tool, in the function-calling schema models expect.
pub fn tool_spec(name: &str) -> Option<Value> {
    match name {
        "get_user_name" => Some(json!({
            "type": "function",
            "function": {
                "name": "get_user_name",
                "description": "Get the name of the current user",
                "parameters": {"type": "object", "properties": {}},
            },
        })),
        _ => None,
    }
}

/// Fixed local tool: answers with the current user's name.
pub struct GetUserName;

#[async_trait]
impl Actor for GetUserName {
    async fn run(&self, rt: Arc<NodeRuntime>) -> Result<(), ActorFailure> {
        // Arguments are read for effect only; the tool takes none.
        let _args = rt.read_all(fd::STDIN).await?;
        rt.write_all(fd::STDOUT, b"streamdag").await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "get_user_name"
    }
}

/// Wraps a tool's raw output into a `role: tool` chat message, using the
/// call context (id + name) captured at unroll time.
pub struct ToolCallToMessages;

#[async_trait]
impl Actor for ToolCallToMessages {
    async fn run(&self, rt: Arc<NodeRuntime>) -> Result<(), ActorFailure> {
        let output = rt.read_all(fd::STDIN).await?;

        let ctx_fd = rt.open_read("ctx", 0).await?;
        let ctx_bytes = rt.read_all(ctx_fd).await?;
        rt.close(ctx_fd).await?;
        let ctx: Value = serde_json::from_slice(&ctx_bytes)?;

        let message = json!([{
            "role": "tool",
            "tool_call_id": ctx.get("id").cloned().unwrap_or(Value::Null),
            "name": ctx.get("name").cloned().unwrap_or(Value::Null),
            "content": String::from_utf8_lossy(&output),
        }]);
        rt.write_all(fd::STDOUT, &serde_json::to_vec(&message)?).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "toolcall_to_messages"
    }
}
