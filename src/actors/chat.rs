// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The chat pipeline: prompt → messages → query → response → markdown.
//!
//! All payloads are JSON. A message stream is a JSON array of
//! `{"role", "content", ...}` objects; a query is
//! `{"model", "messages", "tools"?}`; a response is the familiar
//! `{"choices":[{"message": …}]}` shape. `ResponseToMessages` is where
//! tool-calling loops unroll into new graph branches.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::actors::Actor;
use crate::errors::ActorFailure;
use crate::graph::SourceRef;
use crate::runtime::{fd, NodeRuntime};

/// Turns raw prompt items into a chat-message array.
pub struct PromptToMessages;

#[async_trait]
impl Actor for PromptToMessages {
    async fn run(&self, rt: Arc<NodeRuntime>) -> Result<(), ActorFailure> {
        let mut messages = Vec::new();
        for idx in 0..rt.input_count("") {
            let input = rt.open_read("", idx).await?;
            let text = rt.read_all(input).await?;
            rt.close(input).await?;
            messages.push(json!({
                "role": "user",
                "content": String::from_utf8_lossy(&text),
            }));
        }
        let body = serde_json::to_vec(&Value::Array(messages))?;
        rt.write_all(fd::STDOUT, &body).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "prompt_to_messages"
    }
}

/// Collects the conversation and the tool specs into one query document.
pub struct MessagesToQuery;

#[async_trait]
impl Actor for MessagesToQuery {
    async fn run(&self, rt: Arc<NodeRuntime>) -> Result<(), ActorFailure> {
        let mut messages = Vec::new();
        for idx in 0..rt.input_count("") {
            let input = rt.open_read("", idx).await?;
            let bytes = rt.read_all(input).await?;
            rt.close(input).await?;
            if bytes.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Value>(&bytes)? {
                Value::Array(items) => messages.extend(items),
                other => messages.push(other),
            }
        }

        let mut tools = Vec::new();
        for idx in 0..rt.input_count("toolspecs") {
            let input = rt.open_read("toolspecs", idx).await?;
            let bytes = rt.read_all(input).await?;
            rt.close(input).await?;
            if !bytes.is_empty() {
                tools.push(serde_json::from_slice::<Value>(&bytes)?);
            }
        }

        let env = rt.read_all(fd::ENV).await?;
        let opts: Value = serde_json::from_slice(&env).unwrap_or_else(|_| json!({}));
        let model = opts
            .get("llm.model")
            .and_then(Value::as_str)
            .unwrap_or("gpt");

        let mut query = json!({
            "model": model,
            "messages": messages,
        });
        if !tools.is_empty() {
            query["tools"] = Value::Array(tools);
        }
        rt.write_all(fd::STDOUT, &serde_json::to_vec(&query)?).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "messages_to_query"
    }
}

/// Transport stand-in. Emits the `mock_response` environment option when
/// set, otherwise echoes the last user message back as an assistant choice.
/// A vendor HTTP client replaces this registration in production setups.
pub struct QueryStub;

#[async_trait]
impl Actor for QueryStub {
    async fn run(&self, rt: Arc<NodeRuntime>) -> Result<(), ActorFailure> {
        let query_bytes = rt.read_all(fd::STDIN).await?;

        let env = rt.read_all(fd::ENV).await?;
        let opts: Value = serde_json::from_slice(&env).unwrap_or_else(|_| json!({}));
        if let Some(mock) = opts.get("mock_response").and_then(Value::as_str) {
            rt.write_all(fd::STDOUT, mock.as_bytes()).await?;
            return Ok(());
        }

        let query: Value = serde_json::from_slice(&query_bytes)?;
        let echo = query
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|msgs| {
                msgs.iter()
                    .rev()
                    .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            })
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("");

        let response = json!({
            "choices": [{"message": {"role": "assistant", "content": echo}}],
        });
        rt.write_all(fd::STDOUT, &serde_json::to_vec(&response)?).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "query"
    }
}

/// Extracts the assistant message from a response; when the message carries
/// tool calls, unrolls the loop into a new graph branch.
pub struct ResponseToMessages;

#[async_trait]
impl Actor for ResponseToMessages {
    async fn run(&self, rt: Arc<NodeRuntime>) -> Result<(), ActorFailure> {
        let bytes = rt.read_all(fd::STDIN).await?;
        let response: Value = serde_json::from_slice(&bytes)?;
        let message = response
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .cloned()
            .ok_or_else(|| ActorFailure::Malformed("response has no choices[0].message".into()))?;

        let own_output = serde_json::to_vec(&json!([message]))?;
        rt.write_all(fd::STDOUT, &own_output).await?;

        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if tool_calls.is_empty() {
            return Ok(());
        }

        debug!(node = rt.node_name(), calls = tool_calls.len(), "unrolling tool calls");
        let ops = rt.dag_ops();

        // Freeze the conversation as already-scheduled consumers saw it,
        // then grow it: the assistant turn, one branch per tool call, and a
        // fresh continuation whose sink becomes the new `.end`.
        ops.detach_from_alias(".chat_messages")?;

        let assistant = ops.value_node(&own_output, Some("assistant tool-call turn"))?;
        ops.alias(".chat_messages", assistant)?;

        for call in &tool_calls {
            let tool_name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .ok_or_else(|| ActorFailure::Malformed("tool call without function.name".into()))?;
            let arguments = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}");
            let call_id = call.get("id").and_then(Value::as_str).unwrap_or("call_0");

            let args_node = ops.value_node(arguments.as_bytes(), Some("tool input"))?;
            let ctx_node = ops.value_node(
                &serde_json::to_vec(&json!({"id": call_id, "name": tool_name}))?,
                Some("tool call context"),
            )?;

            let mut deps = HashMap::new();
            deps.insert(".tool_input".to_string(), SourceRef::Node(args_node));
            deps.insert(".tool_ctx".to_string(), SourceRef::Node(ctx_node));
            ops.instantiate_with_deps(&format!(".tools.{}", tool_name), deps)?;
        }

        let sink = ops.instantiate_with_deps("gpt.messages_to_query", HashMap::new())?;
        ops.realias(".end", sink)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "response_to_messages"
    }
}

/// Renders assistant message contents as markdown lines.
pub struct MessagesToMarkdown;

#[async_trait]
impl Actor for MessagesToMarkdown {
    async fn run(&self, rt: Arc<NodeRuntime>) -> Result<(), ActorFailure> {
        let bytes = rt.read_all(fd::STDIN).await?;
        if bytes.is_empty() {
            return Ok(());
        }
        let messages: Value = serde_json::from_slice(&bytes)?;
        let items = match messages {
            Value::Array(items) => items,
            other => vec![other],
        };
        for message in items {
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                if !content.is_empty() {
                    rt.write_all(fd::STDOUT, content.as_bytes()).await?;
                    rt.write_all(fd::STDOUT, b"\n").await?;
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "messages_to_markdown"
    }
}
