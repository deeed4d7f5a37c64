// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Built-in actor bodies.
//!
//! An actor is anything that implements [`Actor`]: it receives a
//! [`NodeRuntime`], reads its inputs, writes its output stream, may extend
//! the DAG, and returns. The bodies here are the vendor-neutral chat
//! pipeline; an HTTP transport would plug in by replacing the
//! `gpt.query` registration.

pub mod chat;
pub mod tools;

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::ActorFailure;
use crate::graph::{step, WorkflowRegistry, WorkflowTemplate};
use crate::runtime::NodeRuntime;

/// The actor capability: one computation consuming input streams and
/// producing one output byte stream.
#[async_trait]
pub trait Actor: Send + Sync {
    async fn run(&self, rt: Arc<NodeRuntime>) -> Result<(), ActorFailure>;

    fn name(&self) -> &'static str;
}

/// The plugin table every Environment starts from: the chat pipeline
/// workflows and the built-in tools.
pub fn standard_registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();

    registry.register_actor(
        "gpt.prompt_to_messages",
        Arc::new(chat::PromptToMessages),
        true,
    );
    registry.register_actor("gpt.messages_to_query", Arc::new(chat::MessagesToQuery), false);
    registry.register_actor("gpt.query", Arc::new(chat::QueryStub), false);
    registry.register_actor(
        "gpt.response_to_messages",
        Arc::new(chat::ResponseToMessages),
        true,
    );
    registry.register_actor(
        "gpt.messages_to_markdown",
        Arc::new(chat::MessagesToMarkdown),
        true,
    );
    registry.register_actor(
        "gpt.toolcall_to_messages",
        Arc::new(tools::ToolCallToMessages),
        false,
    );
    registry.register_actor("tool.get_user_name", Arc::new(tools::GetUserName), false);

    registry.register_template(WorkflowTemplate {
        name: "gpt.pipeline".to_string(),
        nodes: vec![
            step(
                "prompt_to_messages",
                "gpt.prompt_to_messages",
                &[("", ".prompt")],
                &[".chat_messages"],
            ),
            step(
                "messages_to_query",
                "gpt.messages_to_query",
                &[("", ".chat_messages"), ("toolspecs", ".toolspecs")],
                &[],
            ),
            step("query", "gpt.query", &[("", "messages_to_query")], &[]),
            step(
                "response_to_messages",
                "gpt.response_to_messages",
                &[("", "query")],
                &[],
            ),
            step(
                "messages_to_markdown",
                "gpt.messages_to_markdown",
                &[("", "response_to_messages")],
                &[],
            ),
        ],
    });

    // The continuation grafted on every tool-call round: same chain minus
    // the prompt conversion.
    registry.register_template(WorkflowTemplate {
        name: "gpt.messages_to_query".to_string(),
        nodes: vec![
            step(
                "messages_to_query",
                "gpt.messages_to_query",
                &[("", ".chat_messages"), ("toolspecs", ".toolspecs")],
                &[],
            ),
            step("query", "gpt.query", &[("", "messages_to_query")], &[]),
            step(
                "response_to_messages",
                "gpt.response_to_messages",
                &[("", "query")],
                &[],
            ),
            step(
                "messages_to_markdown",
                "gpt.messages_to_markdown",
                &[("", "response_to_messages")],
                &[],
            ),
        ],
    });

    registry.register_template(WorkflowTemplate {
        name: ".tools.get_user_name".to_string(),
        nodes: vec![
            step(
                "get_user_name",
                "tool.get_user_name",
                &[("", ".tool_input")],
                &[],
            ),
            step(
                "toolcall_to_messages",
                "gpt.toolcall_to_messages",
                &[("", "get_user_name"), ("ctx", ".tool_ctx")],
                &[".chat_messages"],
            ),
        ],
    });

    registry
}
