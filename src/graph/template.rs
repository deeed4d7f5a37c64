//! Workflow templates and the plugin table.
//!
//! A template is a small static graph: an ordered list of steps whose inputs
//! refer either to earlier steps (by local name) or to the outside world (by
//! alias name, overridable through the `deps_map` of
//! [`instantiate_with_deps`](crate::graph::DagStore::instantiate_with_deps)).
//! The registry maps workflow names to actor bodies and templates; the
//! Environment supplies it at startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::actors::Actor;

/// One step of a workflow template. Steps are listed in dependency order;
/// the last step is the template's sink.
#[derive(Clone)]
pub struct TemplateNode {
    /// Local name other steps use to reference this one.
    pub name: String,
    /// Name hint for the concrete node (`hint.<id>`).
    pub hint: String,
    /// Workflow name of the actor body to run.
    pub workflow: String,
    /// `(param, source)` pairs; `source` is a local step name, a `deps_map`
    /// key, or an alias name.
    pub inputs: Vec<(String, String)>,
    /// Aliases the step's output is appended to once grafted.
    pub publish: Vec<String>,
}

/// A named sub-DAG template.
#[derive(Clone)]
pub struct WorkflowTemplate {
    pub name: String,
    pub nodes: Vec<TemplateNode>,
}

/// An actor body plus its scheduling metadata.
#[derive(Clone)]
pub struct ActorSpec {
    pub body: Arc<dyn Actor>,
    /// Streaming consumers run as soon as every input has progressed;
    /// non-streaming ones wait for finished inputs.
    pub streaming: bool,
}

/// Plugin table: workflow name to actor body and template.
#[derive(Default)]
pub struct WorkflowRegistry {
    actors: HashMap<String, ActorSpec>,
    templates: HashMap<String, WorkflowTemplate>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_actor(&mut self, workflow: &str, body: Arc<dyn Actor>, streaming: bool) {
        self.actors
            .insert(workflow.to_string(), ActorSpec { body, streaming });
    }

    pub fn register_template(&mut self, template: WorkflowTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn actor(&self, workflow: &str) -> Option<&ActorSpec> {
        self.actors.get(workflow)
    }

    pub fn template(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }
}

/// Helper for building template steps without the struct noise.
pub fn step(
    name: &str,
    workflow: &str,
    inputs: &[(&str, &str)],
    publish: &[&str],
) -> TemplateNode {
    TemplateNode {
        name: name.to_string(),
        hint: name.to_string(),
        workflow: workflow.to_string(),
        inputs: inputs
            .iter()
            .map(|(param, source)| (param.to_string(), source.to_string()))
            .collect(),
        publish: publish.iter().map(|s| s.to_string()).collect(),
    }
}
