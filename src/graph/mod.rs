pub mod dump;
pub mod store;
pub mod template;

pub use store::{
    DagStore, Dependency, Node, NodeId, NodeState, ReadyNode, ResolvedDep, SourceRef,
    VALUE_WORKFLOW,
};
pub use template::{step, ActorSpec, TemplateNode, WorkflowRegistry, WorkflowTemplate};
