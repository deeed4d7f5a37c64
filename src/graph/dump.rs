// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Dependency-tree rendering for dry runs and debugging.

use std::collections::HashSet;

use crate::graph::store::{DagStore, NodeId, NodeState, SourceRef};

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const MAGENTA: &str = "\x1b[35m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Render the dependency tree under a reference (usually `.end`).
pub fn dependency_tree(dag: &DagStore, root: &SourceRef) -> String {
    let mut out = String::new();
    match dag.resolve(root) {
        Ok(ids) => {
            for id in ids {
                let mut visited = HashSet::new();
                render(dag, id, "", &mut visited, &mut out);
            }
        }
        Err(e) => out.push_str(&format!("(unresolvable root: {})\n", e)),
    }
    out
}

fn status_label(state: NodeState) -> String {
    match state {
        NodeState::Finished => format!("{}✓ built{}", GREEN, RESET),
        NodeState::Failed => format!("{}✗ failed{}", RED, RESET),
        NodeState::Running | NodeState::Progressed => format!("{}⚡ active{}", MAGENTA, RESET),
        NodeState::NotStarted | NodeState::Runnable => format!("{}⋯ not built{}", YELLOW, RESET),
    }
}

fn render(dag: &DagStore, id: NodeId, indent: &str, visited: &mut HashSet<NodeId>, out: &mut String) {
    let node = match dag.node(id) {
        Some(node) => node,
        None => {
            out.push_str(&format!("{}├── [node {} not found]\n", indent, id));
            return;
        }
    };

    let mut line = format!("{}├── {} [{}]", indent, node.name, status_label(node.state));
    if let Some(explain) = &node.explain {
        line.push_str(&format!(" ({})", explain));
    }
    line.push('\n');
    out.push_str(&line);

    if visited.contains(&id) {
        out.push_str(&format!("{}│   └── (cycle detected)\n", indent));
        return;
    }
    visited.insert(id);

    let next_indent = format!("{}│   ", indent);

    // Default dependencies first, then named ones grouped by parameter.
    let mut params: Vec<String> = Vec::new();
    for dep in &node.deps {
        if !params.contains(&dep.param) {
            params.push(dep.param.clone());
        }
    }
    params.sort_by_key(|p| !p.is_empty());

    for param in params {
        let group_indent = if param.is_empty() {
            next_indent.clone()
        } else {
            out.push_str(&format!("{}├── (param: {})\n", next_indent, param));
            format!("{}│   ", next_indent)
        };
        for dep in node.deps.iter().filter(|d| d.param == param) {
            match dag.resolve(&dep.source) {
                Ok(ids) => {
                    for dep_id in ids {
                        let mut branch_visited = visited.clone();
                        render(dag, dep_id, &group_indent, &mut branch_visited, out);
                    }
                }
                Err(e) => {
                    out.push_str(&format!("{}├── (unresolvable: {})\n", group_indent, e));
                }
            }
        }
    }

    visited.remove(&id);
}
