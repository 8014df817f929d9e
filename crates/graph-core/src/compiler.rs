//! Compiles a [`GraphConfig`] into a [`CompiledGraph`]: a resolved set of
//! nodes and a routing table ready for the runner to step through.

use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::expr::resolve_edge;
use crate::model::{validate_structure, GraphConfig, NodeConfig, NodeDecl, StepType, END, START};
use crate::state::RuntimeState;
use crate::universal_node::{resolve_steps, ResolvedNode};

/// A node registry entry for `Reference` node configs: a named, reusable
/// step sequence looked up by id.
pub type UniversalNodeRegistry = HashMap<String, Vec<crate::model::Step>>;

/// Either a direct edge to a fixed node, or a conditional edge that picks
/// its destination at runtime from `state`.
#[derive(Debug)]
pub enum CompiledEdge {
    Direct(String),
    Conditional {
        condition: String,
        targets: HashMap<String, String>,
        fallback: Option<String>,
    },
}

impl CompiledEdge {
    pub fn resolve(&self, state: &RuntimeState) -> String {
        match self {
            CompiledEdge::Direct(to) => to.clone(),
            CompiledEdge::Conditional { condition, targets, fallback } => {
                let key = resolve_edge(condition, state, targets);
                if key == crate::model::FALLBACK_KEY {
                    fallback.clone().unwrap_or_else(|| END.to_string())
                } else {
                    targets.get(&key).cloned().unwrap_or_else(|| key.clone())
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct CompiledGraph {
    pub graph_id: String,
    pub global_config: crate::model::GlobalConfig,
    pub nodes: HashMap<String, ResolvedNode>,
    /// `from` node id to its outgoing edges; a node may have multiple
    /// direct edges only in the degenerate single-edge case, so this is a
    /// `Vec` to preserve declaration order for conditional-then-direct
    /// fallthrough configs.
    pub edges: HashMap<String, Vec<CompiledEdge>>,
}

impl CompiledGraph {
    pub fn entry_node(&self) -> Option<String> {
        self.edges
            .get(START)
            .and_then(|edges| edges.first())
            .map(|e| match e {
                CompiledEdge::Direct(to) => to.clone(),
                CompiledEdge::Conditional { .. } => {
                    unreachable!("start edge must be direct")
                }
            })
    }
}

/// Validate `config`, resolve every node's steps (including `Reference`
/// nodes via `registry`), and build the routing table.
pub fn compile(config: &GraphConfig, registry: &UniversalNodeRegistry) -> Result<CompiledGraph> {
    let errors = validate_structure(config);
    if !errors.is_empty() {
        return Err(GraphError::validation(config.graph_id.clone(), errors));
    }

    let mut nodes = HashMap::new();
    for decl in &config.nodes {
        nodes.insert(decl.id.clone(), resolve_node(decl, registry)?);
    }

    let mut edges: HashMap<String, Vec<CompiledEdge>> = HashMap::new();
    for edge in &config.edges {
        let compiled = if let Some(condition) = &edge.condition {
            CompiledEdge::Conditional {
                condition: condition.clone(),
                targets: edge.targets.clone().unwrap_or_default(),
                fallback: edge.fallback.clone(),
            }
        } else {
            let to = edge.to.clone().ok_or_else(|| {
                GraphError::compilation_failed(
                    config.graph_id.clone(),
                    format!("edge from '{}' has no destination", edge.from),
                )
            })?;
            CompiledEdge::Direct(to)
        };
        edges.entry(edge.from.clone()).or_default().push(compiled);
    }

    Ok(CompiledGraph {
        graph_id: config.graph_id.clone(),
        global_config: config.global_config.clone(),
        nodes,
        edges,
    })
}

fn resolve_node(decl: &NodeDecl, registry: &UniversalNodeRegistry) -> Result<ResolvedNode> {
    match &decl.config {
        Some(NodeConfig::Reference { node_id }) => {
            let steps = registry.get(node_id).cloned().ok_or_else(|| {
                GraphError::compilation_failed(
                    decl.id.clone(),
                    format!("node '{}' references unknown universal node '{}'", decl.id, node_id),
                )
            })?;
            Ok(ResolvedNode { id: decl.id.clone(), steps })
        }
        Some(config) => Ok(ResolvedNode { id: decl.id.clone(), steps: resolve_steps(config) }),
        None => Ok(ResolvedNode { id: decl.id.clone(), steps: Vec::new() }),
    }
}

/// Terminal routing markers a runner checks for before looking up a node.
pub fn is_terminal(node_id: &str) -> bool {
    node_id == END
}
