//! Persisted configuration types: [`GraphConfig`], node/edge definitions,
//! per-node step configuration, and [`NeuronConfig`].
//!
//! These types are the wire/storage format: they are what a
//! `graphs` or `neurons` document looks like in the persistent store, before
//! [`crate::compiler::compile`] turns a `GraphConfig` into an executable
//! [`crate::compiler::CompiledGraph`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved node id marking graph entry.
pub const START: &str = "__start__";
/// Reserved node id marking graph exit.
pub const END: &str = "__end__";
/// Reserved routing key returned by the expression evaluator when no
/// `targets` entry matches.
pub const FALLBACK_KEY: &str = "__fallback__";

/// One of the twelve node archetypes a graph may declare.
///
/// Every archetype is executed the same way at runtime by the universal
/// node — the type tag exists for authoring/validation clarity and for
/// default step configuration, not for dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Precheck,
    Fastpath,
    Context,
    Classifier,
    Router,
    Planner,
    Executor,
    Responder,
    Search,
    Scrape,
    Command,
    Universal,
}

/// A node declaration inside a [`GraphConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDecl {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<NodeConfig>,
}

/// An edge declaration inside a [`GraphConfig`].
///
/// A simple edge sets `to`; a conditional edge sets `condition` + `targets`
/// (and optionally `fallback`). Both forms may appear on the same `from`
/// node only via separate [`EdgeDecl`] entries — the compiler treats the
/// presence of `condition` as the discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDecl {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl EdgeDecl {
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

/// Graph-wide execution limits and feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    #[serde(default = "default_max_search_iterations")]
    pub max_search_iterations: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_fastpath: bool,
}

fn default_max_replans() -> u32 {
    3
}
fn default_max_search_iterations() -> u32 {
    5
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_true() -> bool {
    true
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_replans: default_max_replans(),
            max_search_iterations: default_max_search_iterations(),
            timeout_ms: default_timeout_ms(),
            enable_fastpath: true,
        }
    }
}

/// The persisted workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub graph_id: String,
    pub owner_id: String,
    pub tier: u8,
    #[serde(default)]
    pub is_default: bool,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeDecl>,
    pub edges: Vec<EdgeDecl>,
    #[serde(default)]
    pub global_config: GlobalConfig,
}

impl GraphConfig {
    /// Parse a graph authored as YAML rather than the native JSON document
    /// form, for operators who keep graph definitions in version control.
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> crate::error::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Per-node step configuration, injected into state at compile time.
///
/// Either a single implicit step (`Single`) or an explicit multi-step
/// sequence (`Multi`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeConfig {
    Single {
        #[serde(rename = "type")]
        step_type: StepType,
        config: serde_json::Value,
    },
    Multi { steps: Vec<Step> },
    /// A reference to a reusable `universal_nodes` document, resolved by
    /// the compiler/registry before execution.
    Reference { node_id: String },
}

/// The five step primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Neuron,
    Tool,
    Transform,
    Conditional,
    Loop,
}

/// A single step within a node's micro-pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// An LM endpoint declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuronConfig {
    pub neuron_id: String,
    pub owner_id: String,
    pub tier: u8,
    pub name: String,
    pub role: NeuronRole,
    pub provider: ProviderKind,
    pub endpoint: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeuronRole {
    Chat,
    Worker,
    Specialist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Local,
    OpenaiCompatible,
    AnthropicCompatible,
    GoogleCompatible,
    Custom,
}

/// Validate the structural invariants that don't require building the
/// executable graph (uniqueness of ids, reference resolution, tier
/// range, non-emptiness). Returns every violation found rather than
/// stopping at the first.
pub fn validate_structure(config: &GraphConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.nodes.is_empty() {
        errors.push("graph has no nodes".to_string());
    }
    if config.edges.is_empty() {
        errors.push("graph has no edges".to_string());
    }
    if !(0..=4).contains(&config.tier) {
        errors.push(format!("tier {} out of range [0,4]", config.tier));
    }

    let mut seen_ids = std::collections::HashSet::new();
    for node in &config.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
    }

    let known = |id: &str| id == START || id == END || seen_ids.contains(id);

    for edge in &config.edges {
        if !known(&edge.from) {
            errors.push(format!("edge references unknown 'from' node '{}'", edge.from));
        }
        if let Some(to) = &edge.to {
            if !known(to) {
                errors.push(format!("edge references unknown 'to' node '{}'", to));
            }
        }
        if let Some(targets) = &edge.targets {
            for (key, target) in targets {
                if !known(target) {
                    errors.push(format!(
                        "conditional edge target '{}' -> unknown node '{}'",
                        key, target
                    ));
                }
            }
        }
        if let Some(fallback) = &edge.fallback {
            if !known(fallback) {
                errors.push(format!("edge fallback references unknown node '{}'", fallback));
            }
        }
        if edge.to.is_none() && edge.targets.is_none() {
            errors.push(format!("edge from '{}' has neither 'to' nor 'targets'", edge.from));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;

    fn minimal_valid() -> GraphConfig {
        GraphConfig {
            graph_id: "g1".into(),
            owner_id: "system".into(),
            tier: 2,
            is_default: false,
            name: "g".into(),
            description: String::new(),
            nodes: vec![NodeDecl {
                id: "n1".into(),
                node_type: NodeType::Universal,
                config: None,
            }],
            edges: vec![EdgeDecl {
                from: START.into(),
                to: Some("n1".into()),
                condition: None,
                targets: None,
                fallback: None,
            }],
            global_config: GlobalConfig::default(),
        }
    }

    #[test]
    fn valid_graph_has_no_errors() {
        assert!(validate_structure(&minimal_valid()).is_empty());
    }

    #[test]
    fn empty_nodes_and_edges_fail() {
        let mut g = minimal_valid();
        g.nodes.clear();
        g.edges.clear();
        let errs = validate_structure(&g);
        assert!(errs.iter().any(|e| e.contains("no nodes")));
        assert!(errs.iter().any(|e| e.contains("no edges")));
    }

    #[test]
    fn duplicate_ids_fail() {
        let mut g = minimal_valid();
        g.nodes.push(NodeDecl {
            id: "n1".into(),
            node_type: NodeType::Universal,
            config: None,
        });
        assert!(validate_structure(&g).iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn out_of_range_tier_fails() {
        let mut g = minimal_valid();
        g.tier = 9;
        assert!(validate_structure(&g).iter().any(|e| e.contains("out of range")));
    }

    #[test]
    fn dangling_edge_target_fails() {
        let mut g = minimal_valid();
        g.edges.push(EdgeDecl {
            from: "n1".into(),
            to: Some("ghost".into()),
            condition: None,
            targets: None,
            fallback: None,
        });
        assert!(validate_structure(&g).iter().any(|e| e.contains("ghost")));
    }

    #[test]
    fn round_trips_through_yaml() {
        let g = minimal_valid();
        let yaml = g.to_yaml().unwrap();
        let parsed = GraphConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.graph_id, g.graph_id);
        assert_eq!(parsed.nodes.len(), g.nodes.len());
        assert!(validate_structure(&parsed).is_empty());
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let err = GraphConfig::from_yaml("not: [valid, graph").unwrap_err();
        assert!(matches!(err, GraphError::Yaml(_)));
    }
}
