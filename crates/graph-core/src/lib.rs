//! The workflow engine: graph configuration types, the safe template and
//! expression languages, the five step primitives, the universal node
//! that sequences them, and the compiler that assembles a [`GraphConfig`]
//! into an executable [`compiler::CompiledGraph`].
//!
//! Everything here is transport- and provider-agnostic: LM calls and tool
//! calls go through the [`llm::LmRegistry`]/[`tool::ToolClient`] trait
//! seams rather than a concrete implementation, so this crate never
//! depends on `llm` or `tool-pool`.

pub mod compiler;
pub mod error;
pub mod expr;
pub mod llm;
pub mod model;
pub mod render;
pub mod state;
pub mod steps;
pub mod tool;
pub mod universal_node;

pub use compiler::{compile, CompiledGraph};
pub use error::{GraphError, Result};
pub use model::{GraphConfig, NodeDecl, EdgeDecl, GlobalConfig};
pub use state::{deep_merge, reduce, Handles, RuntimeState, StateDelta};
