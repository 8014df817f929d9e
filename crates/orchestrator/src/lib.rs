//! Front door, workflow registry and streaming pipeline on top of
//! `graph-core`'s engine, `graph-checkpoint`'s durable generation store,
//! `llm`'s provider registry and `tool-pool`'s tool process pool.

pub mod config;
pub mod error;
pub mod front_door;
pub mod pipeline;
pub mod registry;
pub mod store;

pub use config::{Config, SYSTEM_DEFAULT_GRAPH_ID, SYSTEM_SIMPLE_GRAPH_ID};
pub use error::{OrchestratorError, Result};
pub use front_door::{Orchestrator, RespondOutcome, RespondRequest};
pub use registry::WorkflowRegistry;
pub use store::{GraphStore, InMemoryGraphStore, InMemoryUserStore, UserSettings, UserStore};
