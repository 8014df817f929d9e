//! Durable, reconnectable generation state: the projection of a
//! streaming generation that survives the owning task disconnecting, so
//! a client reconnecting mid-stream can replay what it missed.

pub mod error;
pub mod state;
pub mod store;

pub use error::{CheckpointError, Result};
pub use state::{GenerationEvent, GenerationState, GenerationStatus, ToolEventPhase};
pub use store::{run_ttl_sweeper, GenerationStore, InMemoryGenerationStore, ReplaySubscription};
