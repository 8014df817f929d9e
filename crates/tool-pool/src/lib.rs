//! Supervised pool of tool subprocesses, each speaking JSON-RPC 2.0 over
//! newline-delimited stdio, implementing `graph-core`'s `ToolClient` seam.

pub mod child;
pub mod error;
pub mod pool;
pub mod protocol;

pub use child::{ServerSpec, ToolChild};
pub use error::{Result, ToolPoolError};
pub use pool::{ToolPool, ToolPoolConfig};
