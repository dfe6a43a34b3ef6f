//! Run data model and the store collaborator
//!
//! - `types`: [`AgentRun`], [`RunStatus`], [`AgentKind`], discovery results
//! - `store`: [`RunStore`] trait and the in-memory implementation
//! - `file_store`: JSON-file implementation, one file per run

pub mod file_store;
pub mod store;
pub mod types;

pub use file_store::FileRunStore;
pub use store::{MemoryRunStore, RunStore, StatusUpdate};
pub use types::{
    AgentKind, AgentRun, Command, ModelDescriptor, ModelInventory, RunSpec, RunStatus,
};
