//! Run lifecycle management
//!
//! - `runs`: [`RunManager`], reconciliation loop, watchers, cancel, recovery
//! - `events`: hook/plan/output events and the relay that fans them out
//! - `locks`: per-run serialization
//! - `cache`: discovery result cache

pub mod cache;
pub mod events;
pub mod locks;
pub mod runs;

pub use cache::DiscoveryCache;
pub use events::{EventKind, EventRelay, HookReport, PlanSubmission, RunEvent};
pub use locks::{RunGuard, RunLocks};
pub use runs::{ManagerSettings, RecoveryReport, RunManager, SESSION_LOST, WORKER_SHUTDOWN};
