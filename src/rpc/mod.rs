//! HTTP surfaces
//!
//! - `public`: control-plane-facing router, guarded by the public secret
//! - `ctl`: loopback callback router, guarded by the per-process CTL secret
//! - `auth`: bearer middleware shared by both, typed per secret domain
//! - `error`: wire error bodies
//! - `descriptor`: reflection document

pub mod auth;
pub mod ctl;
pub mod descriptor;
pub mod error;
pub mod public;

pub use ctl::{ctl_router, HookRequest, PlanRequest, HOOKS_PATH, PLANS_PATH};
pub use descriptor::{build_descriptor, WorkerDescriptor};
pub use error::{ApiError, ApiResult};
pub use public::{public_router, PublicState};
