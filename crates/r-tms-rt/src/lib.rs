//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the monitor service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Loop pacing and task supervision for the R-TMS runtime.

pub mod scheduling;

pub use scheduling::{RateLimiter, TaskGroup, TaskReport};
pub use tokio_util::sync::CancellationToken;
