//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Monitor service lifecycle and the schedule/maintenance dispatcher for R-TMS.

pub mod dispatcher;
pub mod service;

pub use dispatcher::{ControlChannel, ScheduleDispatcher, TickReport};
pub use service::{HealthReport, MonitorHandle, MonitorService, ServiceContext};
