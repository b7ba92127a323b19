//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulation runtime module exports and shared types."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Simulated temperature devices for exercising the R-TMS monitor.

pub mod generator;
pub mod packager;
pub mod publisher;

pub use generator::{CorruptValue, Sample, SignalGenerator};
pub use packager::MessagePackager;
pub use publisher::{
    publisher_client_id, CycleDecision, CycleOutcome, DevicePublisher, SkipReason, TransmitModel,
};
