//! lookoutd — live object detection and face identification daemon.
//!
//! Wires the capture manager, the two detection pipelines, the identity
//! gallery and the inference ports into a [`Session`], and exposes it over
//! D-Bus.

pub mod config;
pub mod dbus_interface;
pub mod orchestrator;
pub mod session;

pub use config::Config;
pub use orchestrator::{Orchestrator, Pipeline, PipelineSettings, PipelineState};
pub use session::{DetectionSnapshot, DetectionSummary, Session, SessionError, SessionStatus};
