//! lookout-hw — Camera enumeration, capture and stream lifecycle.
//!
//! Provides V4L2-based camera access, a synthetic test-pattern backend, and
//! the capture manager that owns the single active stream.

pub mod camera;
pub mod capture;
pub mod frame;
pub mod synthetic;

pub use camera::{CameraBackend, CameraStream, CaptureError, DeviceInfo, V4lBackend};
pub use capture::{CaptureManager, FrameSource, StreamState};
pub use synthetic::SyntheticBackend;
