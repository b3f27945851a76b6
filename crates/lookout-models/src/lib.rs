//! lookout-models — ONNX Runtime implementations of the inference ports.
//!
//! [`OnnxObjectDetector`] runs YOLOv8 for generic objects; [`OnnxFaceEmbedder`]
//! pairs an SCRFD face detector with an ArcFace embedding model. Both hold
//! their sessions behind a mutex and run inference on the blocking pool.

pub mod error;
pub mod face;
pub mod labels;
pub mod object;
pub mod preprocess;

pub use error::ModelError;
pub use face::OnnxFaceEmbedder;
pub use object::OnnxObjectDetector;

/// File names expected inside the model directory.
pub const OBJECT_MODEL_FILE: &str = "yolov8n.onnx";
pub const FACE_DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const FACE_EMBEDDER_MODEL_FILE: &str = "w600k_r50.onnx";
