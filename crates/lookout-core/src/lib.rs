//! lookout-core — Frames, inference ports, and face identity matching.
//!
//! The object detector and face embedder are opaque async ports; this crate
//! owns everything around them: the enrolled identity gallery, its durable
//! stores, and the nearest-neighbour matcher built from it.

pub mod frame;
pub mod gallery;
pub mod matcher;
pub mod ports;
pub mod store;
pub mod types;

pub use frame::{Frame, FrameError, PixelFormat};
pub use gallery::{Enrollment, Gallery, GalleryError, IdentitySummary, SharedMatcher};
pub use matcher::{MatcherIndex, DEFAULT_MATCH_THRESHOLD, UNKNOWN_LABEL};
pub use ports::{FaceEmbedder, ObjectDetector, PortError, PortSlot, PortStatus, Readiness};
pub use store::{GalleryStore, JsonFileStore, MemoryStore, SqliteStore, StoreError};
pub use types::{BoundingBox, Detection, Embedding, FaceObservation, Identity, MatchResult, ResolvedFace};
