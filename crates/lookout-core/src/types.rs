use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame pixel coordinates (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a box from corner coordinates.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Clip the box to a `width` × `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = (self.x + self.width).clamp(0.0, w);
        let y2 = (self.y + self.height).clamp(0.0, h);
        BoundingBox::from_corners(x1, y1, x2, y2)
    }
}

/// A labeled object localized in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Detector score in [0, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Fixed-length face embedding vector.
///
/// Serialized as a bare array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to another embedding.
    ///
    /// Embeddings of different dimensionality are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }
}

/// One face found by the face detector/embedder.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    /// Detector score in [0, 1].
    pub confidence: f32,
    /// Ordered facial landmarks, when the detector provides them.
    pub landmarks: Option<Vec<(f32, f32)>>,
    pub embedding: Embedding,
}

/// An enrolled person: a unique name and every embedding enrolled under it.
///
/// Persisted as `{"name": ..., "descriptors": [[...], ...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(rename = "descriptors")]
    pub embeddings: Vec<Embedding>,
}

/// Outcome of matching one embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched identity name, or [`UNKNOWN_LABEL`](crate::matcher::UNKNOWN_LABEL).
    pub name: String,
    pub distance: f32,
    /// `1 - distance`, clamped to [0, 1]. A monotonic quality proxy, not a probability.
    pub confidence: f32,
    pub is_known: bool,
}

/// A live face observation resolved against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedFace {
    pub bbox: BoundingBox,
    pub landmarks: Option<Vec<(f32, f32)>>,
    pub detection_confidence: f32,
    pub name: String,
    pub distance: f32,
    pub confidence: f32,
    pub is_known: bool,
}

impl ResolvedFace {
    pub fn new(observation: FaceObservation, result: MatchResult) -> Self {
        Self {
            bbox: observation.bbox,
            landmarks: observation.landmarks,
            detection_confidence: observation.confidence,
            name: result.name,
            distance: result.distance,
            confidence: result.confidence,
            is_known: result.is_known,
        }
    }
}
