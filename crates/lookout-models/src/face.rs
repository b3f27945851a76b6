//! Face detection (SCRFD) and embedding (ArcFace) via ONNX Runtime.
//!
//! SCRFD is anchor-based over three strides with two anchors per cell; each
//! stride yields a score, a distance-encoded box and five landmarks. Every
//! detected face is cropped to a square around its box, resized to 112×112
//! and fed to ArcFace, whose output is L2-normalized.

use crate::error::{load_session, ModelError};
use crate::preprocess::{self, Candidate, Letterbox};
use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::RgbImage;
use lookout_core::{BoundingBox, Embedding, FaceEmbedder, FaceObservation, Frame, PortError};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_LANDMARKS: usize = 5;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Margin added around the detected box before cropping for ArcFace.
const CROP_MARGIN: f32 = 0.1;

/// Output tensor indices (score, bbox, landmarks) for one stride.
type StrideOutputs = (usize, usize, usize);

#[derive(Debug, Clone)]
struct RawFace {
    bbox: BoundingBox,
    score: f32,
    landmarks: Vec<(f32, f32)>,
}

impl Candidate for RawFace {
    fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }
    fn score(&self) -> f32 {
        self.score
    }
}

struct ScrfdModel {
    session: Mutex<Session>,
    outputs: [StrideOutputs; 3],
}

impl ScrfdModel {
    fn load(path: &Path) -> Result<Self, ModelError> {
        let session = load_session(path, "scrfd")?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(ModelError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let outputs = stride_outputs(&names);
        tracing::debug!(?outputs, "scrfd output mapping");
        Ok(Self {
            session: Mutex::new(session),
            outputs,
        })
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<RawFace>, ModelError> {
        let (input, letterbox) = preprocess::letterbox(image, SCRFD_INPUT_SIZE, [128; 3]);
        let tensor = preprocess::to_nchw(&input, SCRFD_MEAN, SCRFD_STD);

        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::InferenceFailed("face detector lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?;

        let mut faces = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(&self.outputs) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| ModelError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let boxes = extract(bbox_idx, "boxes")?;
            let kps = extract(kps_idx, "landmarks")?;
            faces.extend(decode_stride(
                StrideOutput { scores, boxes, kps },
                stride,
                SCRFD_INPUT_SIZE as usize,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(preprocess::nms(faces, SCRFD_NMS_THRESHOLD))
    }
}

/// Map output names to stride slots.
///
/// Exports either name their tensors `score_8`, `bbox_16`, `kps_32`, ... or
/// use opaque numeric names, in which case the standard positional layout
/// applies: scores 0..3, boxes 3..6, landmarks 6..9.
fn stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        _ => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

struct StrideOutput<'a> {
    scores: &'a [f32],
    boxes: &'a [f32],
    kps: &'a [f32],
}

fn decode_stride(
    out: StrideOutput<'_>,
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<RawFace> {
    let grid = input_size / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut faces = Vec::new();
    for idx in 0..anchors.min(out.scores.len()) {
        let score = out.scores[idx];
        if score < threshold {
            continue;
        }
        let Some(b) = out.boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * step;
        let ay = (cell / grid) as f32 * step;

        let bbox = letterbox.box_to_frame(
            ax - b[0] * step,
            ay - b[1] * step,
            ax + b[2] * step,
            ay + b[3] * step,
        );
        let landmarks = out
            .kps
            .get(idx * SCRFD_LANDMARKS * 2..(idx + 1) * SCRFD_LANDMARKS * 2)
            .map(|k| {
                k.chunks_exact(2)
                    .map(|p| letterbox.to_frame(ax + p[0] * step, ay + p[1] * step))
                    .collect()
            })
            .unwrap_or_default();

        faces.push(RawFace {
            bbox,
            score,
            landmarks,
        });
    }
    faces
}

struct ArcFaceModel {
    session: Mutex<Session>,
}

impl ArcFaceModel {
    fn load(path: &Path) -> Result<Self, ModelError> {
        Ok(Self {
            session: Mutex::new(load_session(path, "arcface")?),
        })
    }

    fn embed(&self, crop: &RgbImage) -> Result<Embedding, ModelError> {
        let tensor = preprocess::to_nchw(crop, ARCFACE_MEAN, ARCFACE_STD);
        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::InferenceFailed("face embedder lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ModelError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Embedding::new(raw.to_vec()).l2_normalized())
    }
}

/// Square crop around `bbox` (plus margin), resized to the ArcFace input.
fn face_crop(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (width, height) = image.dimensions();
    let side = bbox.width.max(bbox.height) * (1.0 + CROP_MARGIN * 2.0);
    let cx = bbox.x + bbox.width / 2.0;
    let cy = bbox.y + bbox.height / 2.0;
    let region = BoundingBox::new(cx - side / 2.0, cy - side / 2.0, side, side).clamp_to(width, height);

    let (x, y) = (region.x.floor() as u32, region.y.floor() as u32);
    let w = (region.width.round() as u32).min(width.saturating_sub(x));
    let h = (region.height.round() as u32).min(height.saturating_sub(y));
    if w == 0 || h == 0 {
        return None;
    }

    let cropped = imageops::crop_imm(image, x, y, w, h).to_image();
    Some(imageops::resize(
        &cropped,
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

struct FaceModels {
    detector: ScrfdModel,
    embedder: ArcFaceModel,
}

impl FaceModels {
    fn detect_faces(&self, frame: &Frame) -> Result<Vec<FaceObservation>, ModelError> {
        let image = frame.to_rgb_image();
        let faces = self.detector.detect(&image)?;

        let mut observations = Vec::with_capacity(faces.len());
        for face in faces {
            let bbox = face.bbox.clamp_to(frame.width, frame.height);
            let Some(crop) = face_crop(&image, &bbox) else {
                tracing::debug!(?bbox, "skipping face with empty crop");
                continue;
            };
            observations.push(FaceObservation {
                bbox,
                confidence: face.score,
                landmarks: (!face.landmarks.is_empty()).then_some(face.landmarks),
                embedding: self.embedder.embed(&crop)?,
            });
        }
        Ok(observations)
    }
}

/// [`FaceEmbedder`] backed by SCRFD detection and ArcFace embedding.
#[derive(Clone)]
pub struct OnnxFaceEmbedder {
    models: Arc<FaceModels>,
}

impl OnnxFaceEmbedder {
    pub fn load(
        detector_path: impl AsRef<Path>,
        embedder_path: impl AsRef<Path>,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            models: Arc::new(FaceModels {
                detector: ScrfdModel::load(detector_path.as_ref())?,
                embedder: ArcFaceModel::load(embedder_path.as_ref())?,
            }),
        })
    }
}

#[async_trait]
impl FaceEmbedder for OnnxFaceEmbedder {
    async fn detect_faces(&self, frame: &Frame) -> Result<Vec<FaceObservation>, PortError> {
        let models = Arc::clone(&self.models);
        let frame = frame.clone();
        tokio::task::spawn_blocking(move || models.detect_faces(&frame))
            .await
            .map_err(|e| PortError::InferenceFailed(format!("face inference task: {e}")))?
            .map_err(PortError::from)
    }
}
