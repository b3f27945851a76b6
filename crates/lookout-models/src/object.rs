//! YOLOv8 object detector via ONNX Runtime.
//!
//! The model takes a 640×640 letterboxed RGB tensor scaled to [0, 1] and
//! returns `[1, 4 + classes, anchors]`: per anchor a center-format box
//! followed by one score per class.

use crate::error::{load_session, ModelError};
use crate::labels;
use crate::preprocess::{self, Candidate, Letterbox};
use async_trait::async_trait;
use lookout_core::{BoundingBox, Detection, Frame, ObjectDetector, PortError};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_PAD_VALUE: u8 = 114;
const YOLO_CONFIDENCE_THRESHOLD: f32 = 0.35;
const YOLO_NMS_THRESHOLD: f32 = 0.45;
const YOLO_BOX_ROWS: usize = 4;

struct RawDetection {
    bbox: BoundingBox,
    score: f32,
    class: usize,
}

impl Candidate for RawDetection {
    fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }
    fn score(&self) -> f32 {
        self.score
    }
    fn class(&self) -> usize {
        self.class
    }
}

struct YoloModel {
    session: Mutex<Session>,
    confidence_threshold: f32,
}

impl YoloModel {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, ModelError> {
        let rgb = frame.to_rgb_image();
        let (input, letterbox) = preprocess::letterbox(&rgb, YOLO_INPUT_SIZE, [YOLO_PAD_VALUE; 3]);
        let tensor = preprocess::to_nchw(&input, 0.0, 255.0);

        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::InferenceFailed("object session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("yolo output: {e}")))?;

        if shape.len() != 3 {
            return Err(ModelError::InferenceFailed(format!(
                "expected 3-d yolo output, got shape {shape:?}"
            )));
        }
        let rows = shape[1] as usize;
        let anchors = shape[2] as usize;

        let raw = decode(data, rows, anchors, &letterbox, self.confidence_threshold)?;
        let detections = preprocess::nms(raw, YOLO_NMS_THRESHOLD)
            .into_iter()
            .map(|d| Detection {
                label: labels::label(d.class),
                confidence: d.score,
                bbox: d.bbox.clamp_to(frame.width, frame.height),
            })
            .filter(|d| d.bbox.area() > 0.0)
            .collect();
        Ok(detections)
    }
}

/// Decode a `[rows, anchors]` row-major YOLOv8 head into frame-space boxes.
fn decode(
    data: &[f32],
    rows: usize,
    anchors: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Result<Vec<RawDetection>, ModelError> {
    if rows <= YOLO_BOX_ROWS || data.len() < rows * anchors {
        return Err(ModelError::InferenceFailed(format!(
            "yolo output too small: {} values for {rows}x{anchors}",
            data.len()
        )));
    }
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];

    let mut raw = Vec::new();
    for anchor in 0..anchors {
        let (class, score) = (YOLO_BOX_ROWS..rows)
            .map(|row| (row - YOLO_BOX_ROWS, at(row, anchor)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score < threshold {
            continue;
        }

        let (cx, cy) = (at(0, anchor), at(1, anchor));
        let (w, h) = (at(2, anchor), at(3, anchor));
        let bbox = letterbox.box_to_frame(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
        raw.push(RawDetection {
            bbox,
            score: score.clamp(0.0, 1.0),
            class,
        });
    }
    Ok(raw)
}

/// [`ObjectDetector`] backed by a YOLOv8 ONNX model.
#[derive(Clone)]
pub struct OnnxObjectDetector {
    model: Arc<YoloModel>,
}

impl OnnxObjectDetector {
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let session = load_session(model_path.as_ref(), "yolov8")?;
        Ok(Self {
            model: Arc::new(YoloModel {
                session: Mutex::new(session),
                confidence_threshold: YOLO_CONFIDENCE_THRESHOLD,
            }),
        })
    }
}

#[async_trait]
impl ObjectDetector for OnnxObjectDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, PortError> {
        let model = Arc::clone(&self.model);
        let frame = frame.clone();
        tokio::task::spawn_blocking(move || model.detect(&frame))
            .await
            .map_err(|e| PortError::InferenceFailed(format!("object inference task: {e}")))?
            .map_err(PortError::from)
    }
}
