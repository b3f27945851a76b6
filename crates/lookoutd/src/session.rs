//! A running lookout session: camera, both pipelines, gallery and ports.
//!
//! The supervisor task watches the capture state and both ports' readiness
//! and auto-starts detection at most once per stream activation.

use crate::orchestrator::{Orchestrator, PipelineSettings, PipelineStatus};
use lookout_core::{
    Detection, Enrollment, FaceEmbedder, Frame, FrameError, Gallery, GalleryError,
    IdentitySummary, ObjectDetector, PortError, PortSlot, PortStatus, ResolvedFace,
    SharedMatcher,
};
use lookout_hw::{CaptureError, CaptureManager, DeviceInfo, StreamState};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("failed to read sample image: {0}")]
    Image(#[from] FrameError),
    #[error("no live frame available; is the camera streaming?")]
    NoFrame,
    #[error("background task failed: {0}")]
    Task(String),
}

/// Aggregate counts over the current results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectionSummary {
    pub objects: usize,
    pub faces: usize,
    pub known_faces: usize,
    /// Objects plus recognized faces.
    pub total: usize,
}

/// Current results of both pipelines.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionSnapshot {
    pub objects: Vec<Detection>,
    pub faces: Vec<ResolvedFace>,
    pub summary: DetectionSummary,
}

impl DetectionSnapshot {
    pub fn new(objects: Vec<Detection>, faces: Vec<ResolvedFace>) -> Self {
        let known_faces = faces.iter().filter(|f| f.is_known).count();
        let summary = DetectionSummary {
            objects: objects.len(),
            faces: faces.len(),
            known_faces,
            total: objects.len() + known_faces,
        };
        Self {
            objects,
            faces,
            summary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortsStatus {
    pub objects: PortStatus,
    pub faces: PortStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelinesStatus {
    pub objects: PipelineStatus,
    pub faces: PipelineStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryStatus {
    pub identities: usize,
    pub embeddings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub capture: StreamState,
    pub ports: PortsStatus,
    pub pipelines: PipelinesStatus,
    pub gallery: GalleryStatus,
    pub auto_start: bool,
}

/// Which stream activation auto-start has already acted on (or been told
/// to leave alone).
#[derive(Debug, Default)]
struct AutoStart {
    handled_activation: u64,
}

pub struct Session {
    capture: CaptureManager,
    orchestrator: Orchestrator,
    gallery: tokio::sync::Mutex<Gallery>,
    matcher: SharedMatcher,
    objects_port: PortSlot<dyn ObjectDetector>,
    faces_port: PortSlot<dyn FaceEmbedder>,
    auto_start_enabled: bool,
    auto_start: Mutex<AutoStart>,
}

impl Session {
    pub fn new(
        capture: CaptureManager,
        gallery: Gallery,
        objects_port: PortSlot<dyn ObjectDetector>,
        faces_port: PortSlot<dyn FaceEmbedder>,
        settings: PipelineSettings,
        auto_start: bool,
    ) -> Arc<Self> {
        let matcher = gallery.matcher();
        Arc::new(Self {
            capture,
            orchestrator: Orchestrator::new(settings),
            gallery: tokio::sync::Mutex::new(gallery),
            matcher,
            objects_port,
            faces_port,
            auto_start_enabled: auto_start,
            auto_start: Mutex::new(AutoStart::default()),
        })
    }

    pub fn capture(&self) -> &CaptureManager {
        &self.capture
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run the auto-start supervisor until the session is dropped.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let mut capture = self.capture.subscribe();
        let mut objects = self.objects_port.readiness();
        let mut faces = self.faces_port.readiness();
        let session: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match session.upgrade() {
                    Some(session) => session.try_auto_start(),
                    None => break,
                }
                tokio::select! {
                    changed = capture.changed() => if changed.is_err() { break },
                    alive = objects.changed() => if !alive { break },
                    alive = faces.changed() => if !alive { break },
                }
            }
            tracing::debug!("auto-start supervisor exited");
        })
    }

    /// Start both pipelines if the stream is up, both ports are ready, and
    /// this activation has not been handled yet.
    fn try_auto_start(&self) {
        if !self.auto_start_enabled {
            return;
        }
        let state = self.capture.state();
        if !state.streaming {
            return;
        }
        let (Some(detector), Some(embedder)) =
            (self.objects_port.current(), self.faces_port.current())
        else {
            return;
        };

        let mut auto = self
            .auto_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if auto.handled_activation >= state.activation {
            return;
        }
        auto.handled_activation = state.activation;

        tracing::info!(
            activation = state.activation,
            device = ?state.device,
            "auto-starting detection"
        );
        let frames = self.capture.frames();
        self.orchestrator.start_objects(detector, frames.clone());
        self.orchestrator
            .start_faces(embedder, self.matcher.clone(), frames);
    }

    /// Mark the current activation as handled so auto-start leaves it alone.
    fn claim_activation(&self) {
        let activation = self.capture.state().activation;
        let mut auto = self
            .auto_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        auto.handled_activation = auto.handled_activation.max(activation);
    }

    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        self.capture.list_devices().await
    }

    pub async fn start_capture(&self, device: Option<&str>) -> Result<StreamState, SessionError> {
        self.capture.start(device).await?;
        Ok(self.capture.state())
    }

    /// Stop both pipelines, then release the camera.
    pub async fn stop_capture(&self) {
        self.orchestrator.stop_all();
        self.capture.stop().await;
    }

    /// Move the stream to another camera. Running pipelines keep polling and
    /// pick up the new device's frames.
    pub async fn switch_device(&self, device: &str) -> Result<StreamState, SessionError> {
        self.capture.switch(device).await?;
        Ok(self.capture.state())
    }

    /// Start every pipeline whose port is ready.
    pub fn start_detection(&self) -> Result<(), SessionError> {
        let detector = self.objects_port.require();
        let embedder = self.faces_port.require();
        if let (Err(e), Err(_)) = (&detector, &embedder) {
            return Err(e.clone().into());
        }

        self.claim_activation();
        let frames = self.capture.frames();
        match detector {
            Ok(detector) => self.orchestrator.start_objects(detector, frames.clone()),
            Err(e) => tracing::warn!(error = %e, "object pipeline not started"),
        }
        match embedder {
            Ok(embedder) => self
                .orchestrator
                .start_faces(embedder, self.matcher.clone(), frames),
            Err(e) => tracing::warn!(error = %e, "face pipeline not started"),
        }
        Ok(())
    }

    /// Stop both pipelines. Auto-start will not restart them until the next
    /// stream activation.
    pub fn stop_detection(&self) {
        self.claim_activation();
        self.orchestrator.stop_all();
    }

    /// Enroll `name` from a still image on disk.
    pub async fn enroll(&self, name: &str, image_path: &Path) -> Result<Enrollment, SessionError> {
        let embedder = self.faces_port.require().map_err(GalleryError::from)?;
        let path: PathBuf = image_path.to_path_buf();
        let sample = tokio::task::spawn_blocking(move || Frame::open(path))
            .await
            .map_err(|e| SessionError::Task(e.to_string()))??;
        self.enroll_frame(name, &sample, embedder).await
    }

    /// Enroll `name` from the current live frame.
    pub async fn enroll_from_camera(&self, name: &str) -> Result<Enrollment, SessionError> {
        let embedder = self.faces_port.require().map_err(GalleryError::from)?;
        let sample = self.capture.frames().latest().ok_or(SessionError::NoFrame)?;
        self.enroll_frame(name, &sample, embedder).await
    }

    async fn enroll_frame(
        &self,
        name: &str,
        sample: &Frame,
        embedder: Arc<dyn FaceEmbedder>,
    ) -> Result<Enrollment, SessionError> {
        let mut gallery = self.gallery.lock().await;
        Ok(gallery.enroll(name, sample, embedder.as_ref()).await?)
    }

    /// Delete `name` and all its embeddings. Returns `false` if unknown.
    pub async fn remove(&self, name: &str) -> Result<bool, SessionError> {
        Ok(self.gallery.lock().await.remove(name)?)
    }

    pub async fn list_identities(&self) -> Vec<IdentitySummary> {
        self.gallery.lock().await.summaries()
    }

    pub fn snapshot(&self) -> DetectionSnapshot {
        DetectionSnapshot::new(
            self.orchestrator.objects().results(),
            self.orchestrator.faces().results(),
        )
    }

    pub async fn status(&self) -> SessionStatus {
        let gallery = {
            let gallery = self.gallery.lock().await;
            GalleryStatus {
                identities: gallery.len(),
                embeddings: gallery.identities().iter().map(|i| i.embeddings.len()).sum(),
            }
        };
        SessionStatus {
            capture: self.capture.state(),
            ports: PortsStatus {
                objects: self.objects_port.status(),
                faces: self.faces_port.status(),
            },
            pipelines: PipelinesStatus {
                objects: self.orchestrator.objects().status(),
                faces: self.orchestrator.faces().status(),
            },
            gallery,
            auto_start: self.auto_start_enabled,
        }
    }

    /// Stop everything; used on daemon shutdown.
    pub async fn shutdown(&self) {
        self.stop_capture().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::{BoundingBox, Embedding, FaceObservation, MatchResult};

    fn face(known: bool) -> ResolvedFace {
        let observation = FaceObservation {
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            confidence: 0.9,
            landmarks: None,
            embedding: Embedding::new(vec![0.0; 4]),
        };
        let result = if known {
            MatchResult {
                name: "alice".into(),
                distance: 0.3,
                confidence: 0.7,
                is_known: true,
            }
        } else {
            MatchResult::unknown(1.0)
        };
        ResolvedFace::new(observation, result)
    }

    #[test]
    fn test_summary_counts_known_faces_only() {
        let objects = vec![
            Detection {
                label: "cup".into(),
                confidence: 0.8,
                bbox: BoundingBox::new(1.0, 1.0, 2.0, 2.0),
            };
            3
        ];
        let snapshot = DetectionSnapshot::new(objects, vec![face(true), face(false)]);
        assert_eq!(
            snapshot.summary,
            DetectionSummary {
                objects: 3,
                faces: 2,
                known_faces: 1,
                total: 4,
            }
        );
    }

    #[test]
    fn test_empty_snapshot() {
        assert_eq!(
            DetectionSnapshot::new(Vec::new(), Vec::new()).summary,
            DetectionSummary::default()
        );
    }
}
