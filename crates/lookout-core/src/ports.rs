//! Inference ports and their readiness handles.
//!
//! The two models are black boxes behind object-safe async traits. Model
//! loading is slow, so each port lives in a [`PortSlot`] that reports
//! `Loading → Ready | Failed` through a watch channel.

use crate::frame::Frame;
use crate::types::{Detection, FaceObservation};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),
}

/// Generic object detector: frame → labeled boxes.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, PortError>;
}

/// Face detector + embedder: frame → face regions with embeddings.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn detect_faces(&self, frame: &Frame) -> Result<Vec<FaceObservation>, PortError>;
}

/// Load state of one inference port.
pub enum PortState<P: ?Sized> {
    Loading,
    Ready(Arc<P>),
    Failed(String),
}

impl<P: ?Sized> Clone for PortState<P> {
    fn clone(&self) -> Self {
        match self {
            PortState::Loading => PortState::Loading,
            PortState::Ready(port) => PortState::Ready(Arc::clone(port)),
            PortState::Failed(reason) => PortState::Failed(reason.clone()),
        }
    }
}

/// Serializable view of a [`PortState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum PortStatus {
    Loading,
    Ready,
    Failed(String),
}

/// Owner side of a port's readiness.
pub struct PortSlot<P: ?Sized> {
    tx: Arc<watch::Sender<PortState<P>>>,
}

impl<P: ?Sized> Clone for PortSlot<P> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<P: ?Sized + Send + Sync + 'static> PortSlot<P> {
    /// A slot whose model has not finished loading.
    pub fn loading() -> Self {
        let (tx, _rx) = watch::channel(PortState::Loading);
        Self { tx: Arc::new(tx) }
    }

    /// A slot that is ready immediately.
    pub fn ready(port: Arc<P>) -> Self {
        let slot = Self::loading();
        slot.set_ready(port);
        slot
    }

    pub fn set_ready(&self, port: Arc<P>) {
        self.tx.send_replace(PortState::Ready(port));
    }

    pub fn set_failed(&self, reason: impl Into<String>) {
        self.tx.send_replace(PortState::Failed(reason.into()));
    }

    /// The loaded port, if ready.
    pub fn current(&self) -> Option<Arc<P>> {
        match &*self.tx.borrow() {
            PortState::Ready(port) => Some(Arc::clone(port)),
            _ => None,
        }
    }

    /// The loaded port, or `ModelUnavailable` describing why not.
    pub fn require(&self) -> Result<Arc<P>, PortError> {
        match &*self.tx.borrow() {
            PortState::Ready(port) => Ok(Arc::clone(port)),
            PortState::Loading => Err(PortError::ModelUnavailable("model is still loading".into())),
            PortState::Failed(reason) => Err(PortError::ModelUnavailable(reason.clone())),
        }
    }

    pub fn status(&self) -> PortStatus {
        match &*self.tx.borrow() {
            PortState::Loading => PortStatus::Loading,
            PortState::Ready(_) => PortStatus::Ready,
            PortState::Failed(reason) => PortStatus::Failed(reason.clone()),
        }
    }

    pub fn readiness(&self) -> Readiness<P> {
        Readiness {
            rx: self.tx.subscribe(),
        }
    }

    /// Load the model on the blocking pool and publish the outcome.
    pub fn spawn_loader<F, E>(&self, name: &'static str, load: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce() -> Result<Arc<P>, E> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let slot = self.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(load).await {
                Ok(Ok(port)) => {
                    tracing::info!(port = name, "model ready");
                    slot.set_ready(port);
                }
                Ok(Err(e)) => {
                    tracing::error!(port = name, error = %e, "model failed to load");
                    slot.set_failed(e.to_string());
                }
                Err(e) => {
                    tracing::error!(port = name, error = %e, "model loader panicked");
                    slot.set_failed(format!("loader panicked: {e}"));
                }
            }
        })
    }
}

/// Subscriber side of a port's readiness.
pub struct Readiness<P: ?Sized> {
    rx: watch::Receiver<PortState<P>>,
}

impl<P: ?Sized> Readiness<P> {
    /// Wait for the next state change. Returns `false` once the slot is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
