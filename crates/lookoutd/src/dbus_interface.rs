use crate::session::{Session, SessionError};
use lookout_core::GalleryError;
use lookout_hw::CaptureError;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.lookout.Lookout1";
pub const OBJECT_PATH: &str = "/org/lookout/Lookout1";

/// D-Bus interface for the lookout daemon.
///
/// Bus name: org.lookout.Lookout1
/// Object path: /org/lookout/Lookout1
///
/// Structured replies are JSON strings.
pub struct LookoutService {
    session: Arc<Session>,
}

impl LookoutService {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(e: SessionError) -> zbus::fdo::Error {
    use zbus::fdo::Error;
    let message = e.to_string();
    match e {
        SessionError::Capture(CaptureError::PermissionDenied(_)) => Error::AccessDenied(message),
        SessionError::Capture(CaptureError::DeviceNotFound(_) | CaptureError::NoDevice) => {
            Error::FileNotFound(message)
        }
        SessionError::Gallery(
            GalleryError::InvalidName
            | GalleryError::NoFaceDetected
            | GalleryError::AmbiguousFace { .. },
        ) => Error::InvalidArgs(message),
        SessionError::Image(_) => Error::InvalidFileContent(message),
        _ => Error::Failed(message),
    }
}

/// Empty string means "no device given".
fn optional(device: &str) -> Option<&str> {
    Some(device.trim()).filter(|d| !d.is_empty())
}

#[interface(name = "org.lookout.Lookout1")]
impl LookoutService {
    /// List capture devices as a JSON array of `{id, label, driver, bus}`.
    async fn list_devices(&self) -> zbus::fdo::Result<String> {
        to_json(&self.session.list_devices().await)
    }

    /// Start the camera; an empty `device` selects the default. Returns the
    /// stream state as JSON.
    async fn start_capture(&self, device: &str) -> zbus::fdo::Result<String> {
        tracing::info!(device, "start_capture requested");
        let state = self
            .session
            .start_capture(optional(device))
            .await
            .map_err(to_fdo)?;
        to_json(&state)
    }

    async fn stop_capture(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop_capture requested");
        self.session.stop_capture().await;
        Ok(())
    }

    async fn switch_device(&self, device: &str) -> zbus::fdo::Result<String> {
        tracing::info!(device, "switch_device requested");
        let device = optional(device)
            .ok_or_else(|| zbus::fdo::Error::InvalidArgs("device id required".into()))?;
        let state = self.session.switch_device(device).await.map_err(to_fdo)?;
        to_json(&state)
    }

    async fn start_detection(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start_detection requested");
        self.session.start_detection().map_err(to_fdo)
    }

    async fn stop_detection(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop_detection requested");
        self.session.stop_detection();
        Ok(())
    }

    /// Enroll `name` from an image file. Returns `{name, embeddings, created}`.
    async fn enroll(&self, name: &str, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, image_path, "enroll requested");
        let enrollment = self
            .session
            .enroll(name, Path::new(image_path))
            .await
            .map_err(to_fdo)?;
        to_json(&serde_json::json!({
            "name": enrollment.name,
            "embeddings": enrollment.embeddings,
            "created": enrollment.created,
        }))
    }

    /// Enroll `name` from the current camera frame.
    async fn enroll_from_camera(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "enroll_from_camera requested");
        let enrollment = self
            .session
            .enroll_from_camera(name)
            .await
            .map_err(to_fdo)?;
        to_json(&serde_json::json!({
            "name": enrollment.name,
            "embeddings": enrollment.embeddings,
            "created": enrollment.created,
        }))
    }

    /// Remove an identity. Returns false if it was not enrolled.
    async fn remove(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove requested");
        self.session.remove(name).await.map_err(to_fdo)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&self.session.list_identities().await)
    }

    /// Current detections and face identities with summary counts.
    async fn snapshot(&self) -> zbus::fdo::Result<String> {
        to_json(&self.session.snapshot())
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.session.status().await;
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": status,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_device() {
        assert_eq!(optional(""), None);
        assert_eq!(optional("  "), None);
        assert_eq!(optional("/dev/video0"), Some("/dev/video0"));
    }

    #[test]
    fn test_error_mapping() {
        let e = to_fdo(SessionError::Gallery(GalleryError::AmbiguousFace { count: 2 }));
        assert!(matches!(e, zbus::fdo::Error::InvalidArgs(_)));

        let e = to_fdo(SessionError::Capture(CaptureError::PermissionDenied(
            "/dev/video0".into(),
        )));
        assert!(matches!(e, zbus::fdo::Error::AccessDenied(_)));

        let e = to_fdo(SessionError::NoFrame);
        assert!(matches!(e, zbus::fdo::Error::Failed(_)));
    }
}
