use anyhow::{Context, Result};
use lookout_core::{
    FaceEmbedder, Gallery, GalleryStore, JsonFileStore, ObjectDetector, PortSlot, SqliteStore,
};
use lookout_hw::{CameraBackend, CaptureManager, SyntheticBackend, V4lBackend};
use lookout_models::{OnnxFaceEmbedder, OnnxObjectDetector};
use lookoutd::config::{CameraBackendKind, Config, GalleryBackend};
use lookoutd::dbus_interface::{LookoutService, BUS_NAME, OBJECT_PATH};
use lookoutd::{PipelineSettings, Session};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("lookoutd starting");

    let config = Config::load();
    tracing::info!(
        poll_interval = ?config.poll_interval,
        match_threshold = config.match_threshold,
        camera = ?config.camera_device,
        model_dir = %config.model_dir.display(),
        gallery = %config.gallery_path.display(),
        "configuration loaded"
    );

    let gallery = Gallery::open(open_store(&config)?, config.match_threshold);
    tracing::info!(identities = gallery.len(), "gallery loaded");

    let backend: Arc<dyn CameraBackend> = match config.camera_backend {
        CameraBackendKind::V4l => Arc::new(V4lBackend),
        CameraBackendKind::Synthetic => Arc::new(SyntheticBackend::default()),
    };
    let capture = CaptureManager::new(backend, config.camera_device.clone());

    // Models load in the background; the supervisor starts detection once
    // both are ready.
    let objects_port: PortSlot<dyn ObjectDetector> = PortSlot::loading();
    let faces_port: PortSlot<dyn FaceEmbedder> = PortSlot::loading();
    let object_model = config.object_model_path();
    objects_port.spawn_loader("objects", move || {
        OnnxObjectDetector::load(object_model).map(|d| Arc::new(d) as Arc<dyn ObjectDetector>)
    });
    let (detector_model, embedder_model) = (
        config.face_detector_model_path(),
        config.face_embedder_model_path(),
    );
    faces_port.spawn_loader("faces", move || {
        OnnxFaceEmbedder::load(detector_model, embedder_model)
            .map(|e| Arc::new(e) as Arc<dyn FaceEmbedder>)
    });

    let session = Session::new(
        capture,
        gallery,
        objects_port,
        faces_port,
        PipelineSettings {
            interval: config.poll_interval,
            max_tick_failures: config.max_tick_failures,
        },
        config.auto_start,
    );
    let supervisor = session.spawn_supervisor();

    if config.start_camera {
        if let Err(e) = session.start_capture(None).await {
            tracing::warn!(error = %e, "camera not started; waiting for StartCapture");
        }
    }

    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, LookoutService::new(Arc::clone(&session)))?
        .build()
        .await
        .context("failed to register on the D-Bus session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "lookoutd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("lookoutd shutting down");

    session.shutdown().await;
    supervisor.abort();
    Ok(())
}

fn open_store(config: &Config) -> Result<Box<dyn GalleryStore>> {
    if let Some(parent) = config.gallery_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store: Box<dyn GalleryStore> = match config.gallery_backend {
        GalleryBackend::Json => Box::new(JsonFileStore::new(&config.gallery_path)),
        GalleryBackend::Sqlite => Box::new(
            SqliteStore::open(&config.gallery_path)
                .with_context(|| format!("failed to open {}", config.gallery_path.display()))?,
        ),
    };
    Ok(store)
}
