//! Capture Manager: owns the single active camera stream.
//!
//! At most one device handle is open at a time. Starting or switching always
//! releases the previous device (and waits for its capture thread to drop the
//! handle) before the next one is requested.
//!
//! Frames are published to one long-lived watch channel, so a [`FrameSource`]
//! handed out before a device switch keeps working afterwards. Between the
//! teardown of one device and the first frame of the next, the source reports
//! no frame.

use crate::camera::{CameraBackend, CameraStream, CaptureError, DeviceInfo};
use lookout_core::Frame;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{oneshot, watch};

/// Observable stream state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamState {
    pub streaming: bool,
    /// Active device id while streaming.
    pub device: Option<String>,
    /// Incremented on every not-streaming → streaming transition.
    pub activation: u64,
    /// Cause of the most recent failure, cleared by the next successful start.
    pub last_error: Option<String>,
}

/// Read handle on the most recent captured frame.
#[derive(Clone)]
pub struct FrameSource {
    rx: watch::Receiver<Option<Frame>>,
}

impl FrameSource {
    /// A source fed by hand rather than by a camera.
    pub fn channel() -> (watch::Sender<Option<Frame>>, FrameSource) {
        let (tx, rx) = watch::channel(None);
        (tx, FrameSource { rx })
    }

    /// The latest frame, or `None` if no stream is delivering frames.
    pub fn latest(&self) -> Option<Frame> {
        self.rx.borrow().clone()
    }

    /// Wait for a frame newer than the last one seen through this handle.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(frame) = self.rx.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }
}

/// State shared with capture threads.
struct Shared {
    state: watch::Sender<StreamState>,
    frames: watch::Sender<Option<Frame>>,
    /// Id of the capture thread allowed to publish; bumped on every release.
    session: AtomicU64,
}

impl Shared {
    fn is_current(&self, session: u64) -> bool {
        self.session.load(Ordering::Acquire) == session
    }

    fn publish_frame(&self, session: u64, frame: Frame) {
        self.frames.send_if_modified(|slot| {
            if self.is_current(session) {
                *slot = Some(frame);
                true
            } else {
                false
            }
        });
    }

    fn mark_streaming(&self, session: u64, device: &str) {
        self.state.send_if_modified(|s| {
            if !self.is_current(session) {
                return false;
            }
            if !s.streaming {
                s.activation += 1;
            }
            s.streaming = true;
            s.device = Some(device.to_string());
            s.last_error = None;
            true
        });
    }

    fn mark_failed(&self, session: u64, error: &CaptureError) {
        let failed = self.state.send_if_modified(|s| {
            if !self.is_current(session) {
                return false;
            }
            s.streaming = false;
            s.device = None;
            s.last_error = Some(error.to_string());
            true
        });
        if failed {
            self.frames.send_replace(None);
        }
    }
}

struct ActiveStream {
    device: String,
    stop: Arc<AtomicBool>,
    released: oneshot::Receiver<()>,
}

pub struct CaptureManager {
    backend: Arc<dyn CameraBackend>,
    shared: Arc<Shared>,
    /// Serializes start/stop/switch.
    active: tokio::sync::Mutex<Option<ActiveStream>>,
    /// Device used by `start(None)`: last one started, else the configured default.
    selected: Mutex<Option<String>>,
}

impl CaptureManager {
    pub fn new(backend: Arc<dyn CameraBackend>, default_device: Option<String>) -> Self {
        let (state, _) = watch::channel(StreamState::default());
        let (frames, _) = watch::channel(None);
        Self {
            backend,
            shared: Arc::new(Shared {
                state,
                frames,
                session: AtomicU64::new(0),
            }),
            active: tokio::sync::Mutex::new(None),
            selected: Mutex::new(default_device),
        }
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.borrow().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.state.borrow().streaming
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    /// Live frame source; stays valid across starts, stops and switches.
    pub fn frames(&self) -> FrameSource {
        FrameSource {
            rx: self.shared.frames.subscribe(),
        }
    }

    pub fn selected_device(&self) -> Option<String> {
        self.selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Enumerate cameras. Enumeration failures yield an empty list.
    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        let backend = Arc::clone(&self.backend);
        match tokio::task::spawn_blocking(move || backend.list_devices()).await {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "device enumeration failed");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "device enumeration task failed");
                Vec::new()
            }
        }
    }

    /// Acquire `device_id` (or the selected/first device), replacing any
    /// active stream.
    pub async fn start(&self, device_id: Option<&str>) -> Result<FrameSource, CaptureError> {
        self.acquire(device_id).await
    }

    /// Move the stream to another device.
    ///
    /// "Streaming" is never reported false during a successful switch, and
    /// the activation count is unchanged.
    pub async fn switch(&self, device_id: &str) -> Result<FrameSource, CaptureError> {
        tracing::info!(device = device_id, "switching camera");
        self.acquire(Some(device_id)).await
    }

    /// Release the active device. No-op when already stopped.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(previous) = active.take() else {
            return;
        };
        self.release(previous).await;
        self.shared.state.send_modify(|s| {
            s.streaming = false;
            s.device = None;
        });
        tracing::info!("camera stopped");
    }

    async fn acquire(&self, device_id: Option<&str>) -> Result<FrameSource, CaptureError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.release(previous).await;
        }

        let device = match device_id {
            Some(id) => id.to_string(),
            None => match self.default_device().await {
                Some(id) => id,
                None => return Err(self.fail(CaptureError::NoDevice)),
            },
        };

        let stream = self.spawn_capture(&device).await.map_err(|e| self.fail(e))?;
        *self
            .selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(device);
        *active = Some(stream);
        Ok(self.frames())
    }

    async fn default_device(&self) -> Option<String> {
        if let Some(selected) = self.selected_device() {
            return Some(selected);
        }
        self.list_devices().await.into_iter().next().map(|d| d.id)
    }

    /// Open `device` on a dedicated capture thread and wait for the outcome.
    async fn spawn_capture(&self, device: &str) -> Result<ActiveStream, CaptureError> {
        let session = self.shared.session.fetch_add(1, Ordering::AcqRel) + 1;
        let stop = Arc::new(AtomicBool::new(false));
        let (opened_tx, opened_rx) = oneshot::channel();
        let (released_tx, released_rx) = oneshot::channel();

        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&self.shared);
        let thread_stop = Arc::clone(&stop);
        let thread_device = device.to_string();

        std::thread::Builder::new()
            .name("lookout-capture".into())
            .spawn(move || {
                capture_thread(
                    backend.as_ref(),
                    &thread_device,
                    session,
                    &shared,
                    &thread_stop,
                    opened_tx,
                );
                let _ = released_tx.send(());
            })
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        match opened_rx.await {
            Ok(Ok(())) => Ok(ActiveStream {
                device: device.to_string(),
                stop,
                released: released_rx,
            }),
            Ok(Err(e)) => {
                let _ = released_rx.await;
                Err(e)
            }
            Err(_) => Err(CaptureError::CaptureFailed(
                "capture thread exited before opening the device".into(),
            )),
        }
    }

    /// Stop a capture thread and wait until it has dropped the device.
    async fn release(&self, stream: ActiveStream) {
        // Invalidate first so nothing from the old thread is published.
        self.shared.session.fetch_add(1, Ordering::AcqRel);
        stream.stop.store(true, Ordering::Release);
        let _ = stream.released.await;
        self.shared.frames.send_replace(None);
        tracing::debug!(device = %stream.device, "camera released");
    }

    fn fail(&self, error: CaptureError) -> CaptureError {
        tracing::warn!(error = %error, "camera start failed");
        self.shared.state.send_modify(|s| {
            s.streaming = false;
            s.device = None;
            s.last_error = Some(error.to_string());
        });
        self.shared.frames.send_replace(None);
        error
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            self.shared.session.fetch_add(1, Ordering::AcqRel);
            active.stop.store(true, Ordering::Release);
        }
    }
}

fn capture_thread(
    backend: &dyn CameraBackend,
    device: &str,
    session: u64,
    shared: &Shared,
    stop: &AtomicBool,
    opened: oneshot::Sender<Result<(), CaptureError>>,
) {
    let mut stream: Box<dyn CameraStream> = match backend.open(device) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = opened.send(Err(e));
            return;
        }
    };
    shared.mark_streaming(session, stream.device_id());
    let _ = opened.send(Ok(()));
    tracing::info!(device, "capture started");

    while !stop.load(Ordering::Acquire) {
        match stream.next_frame() {
            Ok(frame) => shared.publish_frame(session, frame),
            Err(e) => {
                tracing::error!(device, error = %e, "capture stream failed");
                shared.mark_failed(session, &e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticBackend;
    use lookout_core::PixelFormat;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Backend that counts simultaneously open handles.
    #[derive(Default)]
    struct CountingBackend {
        devices: Vec<String>,
        open_now: Arc<AtomicUsize>,
        max_open: Arc<AtomicUsize>,
        /// Fail with `Disconnected` after this many frames.
        disconnect_after: Option<u64>,
        list_fails: bool,
    }

    impl CountingBackend {
        fn with_devices(devices: &[&str]) -> Self {
            Self {
                devices: devices.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    struct CountingStream {
        id: String,
        sequence: u64,
        open_now: Arc<AtomicUsize>,
        disconnect_after: Option<u64>,
    }

    impl CameraBackend for CountingBackend {
        fn list_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
            if self.list_fails {
                return Err(CaptureError::CaptureFailed("enumeration unsupported".into()));
            }
            Ok(self
                .devices
                .iter()
                .map(|id| DeviceInfo {
                    id: id.clone(),
                    label: id.to_uppercase(),
                    driver: "test".into(),
                    bus: "test".into(),
                })
                .collect())
        }

        fn open(&self, device_id: &str) -> Result<Box<dyn CameraStream>, CaptureError> {
            if !self.devices.iter().any(|d| d == device_id) {
                return Err(CaptureError::DeviceNotFound(device_id.into()));
            }
            let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_open.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(CountingStream {
                id: device_id.into(),
                sequence: 0,
                open_now: Arc::clone(&self.open_now),
                disconnect_after: self.disconnect_after,
            }))
        }
    }

    impl CameraStream for CountingStream {
        fn device_id(&self) -> &str {
            &self.id
        }

        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            std::thread::sleep(Duration::from_millis(2));
            self.sequence += 1;
            if self.disconnect_after.is_some_and(|n| self.sequence > n) {
                return Err(CaptureError::Disconnected(self.id.clone()));
            }
            Frame::new(vec![0u8; 4], 2, 2, PixelFormat::Gray8, self.sequence)
                .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
        }
    }

    impl Drop for CountingStream {
        fn drop(&mut self) {
            self.open_now.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn wait_for_frame(source: &mut FrameSource) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), source.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("frame channel closed")
    }

    #[tokio::test]
    async fn test_start_streams_frames() {
        let manager = CaptureManager::new(
            Arc::new(SyntheticBackend::new(["cam0"]).with_frame_interval(Duration::from_millis(1))),
            None,
        );
        assert!(!manager.is_streaming());

        let mut frames = manager.start(None).await.unwrap();
        let state = manager.state();
        assert!(state.streaming);
        assert_eq!(state.device.as_deref(), Some("cam0"));
        assert_eq!(state.activation, 1);

        let frame = wait_for_frame(&mut frames).await;
        assert!(frame.sequence >= 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_clears_frames() {
        let backend = CountingBackend::with_devices(&["a"]);
        let open_now = Arc::clone(&backend.open_now);
        let manager = CaptureManager::new(Arc::new(backend), None);

        manager.stop().await;
        let mut frames = manager.start(Some("a")).await.unwrap();
        wait_for_frame(&mut frames).await;

        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_streaming());
        assert!(frames.latest().is_none());
        assert_eq!(open_now.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restart_never_holds_two_devices() {
        let backend = CountingBackend::with_devices(&["a", "b"]);
        let max_open = Arc::clone(&backend.max_open);
        let manager = CaptureManager::new(Arc::new(backend), None);

        for device in ["a", "b", "a", "b"] {
            let mut frames = manager.start(Some(device)).await.unwrap();
            wait_for_frame(&mut frames).await;
        }
        manager.stop().await;
        assert_eq!(max_open.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_switch_preserves_streaming() {
        let manager = CaptureManager::new(Arc::new(CountingBackend::with_devices(&["a", "b"])), None);
        let mut frames = manager.start(Some("a")).await.unwrap();
        wait_for_frame(&mut frames).await;

        let mut states = manager.subscribe();
        states.borrow_and_update();
        let watcher = tokio::spawn(async move {
            let mut saw_stopped = false;
            while states.changed().await.is_ok() {
                saw_stopped |= !states.borrow_and_update().streaming;
            }
            saw_stopped
        });

        manager.switch("b").await.unwrap();
        let frame = wait_for_frame(&mut frames).await;
        assert!(frame.sequence >= 1);

        let state = manager.state();
        assert!(state.streaming);
        assert_eq!(state.device.as_deref(), Some("b"));
        assert_eq!(state.activation, 1);
        assert_eq!(manager.selected_device().as_deref(), Some("b"));

        drop(manager);
        assert!(!watcher.await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_switch_leaves_manager_stopped() {
        let backend = CountingBackend::with_devices(&["a"]);
        let open_now = Arc::clone(&backend.open_now);
        let manager = CaptureManager::new(Arc::new(backend), None);
        manager.start(Some("a")).await.unwrap();

        let err = manager.switch("missing").await.unwrap_err();
        assert_eq!(err, CaptureError::DeviceNotFound("missing".into()));

        let state = manager.state();
        assert!(!state.streaming);
        assert!(state.device.is_none());
        assert!(state.last_error.unwrap().contains("missing"));
        assert_eq!(open_now.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_mid_stream_stops() {
        let mut backend = CountingBackend::with_devices(&["a"]);
        backend.disconnect_after = Some(3);
        let manager = CaptureManager::new(Arc::new(backend), None);
        let mut states = manager.subscribe();

        manager.start(Some("a")).await.unwrap();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| s.last_error.is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();

        assert!(!state.streaming);
        assert!(state.last_error.unwrap().contains("disconnected"));
        assert!(manager.frames().latest().is_none());

        // A fresh start is a new activation.
        manager.start(Some("a")).await.unwrap();
        assert_eq!(manager.state().activation, 2);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_soft() {
        let backend = CountingBackend {
            list_fails: true,
            ..CountingBackend::with_devices(&["a"])
        };
        let manager = CaptureManager::new(Arc::new(backend), None);
        assert!(manager.list_devices().await.is_empty());
        assert_eq!(manager.start(None).await.err(), Some(CaptureError::NoDevice));
    }

    #[tokio::test]
    async fn test_start_uses_configured_default() {
        let manager = CaptureManager::new(
            Arc::new(CountingBackend::with_devices(&["a", "b"])),
            Some("b".into()),
        );
        manager.start(None).await.unwrap();
        assert_eq!(manager.state().device.as_deref(), Some("b"));
        manager.stop().await;
    }
}
