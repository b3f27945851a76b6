//! Detection Orchestrator: two independently polled inference pipelines.
//!
//! Each [`Pipeline`] publishes a [`PipelineSnapshot`] through a watch channel.
//! The snapshot carries a session id; `start` and `stop` bump it, and a
//! completion is only published if its session is still current. Stop and
//! clear happen in one channel update, so no completion can land after a stop.
//!
//! A per-pipeline busy flag guarantees at most one call into the port at a
//! time. The flag is held by the spawned inference task, not by the ticker,
//! so it survives a restart: the new session drops ticks until the previous
//! call returns.

use async_trait::async_trait;
use lookout_core::{
    Detection, FaceEmbedder, Frame, ObjectDetector, PortError, ResolvedFace, SharedMatcher,
};
use lookout_hw::FrameSource;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One inference step run by a pipeline on each tick.
#[async_trait]
pub trait PipelineStage: Send + Sync + 'static {
    type Output: Clone + Default + Send + Sync + 'static;

    async fn run(&self, frame: &Frame) -> Result<Self::Output, PortError>;
}

/// Generic object detection.
pub struct ObjectStage {
    detector: Arc<dyn ObjectDetector>,
}

impl ObjectStage {
    pub fn new(detector: Arc<dyn ObjectDetector>) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl PipelineStage for ObjectStage {
    type Output = Vec<Detection>;

    async fn run(&self, frame: &Frame) -> Result<Vec<Detection>, PortError> {
        self.detector.detect(frame).await
    }
}

/// Face detection with every embedding resolved against the gallery.
pub struct FaceStage {
    embedder: Arc<dyn FaceEmbedder>,
    matcher: SharedMatcher,
}

impl FaceStage {
    pub fn new(embedder: Arc<dyn FaceEmbedder>, matcher: SharedMatcher) -> Self {
        Self { embedder, matcher }
    }
}

#[async_trait]
impl PipelineStage for FaceStage {
    type Output = Vec<ResolvedFace>;

    async fn run(&self, frame: &Frame) -> Result<Vec<ResolvedFace>, PortError> {
        let observations = self.embedder.detect_faces(frame).await?;
        // One index snapshot per tick.
        let index = self.matcher.snapshot();
        Ok(observations
            .into_iter()
            .map(|obs| {
                let result = lookout_core::matcher::resolve(index.as_deref(), &obs.embedding);
                ResolvedFace::new(obs, result)
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Polling,
}

/// Published state of one pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSnapshot<T> {
    #[serde(skip)]
    pub session: u64,
    pub state: PipelineState,
    pub items: T,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub completed_ticks: u64,
}

/// Serializable status of a pipeline without its result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Calls currently inside the port (0 or 1).
    pub in_flight: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub interval: Duration,
    /// Consecutive failed ticks that stop the pipeline; 0 disables.
    pub max_tick_failures: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_tick_failures: 50,
        }
    }
}

pub struct Pipeline<S: PipelineStage> {
    name: &'static str,
    max_tick_failures: u32,
    published: Arc<watch::Sender<PipelineSnapshot<S::Output>>>,
    busy: Arc<AtomicBool>,
    /// Calls currently inside the port; at most one.
    in_flight: Arc<AtomicU64>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: PipelineStage> Pipeline<S> {
    pub fn new(name: &'static str, max_tick_failures: u32) -> Self {
        let (published, _) = watch::channel(PipelineSnapshot::default());
        Self {
            name,
            max_tick_failures,
            published: Arc::new(published),
            busy: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicU64::new(0)),
            ticker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.published.borrow().state
    }

    pub fn is_polling(&self) -> bool {
        self.state() == PipelineState::Polling
    }

    /// Current result set; empty while idle.
    pub fn results(&self) -> S::Output {
        self.published.borrow().items.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        let snapshot = self.published.borrow();
        PipelineStatus {
            state: snapshot.state,
            last_error: snapshot.last_error.clone(),
            consecutive_failures: snapshot.consecutive_failures,
            in_flight: self.in_flight(),
        }
    }

    /// Start polling `frames` every `interval`. Restarts if already polling.
    pub fn start(&self, stage: Arc<S>, frames: FrameSource, interval: Duration) {
        let mut session = 0;
        self.published.send_modify(|s| {
            s.session += 1;
            session = s.session;
            s.state = PipelineState::Polling;
            s.items = S::Output::default();
            s.last_error = None;
            s.consecutive_failures = 0;
        });

        let ctx = self.tick_context(stage, session);
        let handle = tokio::spawn(run_ticker(ctx, frames, interval));

        let previous = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::info!(pipeline = self.name, session, ?interval, "pipeline started");
    }

    fn tick_context(&self, stage: Arc<S>, session: u64) -> TickContext<S> {
        TickContext {
            name: self.name,
            session,
            max_tick_failures: self.max_tick_failures,
            stage,
            published: Arc::clone(&self.published),
            busy: Arc::clone(&self.busy),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Stop polling and clear results. In-flight completions are discarded.
    pub fn stop(&self) {
        let stopped = self.published.send_if_modified(|s| {
            if s.state == PipelineState::Idle {
                return false;
            }
            s.session += 1;
            s.state = PipelineState::Idle;
            s.items = S::Output::default();
            s.consecutive_failures = 0;
            true
        });
        if let Some(ticker) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            ticker.abort();
        }
        if stopped {
            tracing::info!(pipeline = self.name, "pipeline stopped");
        }
    }

    /// Number of calls currently inside the port.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl<S: PipelineStage> Drop for Pipeline<S> {
    fn drop(&mut self) {
        if let Some(ticker) = self
            .ticker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            ticker.abort();
        }
    }
}

struct TickContext<S: PipelineStage> {
    name: &'static str,
    session: u64,
    max_tick_failures: u32,
    stage: Arc<S>,
    published: Arc<watch::Sender<PipelineSnapshot<S::Output>>>,
    busy: Arc<AtomicBool>,
    in_flight: Arc<AtomicU64>,
}

impl<S: PipelineStage> Clone for TickContext<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            session: self.session,
            max_tick_failures: self.max_tick_failures,
            stage: Arc::clone(&self.stage),
            published: Arc::clone(&self.published),
            busy: Arc::clone(&self.busy),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<S: PipelineStage> TickContext<S> {
    fn is_current(&self) -> bool {
        let snapshot = self.published.borrow();
        snapshot.session == self.session && snapshot.state == PipelineState::Polling
    }

    fn complete(&self, result: Result<S::Output, PortError>) {
        match result {
            Ok(items) => {
                self.published.send_if_modified(|s| {
                    if s.session != self.session {
                        return false;
                    }
                    s.items = items;
                    s.last_error = None;
                    s.consecutive_failures = 0;
                    s.completed_ticks += 1;
                    true
                });
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, error: PortError) {
        let mut failures = 0;
        let mut exhausted = false;
        let current = self.published.send_if_modified(|s| {
            if s.session != self.session {
                return false;
            }
            s.consecutive_failures += 1;
            s.last_error = Some(error.to_string());
            failures = s.consecutive_failures;
            if self.max_tick_failures > 0 && failures >= self.max_tick_failures {
                exhausted = true;
                s.session += 1;
                s.state = PipelineState::Idle;
                s.items = S::Output::default();
            }
            true
        });
        if !current {
            tracing::debug!(pipeline = self.name, error = %error, "discarding stale failure");
        } else if exhausted {
            tracing::error!(
                pipeline = self.name,
                failures,
                error = %error,
                "too many consecutive failures; pipeline stopped"
            );
        } else {
            tracing::warn!(pipeline = self.name, failures, error = %error, "tick failed");
        }
    }
}

/// Releases the busy flag when the inference task ends, even on panic.
struct BusyGuard {
    busy: Arc<AtomicBool>,
    in_flight: Arc<AtomicU64>,
}

impl BusyGuard {
    fn try_acquire(busy: &Arc<AtomicBool>, in_flight: &Arc<AtomicU64>) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        in_flight.fetch_add(1, Ordering::AcqRel);
        Some(Self {
            busy: Arc::clone(busy),
            in_flight: Arc::clone(in_flight),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.busy.store(false, Ordering::Release);
    }
}

async fn run_ticker<S: PipelineStage>(ctx: TickContext<S>, frames: FrameSource, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !ctx.is_current() {
            break;
        }
        let Some(frame) = frames.latest() else {
            tracing::trace!(pipeline = ctx.name, "no frame available");
            continue;
        };
        let Some(guard) = BusyGuard::try_acquire(&ctx.busy, &ctx.in_flight) else {
            tracing::trace!(pipeline = ctx.name, "previous call still running; tick dropped");
            continue;
        };

        tokio::spawn(run_tick(ctx.clone(), frame, guard));
    }
    tracing::debug!(pipeline = ctx.name, session = ctx.session, "ticker exited");
}

/// One call into the stage. A stop that lands after the tick fired but
/// before this runs skips the call.
async fn run_tick<S: PipelineStage>(ctx: TickContext<S>, frame: Frame, guard: BusyGuard) {
    let _guard = guard;
    if !ctx.is_current() {
        tracing::trace!(pipeline = ctx.name, "session ended before the call; tick dropped");
        return;
    }
    let result = ctx.stage.run(&frame).await;
    ctx.complete(result);
}

/// The object and face pipelines.
pub struct Orchestrator {
    settings: PipelineSettings,
    objects: Pipeline<ObjectStage>,
    faces: Pipeline<FaceStage>,
}

impl Orchestrator {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            objects: Pipeline::new("objects", settings.max_tick_failures),
            faces: Pipeline::new("faces", settings.max_tick_failures),
        }
    }

    pub fn objects(&self) -> &Pipeline<ObjectStage> {
        &self.objects
    }

    pub fn faces(&self) -> &Pipeline<FaceStage> {
        &self.faces
    }

    pub fn start_objects(&self, detector: Arc<dyn ObjectDetector>, frames: FrameSource) {
        self.objects.start(
            Arc::new(ObjectStage::new(detector)),
            frames,
            self.settings.interval,
        );
    }

    pub fn start_faces(
        &self,
        embedder: Arc<dyn FaceEmbedder>,
        matcher: SharedMatcher,
        frames: FrameSource,
    ) {
        self.faces.start(
            Arc::new(FaceStage::new(embedder, matcher)),
            frames,
            self.settings.interval,
        );
    }

    pub fn stop_all(&self) {
        self.objects.stop();
        self.faces.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::{BoundingBox, PixelFormat};
    use std::sync::atomic::AtomicUsize;

    /// Stage that counts calls and takes `delay` per call.
    struct SlowStage {
        delay: Duration,
        calls: AtomicUsize,
        fail: bool,
    }

    impl SlowStage {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl PipelineStage for SlowStage {
        type Output = Vec<Detection>;

        async fn run(&self, frame: &Frame) -> Result<Vec<Detection>, PortError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(PortError::InferenceFailed("boom".into()));
            }
            Ok(vec![Detection {
                label: format!("frame-{}", frame.sequence),
                confidence: 0.9,
                bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            }])
        }
    }

    fn frame_source() -> (watch::Sender<Option<Frame>>, FrameSource) {
        let (tx, source) = FrameSource::channel();
        tx.send_replace(Some(
            Frame::new(vec![0; 4], 2, 2, PixelFormat::Gray8, 1).unwrap(),
        ));
        (tx, source)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_port_drops_ticks() {
        let pipeline = Pipeline::new("objects", 0);
        let stage = Arc::new(SlowStage::new(Duration::from_millis(350)));
        let (_tx, frames) = frame_source();

        pipeline.start(Arc::clone(&stage), frames, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(1000)).await;

        // Ticks at 0, 400, 800 find the pipeline free; the rest are dropped.
        assert_eq!(stage.calls.load(Ordering::SeqCst), 3);
        assert!(pipeline.in_flight() <= 1);
        assert_eq!(pipeline.results().len(), 1);
        pipeline.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_frame_is_a_noop() {
        let pipeline = Pipeline::new("objects", 1);
        let stage = Arc::new(SlowStage::new(Duration::ZERO));
        let (_tx, frames) = FrameSource::channel();

        pipeline.start(Arc::clone(&stage), frames, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(550)).await;

        assert_eq!(stage.calls.load(Ordering::SeqCst), 0);
        assert!(pipeline.is_polling());
        assert!(pipeline.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_dispatched_before_stop_skips_the_call() {
        let pipeline = Pipeline::new("objects", 0);
        let stage = Arc::new(SlowStage::new(Duration::ZERO));
        let (_tx, frames) = frame_source();
        let frame = frames.latest().unwrap();

        pipeline.start(Arc::clone(&stage), frames, Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);

        // A tick fired for this session, then the pipeline stopped before
        // the spawned call was polled.
        let session = pipeline.published.borrow().session;
        let ctx = pipeline.tick_context(Arc::clone(&stage), session);
        let guard = BusyGuard::try_acquire(&pipeline.busy, &pipeline.in_flight).unwrap();
        pipeline.stop();
        run_tick(ctx, frame, guard).await;

        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.in_flight(), 0);
        assert!(!pipeline.busy.load(Ordering::Acquire));
        assert!(pipeline.results().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_completion() {
        let pipeline = Pipeline::new("objects", 0);
        let stage = Arc::new(SlowStage::new(Duration::from_millis(250)));
        let (_tx, frames) = frame_source();

        pipeline.start(Arc::clone(&stage), frames, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(pipeline.results().len(), 1);

        // Second call is in flight (started at 300, completes at 550).
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.stop();
        assert!(pipeline.results().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Idle);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(pipeline.results().is_empty());
        assert_eq!(stage.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_for_previous_call() {
        let pipeline = Pipeline::new("objects", 0);
        let stage = Arc::new(SlowStage::new(Duration::from_millis(500)));
        let (_tx, frames) = frame_source();

        pipeline.start(Arc::clone(&stage), frames.clone(), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);

        pipeline.start(Arc::clone(&stage), frames, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(300)).await;
        // The first call still holds the pipeline; no overlap.
        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
        assert!(pipeline.results().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        // First call finished at 500 and was discarded; the new session
        // picked up at the 550 tick.
        assert_eq!(stage.calls.load(Ordering::SeqCst), 2);
        assert!(pipeline.results().is_empty());
        pipeline.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_failures_stop_pipeline() {
        let pipeline = Pipeline::new("objects", 3);
        let stage = Arc::new(SlowStage {
            fail: true,
            ..SlowStage::new(Duration::ZERO)
        });
        let (_tx, frames) = frame_source();

        pipeline.start(Arc::clone(&stage), frames, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Polling);
        assert_eq!(status.consecutive_failures, 2);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Idle);
        assert_eq!(status.last_error.as_deref(), Some("inference failed: boom"));
        assert_eq!(stage.calls.load(Ordering::SeqCst), 3);
    }
}
