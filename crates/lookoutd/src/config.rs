use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "lookout.toml";

/// Storage format for the enrolled gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GalleryBackend {
    Json,
    Sqlite,
}

impl GalleryBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackendKind {
    V4l,
    Synthetic,
}

impl CameraBackendKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "v4l" | "v4l2" => Some(Self::V4l),
            "synthetic" => Some(Self::Synthetic),
            _ => None,
        }
    }
}

/// Daemon configuration: defaults, then the TOML file, then `LOOKOUT_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Tick period of both detection pipelines.
    pub poll_interval: Duration,
    /// Maximum normalized distance (`‖a − b‖ / 2`, 0..1 for unit embeddings)
    /// for a positive identity match.
    pub match_threshold: f32,
    /// Camera used when none is named; `None` picks the first enumerated one.
    pub camera_device: Option<String>,
    pub camera_backend: CameraBackendKind,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub gallery_path: PathBuf,
    pub gallery_backend: GalleryBackend,
    /// Consecutive failed ticks before a pipeline stops itself (0 = never).
    pub max_tick_failures: u32,
    /// Start both pipelines automatically once the stream and models are ready.
    pub auto_start: bool,
    /// Open the camera when the daemon starts.
    pub start_camera: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    poll_interval_ms: Option<u64>,
    match_threshold: Option<f32>,
    camera_device: Option<String>,
    camera_backend: Option<CameraBackendKind>,
    model_dir: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    gallery_backend: Option<GalleryBackend>,
    max_tick_failures: Option<u32>,
    auto_start: Option<bool>,
    start_camera: Option<bool>,
}

impl Config {
    /// Built-in defaults rooted at `data_dir`.
    pub fn defaults(data_dir: &Path) -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            match_threshold: lookout_core::DEFAULT_MATCH_THRESHOLD,
            camera_device: None,
            camera_backend: CameraBackendKind::V4l,
            model_dir: data_dir.join("models"),
            gallery_path: data_dir.join("known_faces.json"),
            gallery_backend: GalleryBackend::Json,
            max_tick_failures: 50,
            auto_start: true,
            start_camera: true,
        }
    }

    /// Load from the process environment and the config file it points to.
    pub fn load() -> Self {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for every environment variable.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::defaults(&data_dir(&lookup));

        if let Some(path) = config_path(&lookup) {
            match read_file(&path) {
                Ok(Some(file)) => {
                    tracing::info!(path = %path.display(), "loaded config file");
                    config.apply_file(file);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring config file"),
            }
        }

        config.apply_env(&lookup);
        config
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(ms) = file.poll_interval_ms {
            self.set_poll_interval_ms(ms);
        }
        if let Some(threshold) = file.match_threshold {
            self.set_match_threshold(threshold);
        }
        if let Some(device) = file.camera_device {
            self.camera_device = Some(device).filter(|d| !d.trim().is_empty());
        }
        if let Some(kind) = file.camera_backend {
            self.camera_backend = kind;
        }
        if let Some(dir) = file.model_dir {
            self.model_dir = dir;
        }
        if let Some(path) = file.gallery_path {
            self.gallery_path = path;
        }
        if let Some(backend) = file.gallery_backend {
            self.gallery_backend = backend;
        }
        if let Some(n) = file.max_tick_failures {
            self.max_tick_failures = n;
        }
        if let Some(flag) = file.auto_start {
            self.auto_start = flag;
        }
        if let Some(flag) = file.start_camera {
            self.start_camera = flag;
        }
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = env_parse(lookup, "LOOKOUT_POLL_INTERVAL_MS") {
            self.set_poll_interval_ms(ms);
        }
        if let Some(threshold) = env_parse(lookup, "LOOKOUT_MATCH_THRESHOLD") {
            self.set_match_threshold(threshold);
        }
        if let Some(device) = lookup("LOOKOUT_CAMERA_DEVICE") {
            self.camera_device = Some(device).filter(|d| !d.trim().is_empty());
        }
        if let Some(kind) = env_with(lookup, "LOOKOUT_CAMERA_BACKEND", CameraBackendKind::parse) {
            self.camera_backend = kind;
        }
        if let Some(dir) = lookup("LOOKOUT_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("LOOKOUT_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(path);
        }
        if let Some(backend) = env_with(lookup, "LOOKOUT_GALLERY_BACKEND", GalleryBackend::parse) {
            self.gallery_backend = backend;
        }
        if let Some(n) = env_parse(lookup, "LOOKOUT_MAX_TICK_FAILURES") {
            self.max_tick_failures = n;
        }
        if let Some(flag) = env_with(lookup, "LOOKOUT_AUTO_START", parse_bool) {
            self.auto_start = flag;
        }
        if let Some(flag) = env_with(lookup, "LOOKOUT_START_CAMERA", parse_bool) {
            self.start_camera = flag;
        }
    }

    fn set_poll_interval_ms(&mut self, ms: u64) {
        if ms == 0 {
            tracing::warn!("poll interval must be positive; keeping default");
        } else {
            self.poll_interval = Duration::from_millis(ms);
        }
    }

    fn set_match_threshold(&mut self, threshold: f32) {
        if threshold.is_finite() && threshold >= 0.0 {
            self.match_threshold = threshold;
        } else {
            tracing::warn!(threshold, "invalid match threshold; keeping default");
        }
    }

    /// Path to the YOLOv8 object model.
    pub fn object_model_path(&self) -> PathBuf {
        self.model_dir.join(lookout_models::OBJECT_MODEL_FILE)
    }

    /// Path to the SCRFD face detection model.
    pub fn face_detector_model_path(&self) -> PathBuf {
        self.model_dir.join(lookout_models::FACE_DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace embedding model.
    pub fn face_embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(lookout_models::FACE_EMBEDDER_MODEL_FILE)
    }
}

fn data_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("lookout")
}

fn config_path(lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = lookup("LOOKOUT_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let config_home = lookup("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| lookup("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(config_home.join("lookout").join(CONFIG_FILE_NAME))
}

fn read_file(path: &Path) -> Result<Option<ConfigFile>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    toml::from_str(&raw).map(Some).map_err(|e| e.to_string())
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    env_with(lookup, key, |v| v.trim().parse().ok())
}

fn env_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "invalid value; keeping default");
    }
    parsed
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::load_with(lookup(&[("HOME", "/home/ada")]));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!((config.match_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.camera_device, None);
        assert_eq!(
            config.gallery_path,
            PathBuf::from("/home/ada/.local/share/lookout/known_faces.json")
        );
        assert_eq!(config.gallery_backend, GalleryBackend::Json);
        assert_eq!(config.max_tick_failures, 50);
        assert!(config.auto_start && config.start_camera);
        assert_eq!(
            config.object_model_path(),
            PathBuf::from("/home/ada/.local/share/lookout/models/yolov8n.onnx")
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::load_with(lookup(&[
            ("XDG_DATA_HOME", "/data"),
            ("LOOKOUT_POLL_INTERVAL_MS", "250"),
            ("LOOKOUT_MATCH_THRESHOLD", "0.45"),
            ("LOOKOUT_CAMERA_DEVICE", "/dev/video4"),
            ("LOOKOUT_GALLERY_BACKEND", "SQLite"),
            ("LOOKOUT_MAX_TICK_FAILURES", "0"),
            ("LOOKOUT_AUTO_START", "off"),
            ("LOOKOUT_CAMERA_BACKEND", "synthetic"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!((config.match_threshold - 0.45).abs() < 1e-6);
        assert_eq!(config.camera_device.as_deref(), Some("/dev/video4"));
        assert_eq!(config.gallery_backend, GalleryBackend::Sqlite);
        assert_eq!(config.max_tick_failures, 0);
        assert!(!config.auto_start);
        assert_eq!(config.camera_backend, CameraBackendKind::Synthetic);
        assert_eq!(config.model_dir, PathBuf::from("/data/lookout/models"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = Config::load_with(lookup(&[
            ("HOME", "/h"),
            ("LOOKOUT_POLL_INTERVAL_MS", "0"),
            ("LOOKOUT_MATCH_THRESHOLD", "-1"),
            ("LOOKOUT_GALLERY_BACKEND", "redis"),
            ("LOOKOUT_AUTO_START", "maybe"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!((config.match_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.gallery_backend, GalleryBackend::Json);
        assert!(config.auto_start);
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookout.toml");
        std::fs::write(
            &path,
            "poll_interval_ms = 200\nmatch_threshold = 0.5\ngallery_backend = \"sqlite\"\nstart_camera = false\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let config = Config::load_with(lookup(&[
            ("HOME", "/h"),
            ("LOOKOUT_CONFIG", &path_str),
            ("LOOKOUT_MATCH_THRESHOLD", "0.7"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert!((config.match_threshold - 0.7).abs() < 1e-6);
        assert_eq!(config.gallery_backend, GalleryBackend::Sqlite);
        assert!(!config.start_camera);
    }

    #[test]
    fn test_unparsable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lookout.toml");
        std::fs::write(&path, "poll_interval_ms = \"fast\"\n").unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let config = Config::load_with(lookup(&[("HOME", "/h"), ("LOOKOUT_CONFIG", &path_str)]));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }
}
