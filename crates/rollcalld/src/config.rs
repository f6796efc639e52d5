use rollcall_core::DistanceMetric;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Frame origin: `stream` (networked MJPEG camera) or `local` (V4L2).
    pub source: FrameOrigin,
    /// MJPEG/snapshot URL of the classroom camera.
    pub stream_url: String,
    /// V4L2 device path for the local fallback.
    pub camera_device: String,
    /// Per-read network timeout for the stream.
    pub stream_timeout: Duration,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Distance metric for signature matching.
    pub match_metric: DistanceMetric,
    /// Acceptance threshold: best distance must be strictly below this.
    pub match_threshold: f32,
    /// Runner-up margin under which a match is flagged ambiguous.
    pub ambiguity_margin: f32,
    /// Default minutes after session start during which arrivals are
    /// "present"; a settings row or per-session value overrides it.
    pub late_after_minutes: i64,
    /// Process every Nth delivered frame.
    pub frame_skip: u32,
    /// Linear scale of the detection copy (e.g. 0.25).
    pub detection_scale: f32,
    /// Frames between embeddings for a persistent track.
    pub embed_interval: u32,
    /// Processed frames a track survives without a detection.
    pub track_miss_grace: u32,
    /// Valid face frames required per enrollment pose stage.
    pub enroll_frames_per_stage: u32,
    /// ESP32 bridge base URL; None disables hardware feedback.
    pub notifier_url: Option<String>,
    /// Timeout for one hardware notification request.
    pub notify_timeout: Duration,
    /// Reconnect backoff bounds for the frame source.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

/// Which frame source the pipeline opens at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    Stream,
    Local,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with
    /// defaults suitable for a single-classroom deployment.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let source = match std::env::var("ROLLCALL_SOURCE").as_deref() {
            Ok("local") => FrameOrigin::Local,
            _ => FrameOrigin::Stream,
        };

        Self {
            source,
            stream_url: std::env::var("ROLLCALL_STREAM_URL")
                .unwrap_or_else(|_| "http://192.168.1.101:81/stream".to_string()),
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            stream_timeout: Duration::from_millis(env_u64("ROLLCALL_STREAM_TIMEOUT_MS", 2000)),
            model_dir,
            db_path,
            match_metric: std::env::var("ROLLCALL_MATCH_METRIC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DistanceMetric::Euclidean),
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", 0.6),
            ambiguity_margin: env_f32("ROLLCALL_AMBIGUITY_MARGIN", 0.05),
            late_after_minutes: env_u64("ROLLCALL_LATE_AFTER_MINUTES", 15) as i64,
            frame_skip: env_u32("ROLLCALL_FRAME_SKIP", 2),
            detection_scale: env_f32("ROLLCALL_DETECTION_SCALE", 0.25),
            embed_interval: env_u32("ROLLCALL_EMBED_INTERVAL", 10),
            track_miss_grace: env_u32("ROLLCALL_TRACK_MISS_GRACE", 5),
            enroll_frames_per_stage: env_u32("ROLLCALL_ENROLL_FRAMES_PER_STAGE", 3),
            notifier_url: std::env::var("ROLLCALL_NOTIFIER_URL").ok(),
            notify_timeout: Duration::from_millis(env_u64("ROLLCALL_NOTIFY_TIMEOUT_MS", 800)),
            backoff_base: Duration::from_millis(env_u64("ROLLCALL_BACKOFF_BASE_MS", 250)),
            backoff_max: Duration::from_millis(env_u64("ROLLCALL_BACKOFF_MAX_MS", 10_000)),
        }
    }

    /// Path to the lightweight SCRFD proposal model.
    pub fn proposal_model_path(&self) -> String {
        self.model_dir
            .join("det_500m.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the full SCRFD verification model.
    pub fn verify_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace embedding model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
