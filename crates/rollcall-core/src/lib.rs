//! rollcall-core — Face detection, embedding and identity matching.
//!
//! Uses a two-stage SCRFD detector and ArcFace embeddings, both running via
//! ONNX Runtime for CPU inference, plus the cross-frame tracker that
//! schedules when embeddings are worth recomputing.

pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod tracker;
pub mod types;

pub use detector::{DetectorError, FaceDetector};
pub use embedder::{EmbedError, FaceEmbedder, SIGNATURE_DIM};
pub use tracker::{FaceTracker, TrackHit, TrackerConfig};
pub use types::{
    BoundingBox, DistanceMetric, Embedding, FaceSignature, GalleryEntry, MatchOutcome, Matcher,
    NearestMatcher,
};

/// Default model directory when `ROLLCALL_MODEL_DIR` is unset.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/rollcall/models")
}
