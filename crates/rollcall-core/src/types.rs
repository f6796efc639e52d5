use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Center of the box in frame coordinates.
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Rescale box and landmarks by a uniform factor (e.g. mapping a
    /// detection from a downscaled frame back to source coordinates).
    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance to another embedding.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Cosine distance (1 − cosine similarity) to another embedding.
    ///
    /// Ranges over [0, 2]; 0 = identical direction. Degenerate (zero-norm)
    /// inputs yield the maximum distance rather than a NaN.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            1.0 - dot / denom
        } else {
            2.0
        }
    }

    /// Mean of a non-empty set of embeddings (used to fold one capture
    /// stage's samples into a single signature).
    pub fn mean_of(samples: &[Embedding]) -> Option<Embedding> {
        let first = samples.first()?;
        let dim = first.values.len();
        let mut acc = vec![0.0f32; dim];
        for sample in samples {
            for (slot, v) in acc.iter_mut().zip(sample.values.iter()) {
                *slot += v;
            }
        }
        let n = samples.len() as f32;
        Some(Embedding::new(acc.into_iter().map(|v| v / n).collect()))
    }
}

/// One enrolled face signature: a pose label and its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceSignature {
    pub pose: String,
    pub embedding: Embedding,
}

/// An enrolled student as seen by the matcher: identity plus the full
/// signature set captured at enrollment.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub student_id: String,
    pub name: String,
    pub level: String,
    pub signatures: Vec<FaceSignature>,
}

/// Distance metric for signature comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Euclidean,
    Cosine,
}

impl DistanceMetric {
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::Cosine => a.cosine_distance(b),
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Result of matching a probe embedding against the enrolled gallery.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    /// Best student landed under the acceptance threshold.
    Identified {
        student_id: String,
        name: String,
        level: String,
        distance: f32,
        /// Another student's minimum distance was within the ambiguity
        /// margin of the winner. The match still stands; flagged so the
        /// operator can tune thresholds.
        ambiguous: bool,
    },
    /// Nobody under the threshold (or the gallery is empty).
    Unknown { best_distance: Option<f32> },
}

/// Strategy for identifying a probe embedding against the gallery.
pub trait Matcher {
    fn identify(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchOutcome;
}

/// Nearest-signature matcher.
///
/// Each student's comparison distance is the minimum over all of their
/// signatures; the student with the globally minimal distance wins if that
/// distance is under the threshold. Exact ties resolve to the earliest
/// gallery entry, so a gallery in stable (student id) order gives
/// deterministic results.
pub struct NearestMatcher {
    pub metric: DistanceMetric,
    pub threshold: f32,
    /// Margin under which a runner-up flags the match as ambiguous.
    pub ambiguity_margin: f32,
}

impl Matcher for NearestMatcher {
    fn identify(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;
        let mut runner_up: Option<f32> = None;

        for (idx, entry) in gallery.iter().enumerate() {
            let Some(dist) = entry
                .signatures
                .iter()
                .map(|sig| self.metric.distance(probe, &sig.embedding))
                .fold(None::<f32>, |acc, d| Some(acc.map_or(d, |m| m.min(d))))
            else {
                continue; // no signatures enrolled yet
            };

            match best {
                Some((_, best_dist)) if dist >= best_dist => {
                    runner_up = Some(runner_up.map_or(dist, |r| r.min(dist)));
                }
                _ => {
                    if let Some((_, prev)) = best {
                        runner_up = Some(runner_up.map_or(prev, |r| r.min(prev)));
                    }
                    best = Some((idx, dist));
                }
            }
        }

        match best {
            Some((idx, dist)) if dist < self.threshold => {
                let ambiguous = runner_up
                    .map(|r| r - dist <= self.ambiguity_margin)
                    .unwrap_or(false);
                if ambiguous {
                    tracing::warn!(
                        student_id = %gallery[idx].student_id,
                        distance = dist,
                        runner_up = runner_up.unwrap_or(f32::NAN),
                        "ambiguous match resolved to nearest student"
                    );
                }
                MatchOutcome::Identified {
                    student_id: gallery[idx].student_id.clone(),
                    name: gallery[idx].name.clone(),
                    level: gallery[idx].level.clone(),
                    distance: dist,
                    ambiguous,
                }
            }
            Some((_, dist)) => MatchOutcome::Unknown {
                best_distance: Some(dist),
            },
            None => MatchOutcome::Unknown {
                best_distance: None,
            },
        }
    }
}
