//! Cross-frame face tracking.
//!
//! Associates detections across consecutive processed frames into
//! short-lived tracks so the expensive embedding/matching step runs once per
//! stability window instead of once per frame. Tracks carry no identity of
//! their own: a track that decays is gone, and a new detection at the same
//! spot starts a fresh track. Skipping embeddings is purely an optimization —
//! consumers get correct results if they embed every frame.

use crate::types::BoundingBox;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU for associating a detection with an existing track.
    pub iou_floor: f32,
    /// Fallback association: centroid distance as a fraction of the
    /// detection's larger side.
    pub centroid_radius: f32,
    /// Consecutive processed frames a track survives without a detection.
    pub miss_grace: u32,
    /// Embedding/matching runs every this many frames per persistent track.
    pub embed_interval: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_floor: 0.3,
            centroid_radius: 0.75,
            miss_grace: 5,
            embed_interval: 10,
        }
    }
}

#[derive(Debug)]
struct Track {
    id: u64,
    bbox: BoundingBox,
    misses: u32,
    /// Frames until the next embedding is due; 0 means due now.
    embed_countdown: u32,
}

/// A detection associated with its track for the current frame.
#[derive(Debug, Clone)]
pub struct TrackHit {
    pub track_id: u64,
    pub bbox: BoundingBox,
    /// True when this track's embedding window elapsed this frame.
    pub embed_due: bool,
}

/// Arena of short-lived face tracks.
pub struct FaceTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl FaceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 0,
        }
    }

    /// Number of live tracks.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop all tracks (e.g. after a stream reconnect).
    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    /// Feed one processed frame's detections; returns each detection with
    /// its track id and whether an embedding is due. Call with an empty
    /// slice on face-free frames so unmatched tracks decay.
    pub fn observe(&mut self, detections: &[BoundingBox]) -> Vec<TrackHit> {
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut hits = Vec::with_capacity(detections.len());

        for det in detections {
            let hit = match self.associate(det, &matched_tracks) {
                Some(track_idx) => {
                    matched_tracks[track_idx] = true;
                    let track = &mut self.tracks[track_idx];
                    track.bbox = det.clone();
                    track.misses = 0;

                    let embed_due = track.embed_countdown == 0;
                    if embed_due {
                        track.embed_countdown = self.config.embed_interval;
                    } else {
                        track.embed_countdown -= 1;
                    }

                    TrackHit {
                        track_id: track.id,
                        bbox: det.clone(),
                        embed_due,
                    }
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        bbox: det.clone(),
                        misses: 0,
                        embed_countdown: self.config.embed_interval,
                    });
                    matched_tracks.push(true);
                    tracing::debug!(track = id, "new face track");
                    // A fresh track embeds immediately.
                    TrackHit {
                        track_id: id,
                        bbox: det.clone(),
                        embed_due: true,
                    }
                }
            };
            hits.push(hit);
        }

        // Decay unmatched tracks and drop the expired ones.
        let grace = self.config.miss_grace;
        for (idx, track) in self.tracks.iter_mut().enumerate() {
            if !matched_tracks.get(idx).copied().unwrap_or(true) {
                track.misses += 1;
            }
        }
        self.tracks.retain(|t| {
            let keep = t.misses <= grace;
            if !keep {
                tracing::debug!(track = t.id, "face track expired");
            }
            keep
        });

        hits
    }

    /// Best unclaimed track for a detection: IoU first, centroid fallback.
    fn associate(&self, det: &BoundingBox, claimed: &[bool]) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (idx, track) in self.tracks.iter().enumerate() {
            if claimed[idx] {
                continue;
            }
            let overlap = track.bbox.iou(det);
            if overlap >= self.config.iou_floor {
                if best.map_or(true, |(_, b)| overlap > b) {
                    best = Some((idx, overlap));
                }
            }
        }
        if best.is_some() {
            return best.map(|(idx, _)| idx);
        }

        // No overlap: allow a small jump via centroid proximity.
        let radius = self.config.centroid_radius * det.width.max(det.height);
        let (dx_c, dy_c) = det.center();
        let mut nearest: Option<(usize, f32)> = None;
        for (idx, track) in self.tracks.iter().enumerate() {
            if claimed[idx] {
                continue;
            }
            let (tx, ty) = track.bbox.center();
            let dist = ((tx - dx_c).powi(2) + (ty - dy_c).powi(2)).sqrt();
            if dist <= radius && nearest.map_or(true, |(_, n)| dist < n) {
                nearest = Some((idx, dist));
            }
        }
        nearest.map(|(idx, _)| idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, size: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: size,
            height: size,
            confidence: 0.9,
            landmarks: None,
        }
    }

    fn tracker(interval: u32, grace: u32) -> FaceTracker {
        FaceTracker::new(TrackerConfig {
            iou_floor: 0.3,
            centroid_radius: 0.75,
            miss_grace: grace,
            embed_interval: interval,
        })
    }

    #[test]
    fn overlapping_detections_keep_their_track() {
        let mut t = tracker(10, 3);
        let first = t.observe(&[bbox(100.0, 100.0, 50.0)]);
        let second = t.observe(&[bbox(104.0, 102.0, 50.0)]);
        assert_eq!(first[0].track_id, second[0].track_id);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn new_track_embeds_immediately_then_waits_for_window() {
        let mut t = tracker(3, 3);
        let hits = t.observe(&[bbox(0.0, 0.0, 40.0)]);
        assert!(hits[0].embed_due);

        // Next `embed_interval` frames are not due, then due again.
        for _ in 0..3 {
            let hits = t.observe(&[bbox(0.0, 0.0, 40.0)]);
            assert!(!hits[0].embed_due);
        }
        let hits = t.observe(&[bbox(0.0, 0.0, 40.0)]);
        assert!(hits[0].embed_due);
    }

    #[test]
    fn track_survives_grace_then_expires() {
        let mut t = tracker(10, 2);
        let first = t.observe(&[bbox(50.0, 50.0, 40.0)]);
        let id = first[0].track_id;

        // Two empty frames: still within grace.
        t.observe(&[]);
        t.observe(&[]);
        assert_eq!(t.len(), 1);
        let back = t.observe(&[bbox(52.0, 50.0, 40.0)]);
        assert_eq!(back[0].track_id, id);

        // Beyond grace the track is gone and a new id is assigned.
        t.observe(&[]);
        t.observe(&[]);
        t.observe(&[]);
        assert!(t.is_empty());
        let fresh = t.observe(&[bbox(52.0, 50.0, 40.0)]);
        assert_ne!(fresh[0].track_id, id);
        assert!(fresh[0].embed_due);
    }

    #[test]
    fn centroid_fallback_bridges_fast_motion() {
        let mut t = tracker(10, 3);
        let first = t.observe(&[bbox(100.0, 100.0, 40.0)]);
        // Shifted beyond IoU overlap but within 0.75 * 40 of the centroid.
        let second = t.observe(&[bbox(125.0, 100.0, 40.0)]);
        assert_eq!(first[0].track_id, second[0].track_id);
    }

    #[test]
    fn distinct_faces_get_distinct_tracks() {
        let mut t = tracker(10, 3);
        let hits = t.observe(&[bbox(0.0, 0.0, 40.0), bbox(300.0, 0.0, 40.0)]);
        assert_eq!(t.len(), 2);
        assert_ne!(hits[0].track_id, hits[1].track_id);

        // Both persist independently.
        let hits = t.observe(&[bbox(2.0, 0.0, 40.0), bbox(302.0, 0.0, 40.0)]);
        assert_ne!(hits[0].track_id, hits[1].track_id);
    }

    #[test]
    fn clear_drops_everything() {
        let mut t = tracker(10, 3);
        t.observe(&[bbox(0.0, 0.0, 40.0)]);
        t.clear();
        assert!(t.is_empty());
    }
}
