//! Background capture pipeline.
//!
//! One dedicated OS thread runs the continuous loop: pull frame → skip-factor
//! gate → downscaled proposal pass → full detection → track association →
//! per-due-track embedding and matching → decision engine (or the enrollment
//! controller while a capture is armed) → annotated preview publish. Control
//! messages arrive on an mpsc channel drained between frames; stream failures
//! back off without blocking control.

use crate::attendance::AttendanceEngine;
use crate::enroll::EnrollmentCapture;
use crate::storage::Storage;
use chrono::Utc;
use rollcall_core::{
    BoundingBox, FaceDetector, FaceEmbedder, FaceTracker, GalleryEntry, Matcher, NearestMatcher,
    TrackerConfig,
};
use rollcall_hw::{Backoff, Frame, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Messages from the control surface to the pipeline thread.
enum PipelineCommand {
    /// Re-read the enrolled gallery from storage (after enrollment commits,
    /// student renames, deletions).
    ReloadGallery,
    Shutdown,
}

/// State the pipeline shares with the D-Bus surface.
pub struct PipelineShared {
    /// Latest annotated preview frame as JPEG; the web layer re-serves this
    /// as its multipart stream.
    preview: Mutex<Option<Vec<u8>>>,
    /// False while the frame source is failing; drives the camera-error
    /// placeholder and the degraded-health status.
    stream_healthy: AtomicBool,
}

impl PipelineShared {
    pub fn new() -> Self {
        Self {
            preview: Mutex::new(None),
            stream_healthy: AtomicBool::new(false),
        }
    }

    pub fn latest_preview(&self) -> Option<Vec<u8>> {
        self.preview.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stream_healthy(&self) -> bool {
        self.stream_healthy.load(Ordering::Relaxed)
    }

    fn publish_preview(&self, jpeg: Vec<u8>) {
        *self.preview.lock().unwrap_or_else(|e| e.into_inner()) = Some(jpeg);
    }
}

/// Clone-safe handle to the pipeline thread.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineCommand>,
}

impl PipelineHandle {
    pub async fn reload_gallery(&self) {
        let _ = self.tx.send(PipelineCommand::ReloadGallery).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(PipelineCommand::Shutdown).await;
    }
}

/// Loop tuning knobs, lifted from [`crate::config::Config`].
pub struct PipelineOptions {
    pub frame_skip: u32,
    pub detection_scale: f32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub tracker: TrackerConfig,
}

/// Everything the worker owns or shares.
pub struct PipelineParts {
    pub source: Box<dyn FrameSource>,
    pub detector: FaceDetector,
    pub embedder: FaceEmbedder,
    pub matcher: NearestMatcher,
    pub storage: Arc<Storage>,
    pub attendance: Arc<AttendanceEngine>,
    pub enrollment: Arc<Mutex<EnrollmentCapture>>,
    pub shared: Arc<PipelineShared>,
    pub options: PipelineOptions,
}

/// Spawn the pipeline on a dedicated OS thread and return its handle.
pub fn spawn_pipeline(parts: PipelineParts) -> PipelineHandle {
    let (tx, rx) = mpsc::channel::<PipelineCommand>(8);

    std::thread::Builder::new()
        .name("rollcall-pipeline".into())
        .spawn(move || run_pipeline(parts, rx))
        .expect("failed to spawn pipeline thread");

    PipelineHandle { tx }
}

fn run_pipeline(mut parts: PipelineParts, mut rx: mpsc::Receiver<PipelineCommand>) {
    tracing::info!(source = %parts.source.describe(), "pipeline thread started");

    let mut tracker = FaceTracker::new(parts.options.tracker.clone());
    let mut backoff = Backoff::new(parts.options.backoff_base, parts.options.backoff_max);
    let mut gallery = load_gallery(&parts.storage);
    let mut frame_counter: u64 = 0;

    loop {
        // Drain control messages between frames.
        loop {
            match rx.try_recv() {
                Ok(PipelineCommand::ReloadGallery) => gallery = load_gallery(&parts.storage),
                Ok(PipelineCommand::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    tracing::info!("pipeline thread exiting");
                    return;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        let frame = match parts.source.next_frame() {
            Ok(frame) => {
                backoff.reset();
                parts.shared.stream_healthy.store(true, Ordering::Relaxed);
                frame
            }
            Err(e) => {
                parts.shared.stream_healthy.store(false, Ordering::Relaxed);
                let delay = backoff.next_delay();
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "frame pull failed, backing off");
                // Tracks cannot survive an outage of unknown length.
                tracker.clear();
                std::thread::sleep(delay);
                continue;
            }
        };

        frame_counter += 1;
        if !should_process(frame_counter, parts.options.frame_skip) {
            continue;
        }

        // Cheap proposal pass on the downscaled copy gates the full pass.
        let down = frame.downscaled(parts.options.detection_scale);
        let proposals = match parts.detector.propose(&down.data, down.width, down.height) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "proposal detection failed");
                continue;
            }
        };

        let faces = if proposals.is_empty() {
            Vec::new()
        } else {
            match parts.detector.detect(&frame.data, frame.width, frame.height) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(error = %e, "verification detection failed");
                    continue;
                }
            }
        };

        let hits = tracker.observe(&faces);

        let enrolling = parts
            .enrollment
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_armed();

        if enrolling {
            process_enrollment_frame(&mut parts, &frame, &faces);
        } else {
            let now = Utc::now();
            for hit in &hits {
                if !hit.embed_due {
                    continue;
                }
                let embedding = match parts.embedder.extract(
                    &frame.data,
                    frame.width,
                    frame.height,
                    &hit.bbox,
                ) {
                    Ok(embedding) => embedding,
                    Err(e) => {
                        tracing::debug!(track = hit.track_id, error = %e, "embedding failed");
                        continue;
                    }
                };
                let outcome = parts.matcher.identify(&embedding, &gallery);
                parts.attendance.on_outcome(&outcome, now);
            }
        }

        publish_preview(&parts.shared, &frame, &faces);
    }
}

/// Route one frame into the armed enrollment capture.
fn process_enrollment_frame(parts: &mut PipelineParts, frame: &Frame, faces: &[BoundingBox]) {
    let verdict = {
        let enrollment = parts.enrollment.lock().unwrap_or_else(|e| e.into_inner());
        enrollment.evaluate(frame, faces)
    };

    match verdict {
        Ok(()) => {
            // Gates passed: the single face is at index 0.
            match parts
                .embedder
                .extract(&frame.data, frame.width, frame.height, &faces[0])
            {
                Ok(embedding) => {
                    let mut enrollment =
                        parts.enrollment.lock().unwrap_or_else(|e| e.into_inner());
                    enrollment.accept(embedding);
                    enrollment.note_feedback("Hold still...");
                }
                Err(e) => tracing::debug!(error = %e, "enrollment embedding failed"),
            }
        }
        Err(feedback) => {
            parts
                .enrollment
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .note_feedback(feedback);
        }
    }
}

fn load_gallery(storage: &Storage) -> Vec<GalleryEntry> {
    match storage.load_gallery() {
        Ok(gallery) => {
            tracing::info!(students = gallery.len(), "gallery loaded");
            gallery
        }
        Err(e) => {
            tracing::error!(error = %e, "gallery load failed, matching disabled until reload");
            Vec::new()
        }
    }
}

/// Process every Nth delivered frame; a skip factor of 0 or 1 processes all.
fn should_process(counter: u64, frame_skip: u32) -> bool {
    if frame_skip <= 1 {
        return true;
    }
    counter % frame_skip as u64 == 0
}

fn publish_preview(shared: &PipelineShared, frame: &Frame, faces: &[BoundingBox]) {
    use image::ImageEncoder;

    let mut annotated = frame.data.clone();
    for face in faces {
        draw_box(&mut annotated, frame.width, frame.height, face);
    }

    let mut jpeg = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 75);
    match encoder.write_image(
        &annotated,
        frame.width,
        frame.height,
        image::ExtendedColorType::L8,
    ) {
        Ok(()) => shared.publish_preview(jpeg),
        Err(e) => tracing::debug!(error = %e, "preview encode failed"),
    }
}

/// Draw a 2px white rectangle outline onto a luma buffer.
fn draw_box(data: &mut [u8], width: u32, height: u32, bbox: &BoundingBox) {
    let w = width as i32;
    let h = height as i32;
    let x0 = bbox.x as i32;
    let y0 = bbox.y as i32;
    let x1 = (bbox.x + bbox.width) as i32;
    let y1 = (bbox.y + bbox.height) as i32;

    let mut put = |x: i32, y: i32| {
        if x >= 0 && x < w && y >= 0 && y < h {
            data[(y * w + x) as usize] = 255;
        }
    };

    for x in x0..=x1 {
        for t in 0..2 {
            put(x, y0 + t);
            put(x, y1 - t);
        }
    }
    for y in y0..=y1 {
        for t in 0..2 {
            put(x0 + t, y);
            put(x1 - t, y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_factor_gates_frames() {
        // Skip of 2: every second frame.
        let processed: Vec<u64> = (1..=6).filter(|&c| should_process(c, 2)).collect();
        assert_eq!(processed, vec![2, 4, 6]);

        // 0 and 1 process everything.
        assert!((1..=4).all(|c| should_process(c, 0)));
        assert!((1..=4).all(|c| should_process(c, 1)));
    }

    #[test]
    fn draw_box_stays_in_bounds() {
        let mut data = vec![0u8; 20 * 20];
        let bbox = BoundingBox {
            x: -5.0,
            y: 15.0,
            width: 40.0,
            height: 40.0,
            confidence: 1.0,
            landmarks: None,
        };
        draw_box(&mut data, 20, 20, &bbox);
        // Top edge row inside the frame is painted; nothing panicked.
        assert!(data[15 * 20].max(data[15 * 20 + 10]) == 255);
    }

    #[test]
    fn preview_slot_roundtrip() {
        let shared = PipelineShared::new();
        assert!(shared.latest_preview().is_none());
        assert!(!shared.stream_healthy());

        shared.publish_preview(vec![1, 2, 3]);
        assert_eq!(shared.latest_preview().unwrap(), vec![1, 2, 3]);
    }
}
