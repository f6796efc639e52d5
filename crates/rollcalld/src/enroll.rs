//! Guided multi-pose enrollment capture.
//!
//! While armed, the pipeline routes detected faces here instead of the
//! decision engine. The student is walked through seven pose stages; each
//! stage needs a number of quality-gated frames, and a completed stage
//! contributes the mean of its embeddings as one face signature. State is
//! ephemeral: it lives for one capture attempt and is discarded on
//! completion, reset or abandonment.

use rollcall_core::{BoundingBox, Embedding, FaceSignature};
use rollcall_hw::Frame;
use serde::Serialize;

/// One guided pose stage.
pub struct Stage {
    pub name: &'static str,
    pub instruction: &'static str,
}

pub static STAGES: [Stage; 7] = [
    Stage { name: "center", instruction: "Look straight at the camera" },
    Stage { name: "left", instruction: "Turn your head slightly to the left" },
    Stage { name: "right", instruction: "Turn your head slightly to the right" },
    Stage { name: "up", instruction: "Tilt your chin up slightly" },
    Stage { name: "down", instruction: "Look slightly downward" },
    Stage { name: "smile", instruction: "Give a natural smile" },
    Stage { name: "neutral", instruction: "Relax your face" },
];

// Quality gates, tuned for ordinary webcams and classroom lighting.
const MIN_BRIGHTNESS: f32 = 40.0;
const MAX_BRIGHTNESS: f32 = 220.0;
const MIN_SHARPNESS: f32 = 5.0;
/// Face width must cover at least this fraction of the frame width.
const MIN_FACE_RATIO: f32 = 0.15;
/// Face center must fall inside the central band of the frame.
const CENTER_BAND_LOW: f32 = 0.2;
const CENTER_BAND_HIGH: f32 = 0.8;

// Pose thresholds on the 5-point landmarks.
const YAW_CENTER_MAX: f32 = 0.20;
const YAW_TURN_MIN: f32 = 0.03;
const PITCH_UP_MAX: f32 = 0.50;
const PITCH_DOWN_MIN: f32 = 0.70;
const SMILE_WIDTH_MIN: f32 = 0.85;

/// Poll-friendly progress snapshot for the enrollment UI.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub armed: bool,
    pub stage_index: usize,
    pub total_stages: usize,
    pub stage_name: String,
    pub instruction: String,
    pub frames_captured: u32,
    pub frames_needed: u32,
    pub percent: u8,
    pub is_complete: bool,
    /// Latest per-frame guidance ("Move closer...", "Hold still...").
    pub feedback: String,
}

pub struct EnrollmentCapture {
    frames_per_stage: u32,
    armed: bool,
    stage_index: usize,
    frames_in_stage: u32,
    stage_samples: Vec<Embedding>,
    signatures: Vec<FaceSignature>,
    complete: bool,
    last_feedback: String,
}

impl EnrollmentCapture {
    pub fn new(frames_per_stage: u32) -> Self {
        Self {
            frames_per_stage: frames_per_stage.max(1),
            armed: false,
            stage_index: 0,
            frames_in_stage: 0,
            stage_samples: Vec::new(),
            signatures: Vec::new(),
            complete: false,
            last_feedback: String::new(),
        }
    }

    /// Arm a fresh capture attempt, discarding any previous progress.
    pub fn begin(&mut self) {
        self.reset();
        self.armed = true;
        tracing::info!("enrollment capture armed");
    }

    /// Discard all progress and return to stage 0 (stays armed if it was).
    pub fn reset(&mut self) {
        self.stage_index = 0;
        self.frames_in_stage = 0;
        self.stage_samples.clear();
        self.signatures.clear();
        self.complete = false;
        self.last_feedback.clear();
    }

    /// Record the guidance line for the polling client.
    pub fn note_feedback(&mut self, feedback: impl Into<String>) {
        self.last_feedback = feedback.into();
    }

    /// Disarm and discard.
    pub fn abandon(&mut self) {
        self.reset();
        self.armed = false;
        tracing::info!("enrollment capture abandoned");
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn current_stage(&self) -> &'static Stage {
        &STAGES[self.stage_index.min(STAGES.len() - 1)]
    }

    /// Run the quality gates on a candidate frame. `Ok(())` means the
    /// caller should compute the embedding and [`accept`](Self::accept) it;
    /// `Err` carries the feedback line shown to the student.
    pub fn evaluate(&self, frame: &Frame, faces: &[BoundingBox]) -> Result<(), String> {
        if self.complete {
            return Err("Capture complete!".to_string());
        }

        let brightness = frame.avg_brightness();
        if brightness < MIN_BRIGHTNESS {
            return Err("Too dark - please improve lighting".to_string());
        }
        if brightness > MAX_BRIGHTNESS {
            return Err("Too bright - reduce lighting".to_string());
        }

        let face = match faces {
            [] => return Err("No face detected - please face the camera".to_string()),
            [face] => face,
            _ => return Err("Multiple faces detected - only one person please".to_string()),
        };

        validate_position(face, frame.width as f32, frame.height as f32)?;

        if frame.laplacian_variance() < MIN_SHARPNESS {
            return Err("Image is blurry - hold still".to_string());
        }

        if let Some(landmarks) = &face.landmarks {
            validate_pose(landmarks, self.current_stage().name)?;
        }

        Ok(())
    }

    /// Count one accepted frame's embedding toward the current stage,
    /// folding the stage into a signature when it fills up.
    pub fn accept(&mut self, embedding: Embedding) {
        if self.complete {
            return;
        }

        self.stage_samples.push(embedding);
        self.frames_in_stage += 1;

        if self.frames_in_stage >= self.frames_per_stage {
            if let Some(mean) = Embedding::mean_of(&self.stage_samples) {
                self.signatures.push(FaceSignature {
                    pose: self.current_stage().name.to_string(),
                    embedding: mean,
                });
            }
            self.stage_samples.clear();
            self.frames_in_stage = 0;
            self.stage_index += 1;

            if self.stage_index >= STAGES.len() {
                self.complete = true;
                tracing::info!(signatures = self.signatures.len(), "enrollment capture complete");
            } else {
                tracing::debug!(stage = self.current_stage().name, "enrollment stage advanced");
            }
        }
    }

    /// Hand out the accumulated signature set once complete, disarming and
    /// clearing state. Returns None while capture is still in progress.
    pub fn take_signatures(&mut self) -> Option<Vec<FaceSignature>> {
        if !self.complete {
            return None;
        }
        let signatures = std::mem::take(&mut self.signatures);
        self.abandon();
        Some(signatures)
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let total_needed = STAGES.len() as u32 * self.frames_per_stage;
        let captured = self.stage_index as u32 * self.frames_per_stage + self.frames_in_stage;
        let stage = self.current_stage();
        ProgressSnapshot {
            armed: self.armed,
            stage_index: self.stage_index.min(STAGES.len()),
            total_stages: STAGES.len(),
            stage_name: stage.name.to_string(),
            instruction: if self.complete {
                "Face capture complete!".to_string()
            } else {
                stage.instruction.to_string()
            },
            frames_captured: self.frames_in_stage,
            frames_needed: self.frames_per_stage,
            percent: ((captured.min(total_needed) * 100) / total_needed) as u8,
            is_complete: self.complete,
            feedback: self.last_feedback.clone(),
        }
    }
}

fn validate_position(face: &BoundingBox, frame_w: f32, frame_h: f32) -> Result<(), String> {
    if face.width / frame_w < MIN_FACE_RATIO {
        return Err("Move closer to the camera".to_string());
    }

    let (cx, cy) = face.center();
    if cx < frame_w * CENTER_BAND_LOW {
        return Err("Move to the right".to_string());
    }
    if cx > frame_w * CENTER_BAND_HIGH {
        return Err("Move to the left".to_string());
    }
    if cy < frame_h * CENTER_BAND_LOW {
        return Err("Move down".to_string());
    }
    if cy > frame_h * CENTER_BAND_HIGH {
        return Err("Move up".to_string());
    }
    Ok(())
}

/// Pose check from the 5-point landmarks: yaw from the nose's horizontal
/// offset against the eye midpoint, pitch from the nose's vertical position
/// between the eye line and the mouth line.
fn validate_pose(landmarks: &[(f32, f32); 5], stage_name: &str) -> Result<(), String> {
    let [left_eye, right_eye, nose, left_mouth, right_mouth] = landmarks;

    let eyes_mid_x = (left_eye.0 + right_eye.0) / 2.0;
    let eyes_mid_y = (left_eye.1 + right_eye.1) / 2.0;
    let eye_dist = ((right_eye.0 - left_eye.0).powi(2) + (right_eye.1 - left_eye.1).powi(2)).sqrt();
    if eye_dist < 1.0 {
        return Err("Face the camera directly".to_string());
    }

    let yaw = (nose.0 - eyes_mid_x) / eye_dist;
    let mouth_mid_y = (left_mouth.1 + right_mouth.1) / 2.0;
    let face_drop = mouth_mid_y - eyes_mid_y;
    let pitch = if face_drop > 1.0 {
        (nose.1 - eyes_mid_y) / face_drop
    } else {
        0.6 // degenerate geometry: treat as neutral pitch
    };

    match stage_name {
        "center" | "neutral" => {
            if yaw.abs() > YAW_CENTER_MAX {
                let side = if yaw > 0.0 { "left" } else { "right" };
                return Err(format!("Face straight ahead (turn slightly {side})"));
            }
        }
        "left" => {
            if yaw > -YAW_TURN_MIN {
                return Err("Turn head slightly left".to_string());
            }
        }
        "right" => {
            if yaw < YAW_TURN_MIN {
                return Err("Turn head slightly right".to_string());
            }
        }
        "up" => {
            if pitch > PITCH_UP_MAX {
                return Err("Tilt chin up slightly".to_string());
            }
        }
        "down" => {
            if pitch < PITCH_DOWN_MIN {
                return Err("Look down slightly".to_string());
            }
        }
        "smile" => {
            let mouth_width = ((right_mouth.0 - left_mouth.0).powi(2)
                + (right_mouth.1 - left_mouth.1).powi(2))
            .sqrt();
            if mouth_width / eye_dist < SMILE_WIDTH_MIN {
                return Err("Please smile!".to_string());
            }
        }
        _ => {}
    }
    Ok(())
}
