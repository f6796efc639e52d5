use anyhow::{Context, Result};
use rollcall_core::{FaceDetector, FaceEmbedder, NearestMatcher, TrackerConfig};
use rollcall_hw::{CameraSource, FrameSource, MjpegSource, NotifierClient, StreamConfig};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod engine;
mod enroll;
mod notify;
mod service;
mod session;
mod storage;

use attendance::AttendanceEngine;
use config::{Config, FrameOrigin};
use engine::{spawn_pipeline, PipelineOptions, PipelineParts, PipelineShared};
use enroll::EnrollmentCapture;
use service::AttendanceService;
use session::SessionController;
use storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::from_env();

    let storage = Arc::new(Storage::open(&config.db_path).context("open attendance database")?);
    tracing::info!(path = %config.db_path.display(), "database ready");

    let sessions = Arc::new(SessionController::new(Arc::clone(&storage))?);

    // Hardware feedback queue: decision engine → notifier worker.
    let (notify_tx, notify_rx) = tokio::sync::mpsc::channel(16);
    let notifier_client = config.notifier_url.as_deref().map(|url| {
        tracing::info!(url, "hardware notifier configured");
        NotifierClient::new(url, config.notify_timeout)
    });
    notify::spawn_notifier(notifier_client, notify_rx);

    let attendance = Arc::new(AttendanceEngine::new(
        Arc::clone(&storage),
        Arc::clone(&sessions),
        notify_tx,
    ));

    // Recognition models load synchronously: fail fast if anything is missing.
    let detector = FaceDetector::load(
        &config.proposal_model_path(),
        &config.verify_model_path(),
    )?;
    let embedder = FaceEmbedder::load(&config.arcface_model_path())?;
    let matcher = NearestMatcher {
        metric: config.match_metric,
        threshold: config.match_threshold,
        ambiguity_margin: config.ambiguity_margin,
    };

    let source: Box<dyn FrameSource> = match config.source {
        FrameOrigin::Stream => Box::new(MjpegSource::new(StreamConfig {
            url: config.stream_url.clone(),
            read_timeout: config.stream_timeout,
            ..Default::default()
        })?),
        FrameOrigin::Local => Box::new(CameraSource::open(&config.camera_device)?),
    };
    tracing::info!(source = %source.describe(), "frame source ready");

    let enrollment = Arc::new(Mutex::new(EnrollmentCapture::new(
        config.enroll_frames_per_stage,
    )));
    let shared = Arc::new(PipelineShared::new());

    let pipeline = spawn_pipeline(PipelineParts {
        source,
        detector,
        embedder,
        matcher,
        storage: Arc::clone(&storage),
        attendance: Arc::clone(&attendance),
        enrollment: Arc::clone(&enrollment),
        shared: Arc::clone(&shared),
        options: PipelineOptions {
            frame_skip: config.frame_skip,
            detection_scale: config.detection_scale,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            tracker: TrackerConfig {
                embed_interval: config.embed_interval,
                miss_grace: config.track_miss_grace,
                ..Default::default()
            },
        },
    });

    let service = AttendanceService {
        storage,
        sessions,
        attendance,
        enrollment,
        shared,
        pipeline: pipeline.clone(),
        default_late_after: config.late_after_minutes,
    };

    let _connection = zbus::connection::Builder::session()
        .context("connect to session bus")?
        .name("org.rollcall.Attendance1")?
        .serve_at("/org/rollcall/Attendance1", service)?
        .build()
        .await
        .context("register D-Bus service")?;

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    pipeline.shutdown().await;

    Ok(())
}
