use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

mod buffer;
mod camera_loop;
mod clip;
mod config;
mod control;
mod database;
mod detector;
mod errors;
mod finalizer;
mod frame;
mod mqtt;
mod notifier;
mod presence;
mod processing;
mod recorder;
mod recording;
mod registry;
mod signal;
mod source;
mod supervisor;
mod transcoder;
mod utils;
#[cfg(test)]
mod test_support;

use camera_loop::{LoopSettings, PipelineContext};
use clip::MjpegClipStore;
use config::Config;
use database::{RecordingQuery, RecordingStore, SqliteRecordingStore};
use detector::{Detector, DetectorPool, HttpDetector};
use finalizer::Finalizer;
use mqtt::MqttPublisher;
use notifier::{BroadcastNotifier, Event, Notifier, NotifierSet};
use presence::CsvDetectionLog;
use processing::{ModeSwitch, ProcessingMode};
use recorder::{RecorderContext, RecorderSettings};
use registry::DirectoryRegistry;
use source::FfmpegSource;
use supervisor::Supervisor;
use transcoder::{FfmpegTranscoder, Transcoder};

#[derive(Parser, Debug)]
#[command(name = "vigilnet", about = "Multi-camera supervisor with detection-triggered recording")]
struct Args {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Processing mode at startup, overrides the configuration
    #[arg(long, value_enum)]
    mode: Option<ProcessingMode>,

    /// Print stored recordings and exit
    #[arg(long)]
    list_recordings: bool,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vigilnet=debug,info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Log what the core publishes; previews are too chatty for anything above trace
fn spawn_event_logger(notifier: &BroadcastNotifier) {
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::Preview { .. }) => {}
                Ok(Event::FeedStatus { camera_id, status }) => debug!("[{}] feed {}", camera_id, status),
                Ok(Event::Recording { camera_id, status }) => info!("[{}] recording {:?}", camera_id, status),
                Ok(Event::RecordingSaved { camera_id, recording_id, file_path }) => {
                    info!("[{}] recording {} saved to {}", camera_id, recording_id, file_path)
                }
                Ok(Event::DetectionLog(entry)) => info!(
                    "[{}] {} detected ({:.2}) in frame {}",
                    entry.camera_id, entry.label, entry.confidence, entry.frame_id
                ),
                Err(RecvError::Lagged(skipped)) => debug!("Event logger skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Periodically log what every running camera is doing
fn spawn_status_heartbeat(supervisor: Arc<Supervisor>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for camera_id in supervisor.running_cameras().await {
                if let Some(snapshot) = supervisor.snapshot(&camera_id).await {
                    info!(
                        "[{}] feed {:?}, recording {:?}, {} frames processed, {} buffered, streaks {}/{}",
                        camera_id,
                        snapshot.feed_status,
                        snapshot.recording_phase,
                        snapshot.frames_processed,
                        snapshot.buffered_frames,
                        snapshot.detection_streak,
                        snapshot.no_detection_streak
                    );
                }
            }
        }
    });
}

async fn list_recordings(store: &dyn RecordingStore) -> Result<()> {
    let recordings = store.list_recordings(&RecordingQuery::default()).await?;
    if recordings.is_empty() {
        println!("No recordings");
    }
    for recording in recordings {
        println!(
            "{:>6}  camera {:<12} {} -> {}  {}",
            recording.id,
            recording.camera_id,
            recording.start_time.format("%Y-%m-%d %H:%M:%S"),
            recording.end_time.format("%H:%M:%S"),
            recording.file_path
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {} ({}), using default configuration", args.config, e);
        Config::default()
    });

    let store = Arc::new(SqliteRecordingStore::new(&config.recording.database_path).await?);
    store.initialize().await?;

    if args.list_recordings {
        return list_recordings(store.as_ref()).await;
    }

    let mode = args.mode.unwrap_or(config.processing.mode);
    info!("Processing mode: {}", mode);
    let modes = ModeSwitch::new(mode);
    if let Err(e) = control::watch_config_mode(&args.config, modes.clone()) {
        error!("Runtime mode changes from {} disabled: {}", args.config, e);
    }

    let broadcast = BroadcastNotifier::new(1024);
    spawn_event_logger(&broadcast);
    let mut notifiers = NotifierSet::new().with(Arc::new(broadcast.clone()));

    if let Some(mqtt_config) = config.mqtt.clone().filter(|m| m.enabled) {
        match MqttPublisher::new(mqtt_config) {
            Ok(publisher) => notifiers = notifiers.with(Arc::new(publisher.start(modes.clone()))),
            Err(e) => error!("Failed to initialize MQTT: {}", e),
        }
    }
    if !config.processing.detection_log.is_empty() {
        let (csv_log, _) = CsvDetectionLog::spawn(&config.processing.detection_log);
        info!("Writing detections to {}", config.processing.detection_log);
        notifiers = notifiers.with(Arc::new(csv_log));
    }
    info!("Publishing events to {} notifiers", notifiers.len());
    let notifier: Arc<dyn Notifier> = Arc::new(notifiers);

    let detector_config = config.detector.clone();
    let detectors = DetectorPool::from_factory(config.detector.pool_size, |_| {
        Ok(Box::new(HttpDetector::new(&detector_config)?) as Box<dyn Detector>)
    })?;
    info!("Detector pool ready with {} workers", detectors.size());

    let transcoder: Option<Arc<dyn Transcoder>> = if config.transcoding.enabled {
        Some(Arc::new(FfmpegTranscoder::new(&config.transcoding, config.recording.recording_fps)))
    } else {
        info!("Transcoding disabled, raw clips will be kept");
        None
    };
    let finalizer = Finalizer::new(transcoder, store.clone(), notifier.clone());

    let ctx = Arc::new(PipelineContext {
        source: Arc::new(FfmpegSource::new(config.stream.clone())),
        detectors: Arc::new(detectors),
        notifier,
        recorder: RecorderContext {
            clip_store: Arc::new(MjpegClipStore::new(&config.recording.output_dir)),
            finalizer: finalizer.clone(),
            settings: RecorderSettings::from_config(&config.recording),
        },
        modes,
        settings: LoopSettings::from_config(&config),
    });
    let supervisor = Arc::new(Supervisor::new(ctx));

    let registry = DirectoryRegistry::new(&config.cameras_directory);
    let started = supervisor.start_from_registry(&registry).await?;
    info!("Started {} cameras from '{}'", started, config.cameras_directory);

    spawn_status_heartbeat(supervisor.clone(), Duration::from_secs(60));

    match registry.watch() {
        Ok(events) => {
            tokio::spawn(supervisor.clone().follow_registry(events));
        }
        Err(e) => error!("Camera directory watching disabled: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping cameras");

    supervisor.stop_all().await;
    finalizer.flush().await;
    info!("All recordings saved, exiting");

    Ok(())
}
