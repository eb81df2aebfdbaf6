use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clip::{ClipStore, ClipWriter, FinishedClip};
use crate::config::RecordingConfig;
use crate::finalizer::Finalizer;
use crate::frame::Frame;
use crate::signal::StopSignal;
use crate::utils::frame_interval;

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub fps: f32,
    pub min_duration: Duration,
    pub live_queue_size: usize,
}

impl RecorderSettings {
    pub fn from_config(config: &RecordingConfig) -> Self {
        Self {
            fps: config.recording_fps,
            min_duration: config.min_duration,
            live_queue_size: config.live_queue_size,
        }
    }
}

/// Everything a recorder needs besides its frames
#[derive(Clone)]
pub struct RecorderContext {
    pub clip_store: Arc<dyn ClipStore>,
    pub finalizer: Finalizer,
    pub settings: RecorderSettings,
}

/// Owner-side handle of one running recorder task
pub struct RecorderHandle {
    stop: StopSignal,
    live_tx: mpsc::Sender<Frame>,
    pub(crate) task: JoinHandle<Option<FinishedClip>>,
}

impl RecorderHandle {
    /// Queue a live frame without waiting. Returns false when the frame was dropped.
    pub fn feed(&self, frame: Frame) -> bool {
        match self.live_tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!("Recorder queue full, dropping frame {}", frame.frame_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn stop(&self) -> bool {
        self.stop.trigger()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start a recorder that writes `snapshot` first, then live frames, until it is
/// stopped and has been running for at least the minimum duration.
pub fn spawn(camera_id: &str, snapshot: Vec<Frame>, ctx: RecorderContext) -> RecorderHandle {
    let stop = StopSignal::new();
    let (live_tx, live_rx) = mpsc::channel(ctx.settings.live_queue_size.max(1));

    let recorder = Recorder {
        camera_id: camera_id.to_string(),
        stop: stop.clone(),
        live_rx,
        ctx,
    };
    let task = tokio::spawn(recorder.run(snapshot));

    RecorderHandle { stop, live_tx, task }
}

struct Recorder {
    camera_id: String,
    stop: StopSignal,
    live_rx: mpsc::Receiver<Frame>,
    ctx: RecorderContext,
}

impl Recorder {
    async fn write(&self, writer: &mut Box<dyn ClipWriter>, frame: &Frame, written: &mut u64) {
        match writer.write_frame(frame).await {
            Ok(()) => *written += 1,
            Err(e) => warn!("[{}] Dropping frame {} from recording: {}", self.camera_id, frame.frame_id, e),
        }
    }

    async fn run(mut self, snapshot: Vec<Frame>) -> Option<FinishedClip> {
        let started = Instant::now();
        let start_time = snapshot.first().map(|f| f.captured_at).unwrap_or_else(Utc::now);

        let mut writer = match self.ctx.clip_store.create(&self.camera_id, start_time).await {
            Ok(writer) => writer,
            Err(e) => {
                error!("[{}] Could not open clip for recording: {}", self.camera_id, e);
                return None;
            }
        };
        info!("[{}] Recording to {} ({} buffered frames)", self.camera_id, writer.path().display(), snapshot.len());

        let mut written = 0u64;
        for frame in &snapshot {
            self.write(&mut writer, frame, &mut written).await;
        }
        let mut last_frame = snapshot.last().cloned();
        drop(snapshot);

        let min_duration = self.ctx.settings.min_duration;
        let mut ticker = tokio::time::interval(frame_interval(self.ctx.settings.fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut fresh_since_tick = false;
        let mut live_open = true;

        loop {
            if self.stop.is_set() && started.elapsed() >= min_duration {
                break;
            }

            tokio::select! {
                biased;
                frame = self.live_rx.recv(), if live_open => match frame {
                    Some(frame) => {
                        self.write(&mut writer, &frame, &mut written).await;
                        last_frame = Some(frame);
                        fresh_since_tick = true;
                    }
                    None => live_open = false,
                },
                _ = ticker.tick() => {
                    // While draining, hold the last frame so the clip keeps its pace
                    if self.stop.is_set() && !fresh_since_tick {
                        if let Some(frame) = last_frame.clone() {
                            self.write(&mut writer, &frame, &mut written).await;
                        }
                    }
                    fresh_since_tick = false;
                }
                _ = self.stop.wait(), if !self.stop.is_set() => {
                    debug!("[{}] Recorder draining, {:?} recorded so far", self.camera_id, started.elapsed());
                }
            }
        }

        if let Err(e) = writer.finish().await {
            warn!("[{}] Failed to finish clip {}: {}", self.camera_id, writer.path().display(), e);
        }

        let clip = FinishedClip {
            camera_id: self.camera_id.clone(),
            path: writer.path(),
            start_time,
            end_time: Utc::now(),
            frame_count: written,
        };
        info!(
            "[{}] Recording finished: {} frames over {:?}",
            self.camera_id, written, started.elapsed()
        );

        if written == 0 {
            warn!("[{}] Recording {} has no frames, not saving it", self.camera_id, clip.path.display());
            return None;
        }

        self.ctx.finalizer.submit(clip.clone()).await;
        Some(clip)
    }
}
