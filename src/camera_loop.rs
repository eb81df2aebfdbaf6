use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::RollingBuffer;
use crate::config::Config;
use crate::detector::DetectorPool;
use crate::errors::Result;
use crate::frame::{DetectionResult, Frame};
use crate::notifier::{Event, FeedStatus, Notifier};
use crate::presence::PresenceTracker;
use crate::processing::{annotate, ModeSwitch, MotionMask, ProcessingMode};
use crate::recorder::RecorderContext;
use crate::recording::{RecordingPhase, RecordingSession};
use crate::signal::StopSignal;
use crate::source::{FrameSource, FrameStream};
use crate::utils::frame_interval;

/// Tunables of one ingestion loop, resolved from configuration once
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub target_fps: f32,
    pub reconnect_interval: Duration,
    pub max_failed_reads: u32,
    pub failed_read_backoff: Duration,
    pub preview_interval: Duration,
    pub absence_window: Duration,
    pub start_threshold: u32,
    pub stop_threshold: u32,
    pub buffer_capacity: usize,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_fps: config.processing.target_fps,
            reconnect_interval: config.stream.reconnect_interval,
            max_failed_reads: config.stream.max_failed_reads,
            failed_read_backoff: config.stream.failed_read_backoff,
            preview_interval: config.processing.preview_interval,
            absence_window: config.processing.presence_absence_window,
            start_threshold: config.recording.start_threshold,
            stop_threshold: config.recording.stop_threshold,
            buffer_capacity: config.recording.buffer_capacity(),
        }
    }
}

/// Shared collaborators handed to every camera loop
pub struct PipelineContext {
    pub source: Arc<dyn FrameSource>,
    pub detectors: Arc<DetectorPool>,
    pub notifier: Arc<dyn Notifier>,
    pub recorder: RecorderContext,
    pub modes: ModeSwitch,
    pub settings: LoopSettings,
}

/// Point-in-time view of one camera, published on every change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraSnapshot {
    pub feed_status: FeedStatus,
    pub recording_phase: RecordingPhase,
    pub detection_streak: u32,
    pub no_detection_streak: u32,
    pub buffered_frames: usize,
    pub frames_processed: u64,
}

impl Default for CameraSnapshot {
    fn default() -> Self {
        Self {
            feed_status: FeedStatus::Connecting,
            recording_phase: RecordingPhase::Idle,
            detection_streak: 0,
            no_detection_streak: 0,
            buffered_frames: 0,
            frames_processed: 0,
        }
    }
}

enum StreamEnd {
    Stopped,
    Failed,
}

/// Admits at most one frame per interval
struct FramePacer {
    interval: Duration,
    last: Option<Instant>,
}

impl FramePacer {
    fn admit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Spawn the ingestion loop for one camera. The loop runs until `stop` is triggered
/// and returns only after any recording it started has been handed off.
pub fn spawn(
    camera_id: &str,
    address: &str,
    ctx: Arc<PipelineContext>,
    stop: StopSignal,
) -> (JoinHandle<()>, watch::Receiver<CameraSnapshot>) {
    let (status_tx, status_rx) = watch::channel(CameraSnapshot::default());
    let settings = &ctx.settings;

    let camera_loop = CameraLoop {
        camera_id: camera_id.to_string(),
        address: address.to_string(),
        stop,
        status_tx,
        buffer: RollingBuffer::new(settings.buffer_capacity),
        session: RecordingSession::new(
            camera_id,
            settings.start_threshold,
            settings.stop_threshold,
            ctx.recorder.clone(),
            ctx.notifier.clone(),
        ),
        presence: PresenceTracker::new(settings.absence_window),
        pacer: FramePacer {
            interval: frame_interval(settings.target_fps),
            last: None,
        },
        motion: None,
        mode_rx: ctx.modes.subscribe(),
        mode_watch_open: true,
        feed_status: FeedStatus::Connecting,
        next_frame_id: 0,
        frames_processed: 0,
        last_preview: None,
        ctx,
    };

    (tokio::spawn(camera_loop.run()), status_rx)
}

struct CameraLoop {
    camera_id: String,
    address: String,
    ctx: Arc<PipelineContext>,
    stop: StopSignal,
    status_tx: watch::Sender<CameraSnapshot>,
    buffer: RollingBuffer,
    session: RecordingSession,
    presence: PresenceTracker,
    pacer: FramePacer,
    motion: Option<MotionMask>,
    mode_rx: watch::Receiver<ProcessingMode>,
    mode_watch_open: bool,
    feed_status: FeedStatus,
    next_frame_id: u64,
    frames_processed: u64,
    last_preview: Option<Instant>,
}

impl CameraLoop {
    async fn run(mut self) {
        info!("[{}] Starting ingestion loop for {}", self.camera_id, self.address);
        let mut in_outage = false;

        while !self.stop.is_set() {
            if !in_outage {
                self.set_status(FeedStatus::Connecting);
            }

            let Some(opened) = self.open_stream().await else {
                break;
            };

            match opened {
                Err(e) => {
                    warn!("[{}] Could not open stream: {}", self.camera_id, e);
                    if !in_outage {
                        self.set_status(FeedStatus::Disconnected);
                        in_outage = true;
                    }
                    self.set_status(FeedStatus::Reconnecting);
                    if !self.pause(self.ctx.settings.reconnect_interval).await {
                        break;
                    }
                }
                Ok(mut stream) => {
                    info!("[{}] Stream connected", self.camera_id);
                    self.set_status(FeedStatus::Streaming);

                    let end = self.stream_frames(stream.as_mut()).await;
                    stream.close().await;

                    match end {
                        StreamEnd::Stopped => break,
                        StreamEnd::Failed => {
                            warn!("[{}] Too many failed reads, reconnecting", self.camera_id);
                            self.set_status(FeedStatus::Disconnected);
                            self.set_status(FeedStatus::Reconnecting);
                            in_outage = true;
                        }
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Open the camera stream. Mode switches and recorder completion are still
    /// handled while the open is pending. `None` means the loop was stopped.
    async fn open_stream(&mut self) -> Option<Result<Box<dyn FrameStream>>> {
        let source = self.ctx.source.clone();
        let (camera_id, address) = (self.camera_id.clone(), self.address.clone());
        let open = source.open(&camera_id, &address);
        tokio::pin!(open);

        loop {
            let draining = self.session.is_draining();
            tokio::select! {
                biased;
                _ = self.stop.wait() => return None,
                _ = self.session.wait_drained(), if draining => self.publish_snapshot(),
                changed = self.mode_rx.changed(), if self.mode_watch_open => self.on_mode_event(changed),
                opened = &mut open => return Some(opened),
            }
        }
    }

    /// Sleep unless stopped first, still reacting to mode switches and recorder
    /// completion. Returns false when the loop should exit.
    async fn pause(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            let draining = self.session.is_draining();
            tokio::select! {
                biased;
                _ = self.stop.wait() => return false,
                _ = self.session.wait_drained(), if draining => self.publish_snapshot(),
                changed = self.mode_rx.changed(), if self.mode_watch_open => self.on_mode_event(changed),
                _ = &mut sleep => return true,
            }
        }
    }

    async fn stream_frames(&mut self, stream: &mut dyn FrameStream) -> StreamEnd {
        let max_failed_reads = self.ctx.settings.max_failed_reads;
        let mut failed_reads = 0u32;

        loop {
            if self.stop.is_set() {
                return StreamEnd::Stopped;
            }
            let draining = self.session.is_draining();

            let read = tokio::select! {
                biased;
                _ = self.stop.wait() => return StreamEnd::Stopped,
                _ = self.session.wait_drained(), if draining => {
                    self.publish_snapshot();
                    continue;
                }
                changed = self.mode_rx.changed(), if self.mode_watch_open => {
                    self.on_mode_event(changed);
                    continue;
                }
                read = stream.next_frame() => read,
            };

            match read {
                Ok(data) => {
                    failed_reads = 0;
                    if !self.pacer.admit(Instant::now()) {
                        continue;
                    }
                    let frame = Frame::new(self.next_frame_id, data);
                    self.next_frame_id += 1;
                    self.process_frame(frame).await;
                }
                Err(e) => {
                    failed_reads += 1;
                    warn!(
                        "[{}] Failed to read frame ({}/{}): {}",
                        self.camera_id, failed_reads, max_failed_reads, e
                    );
                    if failed_reads >= max_failed_reads {
                        return StreamEnd::Failed;
                    }
                    if !self.pause(self.ctx.settings.failed_read_backoff).await {
                        return StreamEnd::Stopped;
                    }
                }
            }
        }
    }

    fn on_mode_event(&mut self, changed: std::result::Result<(), watch::error::RecvError>) {
        match changed {
            Ok(()) => self.on_mode_change(),
            Err(_) => self.mode_watch_open = false,
        }
    }

    fn on_mode_change(&mut self) {
        let mode = *self.mode_rx.borrow_and_update();
        info!("[{}] Processing mode is now {}", self.camera_id, mode);
        if !mode.is_detection_capable() && self.session.request_stop() {
            info!("[{}] Stopping recording after mode switch", self.camera_id);
        }
        if mode != ProcessingMode::Motion {
            self.motion = None;
        }
        self.publish_snapshot();
    }

    async fn process_frame(&mut self, frame: Frame) {
        let mode = *self.mode_rx.borrow_and_update();
        if !mode.is_detection_capable() && self.session.request_stop() {
            info!("[{}] Stopping recording, mode {} does not detect", self.camera_id, mode);
        }

        let (output, detections) = match mode {
            ProcessingMode::None => (frame, Vec::new()),
            ProcessingMode::Human => {
                let detections = self.ctx.detectors.dispatch(&frame, &self.camera_id, frame.frame_id).await;
                (self.annotated(frame, &detections).await, detections)
            }
            ProcessingMode::Motion => (self.motion_mask(frame).await, Vec::new()),
        };

        self.frames_processed += 1;
        self.set_status(FeedStatus::Streaming);

        if mode.is_detection_capable() {
            for entry in self.presence.observe(&self.camera_id, output.frame_id, &detections) {
                self.ctx.notifier.emit(Event::DetectionLog(entry));
            }
            self.buffer.push(output.clone());
            self.session.on_frame(&output, !detections.is_empty(), &self.buffer);
        }

        self.maybe_preview(&output);
        self.publish_snapshot();
    }

    async fn annotated(&self, frame: Frame, detections: &[DetectionResult]) -> Frame {
        if detections.is_empty() {
            return frame;
        }
        let (source, found) = (frame.clone(), detections.to_vec());
        match tokio::task::spawn_blocking(move || annotate(&source, &found)).await {
            Ok(Ok(annotated)) => annotated,
            Ok(Err(e)) => {
                debug!("[{}] Could not annotate frame {}: {}", self.camera_id, frame.frame_id, e);
                frame
            }
            Err(e) => {
                warn!("[{}] Annotation task failed: {}", self.camera_id, e);
                frame
            }
        }
    }

    async fn motion_mask(&mut self, frame: Frame) -> Frame {
        let mut motion = self.motion.take().unwrap_or_default();
        let source = frame.clone();
        match tokio::task::spawn_blocking(move || {
            let result = motion.process(&source);
            (result, motion)
        })
        .await
        {
            Ok((result, motion)) => {
                self.motion = Some(motion);
                result.unwrap_or_else(|e| {
                    debug!("[{}] Motion mask failed for frame {}: {}", self.camera_id, frame.frame_id, e);
                    frame
                })
            }
            Err(e) => {
                warn!("[{}] Motion task failed: {}", self.camera_id, e);
                frame
            }
        }
    }

    fn maybe_preview(&mut self, frame: &Frame) {
        let now = Instant::now();
        let due = self
            .last_preview
            .map_or(true, |last| now.duration_since(last) >= self.ctx.settings.preview_interval);
        if due {
            self.last_preview = Some(now);
            self.ctx.notifier.emit(Event::Preview {
                camera_id: self.camera_id.clone(),
                frame: frame.clone(),
            });
        }
    }

    fn set_status(&mut self, status: FeedStatus) {
        if status != self.feed_status {
            debug!("[{}] Feed status {} -> {}", self.camera_id, self.feed_status, status);
        }
        self.feed_status = status;
        self.publish_snapshot();
        self.ctx.notifier.emit(Event::FeedStatus {
            camera_id: self.camera_id.clone(),
            status,
        });
    }

    fn publish_snapshot(&self) {
        let (detection_streak, no_detection_streak) = self.session.streaks();
        self.status_tx.send_replace(CameraSnapshot {
            feed_status: self.feed_status,
            recording_phase: self.session.phase(),
            detection_streak,
            no_detection_streak,
            buffered_frames: self.buffer.len(),
            frames_processed: self.frames_processed,
        });
    }

    async fn shutdown(&mut self) {
        self.session.shutdown().await;
        self.buffer.clear();
        self.set_status(FeedStatus::Stopped);
        info!("[{}] Ingestion loop stopped", self.camera_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::notifier::RecordingStatus;
    use crate::source::FfmpegSource;
    use crate::test_support::{
        drain_events, next_matching, test_pipeline, test_settings, PatternDetector, StubFeed, StubSource,
    };

    fn feed_statuses(events: &[Event]) -> Vec<FeedStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::FeedStatus { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn recording_statuses(events: &[Event]) -> Vec<RecordingStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Recording { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_camera_reports_disconnect_then_retries_every_second() {
        let source = Arc::new(FfmpegSource::new(StreamConfig::default()));
        let pipeline = test_pipeline(source, PatternDetector::never(), test_settings());
        let mut events = pipeline.notifier.subscribe();

        let stop = StopSignal::new();
        let (task, _status) = spawn("1", "bad://addr", pipeline.ctx.clone(), stop.clone());

        let mut seen = Vec::new();
        while seen.len() < 6 {
            if let Event::FeedStatus { status, .. } = next_matching(&mut events, |_| true).await {
                seen.push((status, Instant::now()));
            }
        }

        let statuses: Vec<FeedStatus> = seen.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            statuses,
            vec![
                FeedStatus::Connecting,
                FeedStatus::Disconnected,
                FeedStatus::Reconnecting,
                FeedStatus::Reconnecting,
                FeedStatus::Reconnecting,
                FeedStatus::Reconnecting,
            ]
        );
        for pair in seen[2..].windows(2) {
            assert_eq!(pair[1].1 - pair[0].1, Duration::from_secs(1));
        }

        stop.trigger();
        task.await.unwrap();
        assert_eq!(feed_statuses(&drain_events(&mut events)), vec![FeedStatus::Stopped]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain_events(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_detections_start_recording_on_threshold_frame() {
        let source = Arc::new(StubSource::new().with_feed("cam-1", StubFeed::frames(Duration::from_secs(1))));
        let pipeline = test_pipeline(source, PatternDetector::always(), test_settings());
        let mut events = pipeline.notifier.subscribe();

        let stop = StopSignal::new();
        let (task, status) = spawn("1", "cam-1", pipeline.ctx.clone(), stop.clone());

        next_matching(&mut events, |e| matches!(e, Event::Recording { status: RecordingStatus::Started, .. })).await;
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.frames_processed, 5);
        assert_eq!(snapshot.detection_streak, 5);
        assert_eq!(snapshot.recording_phase, RecordingPhase::Active);
        assert_eq!(snapshot.buffered_frames, 5);

        stop.trigger();
        task.await.unwrap();

        let rest = drain_events(&mut events);
        assert_eq!(recording_statuses(&rest), vec![RecordingStatus::Stopped]);
        assert_eq!(feed_statuses(&rest).last(), Some(&FeedStatus::Stopped));

        let clips = pipeline.clips.clips();
        assert_eq!(clips.len(), 1);
        assert_eq!(&clips[0].frames[..5], &[0, 1, 2, 3, 4]);
        assert!(clips[0].finished);

        pipeline.finalizer.flush().await;
        assert_eq!(pipeline.recordings.recordings().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_stops_recording_after_minimum_duration() {
        let source = Arc::new(StubSource::new().with_feed("cam-1", StubFeed::frames(Duration::from_secs(1))));
        let detector = PatternDetector::new(|_, frame_id| frame_id < 5);
        let pipeline = test_pipeline(source, detector, test_settings());
        let mut events = pipeline.notifier.subscribe();

        let stop = StopSignal::new();
        let (task, status) = spawn("1", "cam-1", pipeline.ctx.clone(), stop.clone());

        next_matching(&mut events, |e| matches!(e, Event::Recording { status: RecordingStatus::Started, .. })).await;
        let started_at = Instant::now();

        next_matching(&mut events, |e| matches!(e, Event::Recording { status: RecordingStatus::Stopped, .. })).await;
        assert!(started_at.elapsed() >= Duration::from_secs(30));
        {
            let snapshot = status.borrow();
            assert_eq!(snapshot.recording_phase, RecordingPhase::Idle);
            assert_eq!(snapshot.feed_status, FeedStatus::Streaming);
        }

        pipeline.finalizer.flush().await;
        let saved = pipeline.recordings.recordings();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].camera_id, "1");

        let clips = pipeline.clips.clips();
        assert_eq!(clips.len(), 1);
        assert_eq!(&clips[0].frames[..5], &[0, 1, 2, 3, 4]);
        assert!(clips[0].frames.len() >= 30);
        let recorded_for = clips[0].finished_at.unwrap() - clips[0].opened_at;
        assert!(recorded_for >= Duration::from_secs(30));

        // Camera keeps streaming without starting another recording
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(recording_statuses(&drain_events(&mut events)).is_empty());

        stop.trigger();
        task.await.unwrap();
        assert_eq!(pipeline.recordings.recordings().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_to_non_detecting_mode_stops_recording() {
        let source = Arc::new(StubSource::new().with_feed("cam-1", StubFeed::frames(Duration::from_secs(1))));
        let pipeline = test_pipeline(source, PatternDetector::always(), test_settings());
        let mut events = pipeline.notifier.subscribe();

        let stop = StopSignal::new();
        let (task, status) = spawn("1", "cam-1", pipeline.ctx.clone(), stop.clone());

        next_matching(&mut events, |e| matches!(e, Event::Recording { status: RecordingStatus::Started, .. })).await;
        pipeline.ctx.modes.set(ProcessingMode::None);

        next_matching(&mut events, |e| matches!(e, Event::Recording { status: RecordingStatus::Stopped, .. })).await;
        let processed = status.borrow().frames_processed;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(recording_statuses(&drain_events(&mut events)).is_empty());
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.recording_phase, RecordingPhase::Idle);
        assert_eq!(snapshot.detection_streak, 0);
        assert!(snapshot.frames_processed > processed);

        stop.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_read_failures_reconnect() {
        let source = Arc::new(
            StubSource::new().with_feed("cam-1", StubFeed::failing_after(Duration::from_secs(1), 2)),
        );
        let pipeline = test_pipeline(source.clone(), PatternDetector::never(), test_settings());
        let mut events = pipeline.notifier.subscribe();

        let stop = StopSignal::new();
        let (task, _status) = spawn("1", "cam-1", pipeline.ctx.clone(), stop.clone());

        let mut transitions: Vec<FeedStatus> = Vec::new();
        while transitions.iter().filter(|s| **s == FeedStatus::Streaming).count() < 2 {
            if let Event::FeedStatus { status, .. } = next_matching(&mut events, |_| true).await {
                if transitions.last() != Some(&status) {
                    transitions.push(status);
                }
            }
        }
        assert_eq!(
            transitions,
            vec![
                FeedStatus::Connecting,
                FeedStatus::Streaming,
                FeedStatus::Disconnected,
                FeedStatus::Reconnecting,
                FeedStatus::Streaming,
            ]
        );

        stop.trigger();
        task.await.unwrap();
        assert_eq!(
            source.log(),
            vec!["open:cam-1", "close:cam-1", "open:cam-1", "close:cam-1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frames_faster_than_target_rate_are_discarded() {
        let source = Arc::new(StubSource::new().with_feed("cam-1", StubFeed::frames(Duration::from_millis(250))));
        let pipeline = test_pipeline(source, PatternDetector::never(), test_settings());

        let stop = StopSignal::new();
        let (task, status) = spawn("1", "cam-1", pipeline.ctx.clone(), stop.clone());

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        let processed = status.borrow().frames_processed;
        assert!((9..=11).contains(&processed), "processed {}", processed);

        stop.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn mode_switch_during_outage_drains_recording() {
        let source = Arc::new(
            StubSource::new().with_feed("cam-1", StubFeed::single_connection(Duration::from_secs(1), 6)),
        );
        let pipeline = test_pipeline(source, PatternDetector::always(), test_settings());
        let mut events = pipeline.notifier.subscribe();

        let stop = StopSignal::new();
        let (task, mut status) = spawn("1", "cam-1", pipeline.ctx.clone(), stop.clone());

        next_matching(&mut events, |e| matches!(e, Event::Recording { status: RecordingStatus::Started, .. })).await;
        let started_at = Instant::now();
        next_matching(&mut events, |e| matches!(e, Event::FeedStatus { status: FeedStatus::Reconnecting, .. })).await;
        assert_eq!(status.borrow().recording_phase, RecordingPhase::Active);

        pipeline.ctx.modes.set(ProcessingMode::None);
        tokio::time::timeout(
            Duration::from_millis(100),
            status.wait_for(|s| s.recording_phase == RecordingPhase::Draining),
        )
        .await
        .expect("mode switch did not drain the recording")
        .unwrap();

        next_matching(&mut events, |e| matches!(e, Event::Recording { status: RecordingStatus::Stopped, .. })).await;
        assert!(started_at.elapsed() >= Duration::from_secs(25));
        {
            let snapshot = status.borrow();
            assert_eq!(snapshot.recording_phase, RecordingPhase::Idle);
            assert_eq!(snapshot.feed_status, FeedStatus::Reconnecting);
        }

        pipeline.finalizer.flush().await;
        assert_eq!(pipeline.recordings.recordings().len(), 1);

        stop.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn detection_log_fires_only_when_presence_begins() {
        let source = Arc::new(StubSource::new().with_feed("cam-1", StubFeed::frames(Duration::from_secs(1))));
        let detector = PatternDetector::new(|_, frame_id| frame_id < 3 || frame_id == 20 || frame_id >= 60);
        let pipeline = test_pipeline(source, detector, test_settings());
        let mut events = pipeline.notifier.subscribe();

        let stop = StopSignal::new();
        let (task, _status) = spawn("1", "cam-1", pipeline.ctx.clone(), stop.clone());

        let mut logged = Vec::new();
        while logged.len() < 2 {
            if let Event::DetectionLog(entry) =
                next_matching(&mut events, |e| matches!(e, Event::DetectionLog(_))).await
            {
                assert_eq!(entry.camera_id, "1");
                assert_eq!(entry.label, "person");
                logged.push(entry.frame_id);
            }
        }
        // Frame 20 is within the absence window of frame 2, frame 60 is not
        assert_eq!(logged, vec![0, 60]);

        stop.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn previews_are_rate_limited_by_interval() {
        let source = Arc::new(StubSource::new().with_feed("cam-1", StubFeed::frames(Duration::from_secs(1))));
        let mut settings = test_settings();
        settings.preview_interval = Duration::from_secs(3);
        let pipeline = test_pipeline(source, PatternDetector::never(), settings);
        let mut events = pipeline.notifier.subscribe();

        let stop = StopSignal::new();
        let (task, status) = spawn("1", "cam-1", pipeline.ctx.clone(), stop.clone());

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(status.borrow().frames_processed, 10);

        let events = drain_events(&mut events);
        let previews: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                Event::Preview { frame, .. } => Some(frame.frame_id),
                _ => None,
            })
            .collect();
        assert_eq!(previews, vec![0, 3, 6, 9]);
        // Feed status is still reported on every processed frame
        let streaming = feed_statuses(&events).iter().filter(|s| **s == FeedStatus::Streaming).count();
        assert_eq!(streaming, 11);

        stop.trigger();
        task.await.unwrap();
    }
}
