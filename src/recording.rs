use std::sync::Arc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::buffer::RollingBuffer;
use crate::frame::Frame;
use crate::notifier::{Event, Notifier, RecordingStatus};
use crate::recorder::{self, RecorderContext, RecorderHandle};

/// Externally visible recording phase of one camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingPhase {
    /// No recording and no detection streak
    Idle,
    /// Detection streak building towards the start threshold
    Arming,
    /// Recorder running
    Active,
    /// Stop requested, recorder finishing its minimum duration
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Active,
    Draining,
}

/// Streak counting and start/stop decisions, free of any I/O
#[derive(Debug)]
pub struct RecordingStateMachine {
    start_threshold: u32,
    stop_threshold: u32,
    detection_streak: u32,
    no_detection_streak: u32,
    state: SessionState,
}

impl RecordingStateMachine {
    pub fn new(start_threshold: u32, stop_threshold: u32) -> Self {
        Self {
            start_threshold: start_threshold.max(1),
            stop_threshold: stop_threshold.max(1),
            detection_streak: 0,
            no_detection_streak: 0,
            state: SessionState::Idle,
        }
    }

    /// Feed one processed frame's outcome
    pub fn observe(&mut self, has_detection: bool) -> Option<Transition> {
        if has_detection {
            self.detection_streak = self.detection_streak.saturating_add(1);
            self.no_detection_streak = 0;
        } else {
            self.no_detection_streak = self.no_detection_streak.saturating_add(1);
            self.detection_streak = 0;
        }

        match self.state {
            SessionState::Idle if self.detection_streak >= self.start_threshold => {
                self.state = SessionState::Active;
                Some(Transition::Start)
            }
            SessionState::Active if self.no_detection_streak >= self.stop_threshold => {
                self.state = SessionState::Draining;
                Some(Transition::Stop)
            }
            _ => None,
        }
    }

    /// Stop outside the streak rules (mode switch, camera stop).
    /// Yields `Stop` only when a recording was active; streaks restart from zero.
    pub fn force_stop(&mut self) -> Option<Transition> {
        self.detection_streak = 0;
        self.no_detection_streak = 0;
        if self.state == SessionState::Active {
            self.state = SessionState::Draining;
            Some(Transition::Stop)
        } else {
            None
        }
    }

    /// The recorder has finished; ready for the next recording
    pub fn drained(&mut self) {
        self.state = SessionState::Idle;
    }

    pub fn phase(&self) -> RecordingPhase {
        match self.state {
            SessionState::Active => RecordingPhase::Active,
            SessionState::Draining => RecordingPhase::Draining,
            SessionState::Idle if self.detection_streak > 0 => RecordingPhase::Arming,
            SessionState::Idle => RecordingPhase::Idle,
        }
    }

    pub fn detection_streak(&self) -> u32 {
        self.detection_streak
    }

    pub fn no_detection_streak(&self) -> u32 {
        self.no_detection_streak
    }
}

/// Per-camera recording controller: applies state machine decisions to a recorder task
pub struct RecordingSession {
    camera_id: String,
    machine: RecordingStateMachine,
    recorder: Option<RecorderHandle>,
    recorder_ctx: RecorderContext,
    notifier: Arc<dyn Notifier>,
}

impl RecordingSession {
    pub fn new(
        camera_id: &str,
        start_threshold: u32,
        stop_threshold: u32,
        recorder_ctx: RecorderContext,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            machine: RecordingStateMachine::new(start_threshold, stop_threshold),
            recorder: None,
            recorder_ctx,
            notifier,
        }
    }

    fn emit(&self, status: RecordingStatus) {
        self.notifier.emit(Event::Recording {
            camera_id: self.camera_id.clone(),
            status,
        });
    }

    /// Account one processed frame. `buffer` must already contain `frame`.
    pub fn on_frame(&mut self, frame: &Frame, has_detection: bool, buffer: &RollingBuffer) {
        if self.machine.phase() == RecordingPhase::Active
            && self.recorder.as_ref().is_some_and(|r| r.is_finished())
        {
            error!("[{}] Recorder exited while active", self.camera_id);
            self.request_stop();
        }

        match self.machine.observe(has_detection) {
            Some(Transition::Start) => {
                let snapshot = buffer.snapshot();
                info!(
                    "[{}] Detections in {} consecutive frames, starting recording with {} buffered frames",
                    self.camera_id, self.machine.detection_streak(), snapshot.len()
                );
                self.recorder = Some(recorder::spawn(&self.camera_id, snapshot, self.recorder_ctx.clone()));
                self.emit(RecordingStatus::Started);
            }
            Some(Transition::Stop) => {
                info!(
                    "[{}] No detections in {} consecutive frames, stopping recording",
                    self.camera_id, self.machine.no_detection_streak()
                );
                self.feed(frame);
                self.signal_recorder();
            }
            None => self.feed(frame),
        }
    }

    fn feed(&self, frame: &Frame) {
        if let Some(recorder) = &self.recorder {
            recorder.feed(frame.clone());
        }
    }

    fn signal_recorder(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.stop();
        }
    }

    /// Ask an active recording to stop. Idempotent; returns true if this call initiated the stop.
    pub fn request_stop(&mut self) -> bool {
        match self.machine.force_stop() {
            Some(Transition::Stop) => {
                self.signal_recorder();
                true
            }
            _ => false,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.machine.phase() == RecordingPhase::Draining
    }

    pub fn phase(&self) -> RecordingPhase {
        self.machine.phase()
    }

    pub fn streaks(&self) -> (u32, u32) {
        (self.machine.detection_streak(), self.machine.no_detection_streak())
    }

    /// Wait for a draining recorder to finish. Cancel-safe: the recorder stays
    /// owned by the session until it has completed.
    pub async fn wait_drained(&mut self) {
        if !self.is_draining() {
            return;
        }
        let Some(recorder) = self.recorder.as_mut() else {
            self.machine.drained();
            return;
        };

        let result = (&mut recorder.task).await;
        self.recorder = None;
        self.machine.drained();

        match result {
            Ok(Some(clip)) => info!(
                "[{}] Recording {} complete with {} frames",
                self.camera_id, clip.path.display(), clip.frame_count
            ),
            Ok(None) => warn!("[{}] Recording ended without a clip", self.camera_id),
            Err(e) => error!("[{}] Recorder task failed: {}", self.camera_id, e),
        }
        self.emit(RecordingStatus::Stopped);
    }

    /// Stop any recording and wait until its clip has been handed off
    pub async fn shutdown(&mut self) {
        if self.request_stop() {
            info!("[{}] Finishing active recording before shutdown", self.camera_id);
        }
        self.wait_drained().await;
    }
}
