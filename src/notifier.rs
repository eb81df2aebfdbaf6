use std::sync::Arc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::frame::Frame;
use crate::presence::DetectionLogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Connecting,
    Streaming,
    Disconnected,
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedStatus::Connecting => write!(f, "connecting"),
            FeedStatus::Streaming => write!(f, "streaming"),
            FeedStatus::Disconnected => write!(f, "disconnected"),
            FeedStatus::Reconnecting => write!(f, "reconnecting"),
            FeedStatus::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Started,
    Stopped,
}

/// Everything the core publishes to the outside world
#[derive(Debug, Clone)]
pub enum Event {
    FeedStatus { camera_id: String, status: FeedStatus },
    Recording { camera_id: String, status: RecordingStatus },
    RecordingSaved { camera_id: String, recording_id: i64, file_path: String },
    Preview { camera_id: String, frame: Frame },
    DetectionLog(DetectionLogEntry),
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::FeedStatus { .. } => "status",
            Event::Recording { .. } => "recording",
            Event::RecordingSaved { .. } => "saved",
            Event::Preview { .. } => "jpg",
            Event::DetectionLog(_) => "log",
        }
    }

    pub fn camera_id(&self) -> &str {
        match self {
            Event::FeedStatus { camera_id, .. }
            | Event::Recording { camera_id, .. }
            | Event::RecordingSaved { camera_id, .. }
            | Event::Preview { camera_id, .. } => camera_id,
            Event::DetectionLog(entry) => &entry.camera_id,
        }
    }
}

/// Fire-and-forget event sink. Implementations must never block the caller.
pub trait Notifier: Send + Sync {
    fn emit(&self, event: Event);
}

/// In-process fan-out over a tokio broadcast channel
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Event>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn emit(&self, event: Event) {
        if self.sender.send(event).is_err() {
            trace!("No subscribers for notifier event");
        }
    }
}

/// Forwards every event to each registered notifier
#[derive(Clone, Default)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }
}

impl Notifier for NotifierSet {
    fn emit(&self, event: Event) {
        if let Some((last, rest)) = self.notifiers.split_last() {
            for notifier in rest {
                notifier.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
