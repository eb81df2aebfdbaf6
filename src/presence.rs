use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::frame::{BoundingBox, DetectionResult};
use crate::notifier::{Event, Notifier};

const CSV_HEADER: &str = "date,time,camera_id,frame_id,class,confidence,xmin,ymin,xmax,ymax\n";
const CSV_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct DetectionLogEntry {
    pub date: String,
    pub time: String,
    pub camera_id: String,
    pub frame_id: u64,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl DetectionLogEntry {
    fn new(at: DateTime<Utc>, camera_id: &str, frame_id: u64, detection: &DetectionResult) -> Self {
        Self {
            date: at.format("%d-%m-%y").to_string(),
            time: at.format("%H:%M:%S").to_string(),
            camera_id: camera_id.to_string(),
            frame_id,
            label: detection.label.clone(),
            confidence: detection.confidence,
            bbox: detection.bbox,
        }
    }

    /// One CSV record in header order
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            csv_field(&self.date),
            csv_field(&self.time),
            csv_field(&self.camera_id),
            self.frame_id,
            csv_field(&self.label),
            self.confidence,
            self.bbox.xmin,
            self.bbox.ymin,
            self.bbox.xmax,
            self.bbox.ymax
        )
    }
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Debounces detection logging so that one continuous presence produces one log burst.
///
/// A presence is "new" when no detection was seen for longer than the absence window.
/// Every detection refreshes the last-seen time, even when logging is skipped.
pub struct PresenceTracker {
    absence_window: Duration,
    last_seen: Option<Instant>,
}

impl PresenceTracker {
    pub fn new(absence_window: Duration) -> Self {
        Self {
            absence_window,
            last_seen: None,
        }
    }

    /// Returns the log entries to emit for this frame, empty when the presence is ongoing
    pub fn observe(
        &mut self,
        camera_id: &str,
        frame_id: u64,
        detections: &[DetectionResult],
    ) -> Vec<DetectionLogEntry> {
        if detections.is_empty() {
            return Vec::new();
        }

        let now = Instant::now();
        let is_new_presence = match self.last_seen {
            None => true,
            Some(last) => now.duration_since(last) > self.absence_window,
        };
        self.last_seen = Some(now);

        if !is_new_presence {
            return Vec::new();
        }

        let at = Utc::now();
        detections
            .iter()
            .map(|detection| DetectionLogEntry::new(at, camera_id, frame_id, detection))
            .collect()
    }
}

/// Appends every detection-log event to a CSV file, writing the header on first use
pub struct CsvDetectionLog {
    tx: mpsc::Sender<DetectionLogEntry>,
}

impl CsvDetectionLog {
    /// Start the writer task. It ends once the log is dropped and the queue is drained.
    pub fn spawn(path: impl Into<PathBuf>) -> (Self, JoinHandle<()>) {
        let path = path.into();
        let (tx, mut rx) = mpsc::channel::<DetectionLogEntry>(CSV_QUEUE_SIZE);
        info!("Writing detection log to {}", path.display());

        let task = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = append_row(&path, &entry).await {
                    error!("[{}] Failed to append detection log to {}: {}", entry.camera_id, path.display(), e);
                }
            }
        });

        (Self { tx }, task)
    }
}

async fn append_row(path: &Path, entry: &DetectionLogEntry) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    let mut out = String::new();
    if file.metadata().await?.len() == 0 {
        out.push_str(CSV_HEADER);
    }
    out.push_str(&entry.to_csv_row());
    file.write_all(out.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

impl Notifier for CsvDetectionLog {
    fn emit(&self, event: Event) {
        if let Event::DetectionLog(entry) = event {
            if let Err(e) = self.tx.try_send(entry) {
                warn!("Dropped detection log entry: {}", e);
            }
        }
    }
}
