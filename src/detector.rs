use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::DetectorConfig;
use crate::errors::{Result, VigilError};
use crate::frame::{BoundingBox, DetectionResult, Frame};

/// Opaque, stateful detection capability.
///
/// `detect` takes `&mut self`; the pool guarantees one caller per instance at a time.
#[async_trait]
pub trait Detector: Send {
    async fn detect(&mut self, frame: &Frame, camera_id: &str, frame_id: u64) -> Result<Vec<DetectionResult>>;
}

/// Fixed pool of detector workers shared by every camera, assigned round-robin
pub struct DetectorPool {
    workers: Vec<Arc<Mutex<Box<dyn Detector>>>>,
    next: AtomicUsize,
}

impl DetectorPool {
    pub fn new(workers: Vec<Box<dyn Detector>>) -> Result<Self> {
        if workers.is_empty() {
            return Err(VigilError::config("detector pool needs at least one worker"));
        }
        Ok(Self {
            workers: workers.into_iter().map(|w| Arc::new(Mutex::new(w))).collect(),
            next: AtomicUsize::new(0),
        })
    }

    /// Build `size` workers from a shared configuration, once, at startup
    pub fn from_factory<F>(size: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<Box<dyn Detector>>,
    {
        let workers = (0..size).map(&mut factory).collect::<Result<Vec<_>>>()?;
        info!("Created detector pool with {} workers", workers.len());
        Self::new(workers)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    fn next_index(&self) -> usize {
        let len = self.workers.len();
        // fetch_update keeps the counter in [0, len) so the rotation never skews on wrap
        match self.next.fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % len)) {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// Run one frame through the next worker in rotation.
    ///
    /// Worker errors and panics are logged and reported as "no detections".
    pub async fn dispatch(&self, frame: &Frame, camera_id: &str, frame_id: u64) -> Vec<DetectionResult> {
        let index = self.next_index();
        let worker = self.workers[index].clone();
        let frame = frame.clone();
        let camera = camera_id.to_string();

        let task = tokio::spawn(async move {
            let mut detector = worker.lock().await;
            detector.detect(&frame, &camera, frame_id).await
        });

        match task.await {
            Ok(Ok(detections)) => {
                debug!("[{}] Worker {} returned {} detections for frame {}", camera_id, index, detections.len(), frame_id);
                detections
            }
            Ok(Err(e)) => {
                warn!("[{}] Detector worker {} failed on frame {}: {}", camera_id, index, frame_id, e);
                Vec::new()
            }
            Err(e) => {
                error!("[{}] Detector worker {} aborted on frame {}: {}", camera_id, index, frame_id, e);
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(alias = "class")]
    label: String,
    confidence: f32,
    xmin: f32,
    ymin: f32,
    xmax: f32,
    ymax: f32,
}

/// Detector backed by an HTTP inference endpoint that accepts a JPEG body and
/// answers with a JSON list of `{label|class, confidence, xmin, ymin, xmax, ymax}`.
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    labels: Vec<String>,
    confidence_threshold: f32,
}

impl HttpDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            labels: config.labels.iter().map(|l| l.to_lowercase()).collect(),
            confidence_threshold: config.confidence_threshold,
        })
    }
}

fn filter_detections(wire: Vec<WireDetection>, labels: &[String], threshold: f32) -> Vec<DetectionResult> {
    wire.into_iter()
        .filter(|d| labels.is_empty() || labels.contains(&d.label.to_lowercase()))
        .filter(|d| d.confidence >= threshold)
        .map(|d| DetectionResult {
            label: d.label,
            confidence: d.confidence,
            bbox: BoundingBox { xmin: d.xmin, ymin: d.ymin, xmax: d.xmax, ymax: d.ymax },
        })
        .filter(|d| {
            let finite = d.bbox.is_finite();
            if !finite {
                debug!("Skipping detection with invalid box: {:?}", d.bbox);
            }
            finite
        })
        .collect()
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&mut self, frame: &Frame, camera_id: &str, frame_id: u64) -> Result<Vec<DetectionResult>> {
        let response = self.client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .header("X-Camera-Id", camera_id)
            .header("X-Frame-Id", frame_id.to_string())
            .body(frame.data.clone())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(VigilError::detector(format!(
                "inference endpoint returned {}", response.status()
            )));
        }

        let wire: Vec<WireDetection> = response.json().await?;
        Ok(filter_detections(wire, &self.labels, self.confidence_threshold))
    }
}
