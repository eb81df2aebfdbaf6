use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single JPEG-encoded frame as delivered by a stream reader.
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: u64,
    pub captured_at: DateTime<Utc>,
    pub data: Bytes,
}

impl Frame {
    pub fn new(frame_id: u64, data: Bytes) -> Self {
        Self {
            frame_id,
            captured_at: Utc::now(),
            data,
        }
    }

    pub fn with_data(&self, data: Bytes) -> Self {
        Self {
            frame_id: self.frame_id,
            captured_at: self.captured_at,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    pub fn is_finite(&self) -> bool {
        self.xmin.is_finite() && self.ymin.is_finite() && self.xmax.is_finite() && self.ymax.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}
