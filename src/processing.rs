use std::sync::Arc;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::errors::{Result, VigilError};
use crate::frame::{DetectionResult, Frame};

const ANNOTATION_JPEG_QUALITY: u8 = 85;
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

/// Active per-frame processing strategy, shared by all cameras
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Pass frames through untouched
    None,
    /// Run the detector pool and drive recordings
    #[default]
    Human,
    /// Foreground mask from background subtraction
    Motion,
}

impl ProcessingMode {
    /// Only detection-capable modes feed the buffer and the recording state machine
    pub fn is_detection_capable(self) -> bool {
        matches!(self, ProcessingMode::Human)
    }
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingMode::None => write!(f, "none"),
            ProcessingMode::Human => write!(f, "human"),
            ProcessingMode::Motion => write!(f, "motion"),
        }
    }
}

/// Handle for switching the processing mode at runtime.
///
/// Loops hold a receiver and read the current mode once per frame, so a switch
/// takes effect on the next frame of every camera.
#[derive(Clone)]
pub struct ModeSwitch {
    tx: Arc<watch::Sender<ProcessingMode>>,
}

impl ModeSwitch {
    pub fn new(initial: ProcessingMode) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Returns the mode that was replaced
    pub fn set(&self, mode: ProcessingMode) -> ProcessingMode {
        let previous = self.tx.send_replace(mode);
        if previous != mode {
            info!("Processing mode switched from {} to {}", previous, mode);
        }
        previous
    }

    pub fn current(&self) -> ProcessingMode {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessingMode> {
        self.tx.subscribe()
    }
}

fn encode_jpeg<I>(image: &I) -> Result<Bytes>
where
    I: image::GenericImageView,
    I::Pixel: image::PixelWithColorType,
{
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, ANNOTATION_JPEG_QUALITY).encode_image(image)?;
    Ok(Bytes::from(out))
}

fn draw_rect(image: &mut RgbImage, detection: &DetectionResult) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(width - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(height - 1);
    let (x0, x1) = (clamp_x(detection.bbox.xmin), clamp_x(detection.bbox.xmax));
    let (y0, y1) = (clamp_y(detection.bbox.ymin), clamp_y(detection.bbox.ymax));
    if x0 > x1 || y0 > y1 {
        return;
    }

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            image.put_pixel(x, (y0 + t).min(y1), BOX_COLOR);
            image.put_pixel(x, y1.saturating_sub(t).max(y0), BOX_COLOR);
        }
        for y in y0..=y1 {
            image.put_pixel((x0 + t).min(x1), y, BOX_COLOR);
            image.put_pixel(x1.saturating_sub(t).max(x0), y, BOX_COLOR);
        }
    }
}

/// Draw a rectangle for every detection onto the frame and re-encode it
pub fn annotate(frame: &Frame, detections: &[DetectionResult]) -> Result<Frame> {
    if detections.is_empty() {
        return Ok(frame.clone());
    }
    let mut image = image::load_from_memory(&frame.data)?.to_rgb8();
    for detection in detections {
        draw_rect(&mut image, detection);
    }
    Ok(frame.with_data(encode_jpeg(&image)?))
}

/// Running-average background subtraction producing a binary foreground mask
pub struct MotionMask {
    background: Vec<f32>,
    dimensions: (u32, u32),
    learning_rate: f32,
    threshold: f32,
}

impl MotionMask {
    pub fn new() -> Self {
        Self {
            background: Vec::new(),
            dimensions: (0, 0),
            learning_rate: 0.05,
            threshold: 25.0,
        }
    }

    pub fn process(&mut self, frame: &Frame) -> Result<Frame> {
        let gray = image::load_from_memory(&frame.data)?.to_luma8();
        let dimensions = gray.dimensions();
        if dimensions.0 == 0 || dimensions.1 == 0 {
            return Err(VigilError::detector("empty image"));
        }

        if dimensions != self.dimensions {
            self.dimensions = dimensions;
            self.background = gray.pixels().map(|p| p.0[0] as f32).collect();
        }

        let mut mask = GrayImage::new(dimensions.0, dimensions.1);
        for ((pixel, background), out) in gray
            .pixels()
            .zip(self.background.iter_mut())
            .zip(mask.pixels_mut())
        {
            let value = pixel.0[0] as f32;
            *out = if (value - *background).abs() > self.threshold {
                Luma([255])
            } else {
                Luma([0])
            };
            *background += (value - *background) * self.learning_rate;
        }

        Ok(frame.with_data(encode_jpeg(&mask)?))
    }
}

impl Default for MotionMask {
    fn default() -> Self {
        Self::new()
    }
}
