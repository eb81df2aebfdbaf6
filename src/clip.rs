use std::path::PathBuf;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::errors::{Result, VigilError};
use crate::frame::Frame;

/// A finished raw clip handed from a recorder to the finalizer
#[derive(Debug, Clone)]
pub struct FinishedClip {
    pub camera_id: String,
    pub path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub frame_count: u64,
}

/// Creates per-recording clip writers
#[async_trait]
pub trait ClipStore: Send + Sync {
    async fn create(&self, camera_id: &str, start_time: DateTime<Utc>) -> Result<Box<dyn ClipWriter>>;
}

#[async_trait]
pub trait ClipWriter: Send {
    fn path(&self) -> PathBuf;
    async fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    async fn finish(&mut self) -> Result<()>;
}

/// Writes raw clips as concatenated JPEG frames (`.mjpeg`) under `output_dir`
pub struct MjpegClipStore {
    output_dir: PathBuf,
}

impl MjpegClipStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { output_dir: output_dir.into() }
    }

    fn clip_path(&self, camera_id: &str, start_time: DateTime<Utc>) -> PathBuf {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.output_dir.join(format!(
            "{}_{}_{}.mjpeg",
            camera_id,
            start_time.format("%Y%m%d_%H%M%S"),
            &suffix[..8]
        ))
    }
}

#[async_trait]
impl ClipStore for MjpegClipStore {
    async fn create(&self, camera_id: &str, start_time: DateTime<Utc>) -> Result<Box<dyn ClipWriter>> {
        fs::create_dir_all(&self.output_dir).await.map_err(|e| {
            VigilError::recorder_io(format!("cannot create {}: {}", self.output_dir.display(), e))
        })?;

        let path = self.clip_path(camera_id, start_time);
        let file = File::create(&path).await.map_err(|e| {
            VigilError::recorder_io(format!("cannot create {}: {}", path.display(), e))
        })?;
        debug!("[{}] Opened clip file {}", camera_id, path.display());

        Ok(Box::new(MjpegClipWriter {
            path,
            writer: BufWriter::new(file),
        }))
    }
}

struct MjpegClipWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

#[async_trait]
impl ClipWriter for MjpegClipWriter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.writer.write_all(&frame.data).await.map_err(|e| {
            VigilError::recorder_io(format!("write to {} failed: {}", self.path.display(), e))
        })
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;
        Ok(())
    }
}
