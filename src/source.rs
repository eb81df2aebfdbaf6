use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::errors::{Result, VigilError};

const SUPPORTED_SCHEMES: &[&str] = &["rtsp", "rtsps", "http", "https", "file"];
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// Opens frame streams for camera addresses
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&self, camera_id: &str, address: &str) -> Result<Box<dyn FrameStream>>;
}

/// An open stream of JPEG-encoded frames
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame. Must be cancel-safe: dropping the future loses no buffered data.
    async fn next_frame(&mut self) -> Result<Bytes>;

    async fn close(&mut self);
}

/// Splits a byte stream of concatenated JPEG images on SOI/EOI markers
#[derive(Debug, Default)]
pub struct MjpegParser {
    pending: Vec<u8>,
}

impl MjpegParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        if self.pending.len() > MAX_PENDING_BYTES {
            warn!("Discarding {} bytes without a complete JPEG frame", self.pending.len());
            self.pending.clear();
        }
    }

    pub fn next_frame(&mut self) -> Option<Bytes> {
        let start = find_marker(&self.pending, 0, 0xD8)?;
        if start > 0 {
            self.pending.drain(..start);
        }
        let end = find_marker(&self.pending, 2, 0xD9)?;
        let frame: Vec<u8> = self.pending.drain(..end + 2).collect();
        Some(Bytes::from(frame))
    }
}

fn find_marker(data: &[u8], from: usize, marker: u8) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == marker)
        .map(|i| i + from)
}

/// Validates the address scheme before any connection attempt
pub fn validate_address(address: &str) -> Result<url::Url> {
    let url = url::Url::parse(address)
        .map_err(|e| VigilError::stream_unavailable(format!("invalid address '{}': {}", address, e)))?;
    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(VigilError::stream_unavailable(format!(
            "unsupported scheme '{}' in '{}'",
            url.scheme(),
            address
        )));
    }
    Ok(url)
}

/// Frame source that decodes any ffmpeg-readable address to MJPEG on stdout
pub struct FfmpegSource {
    config: Arc<StreamConfig>,
}

impl FfmpegSource {
    pub fn new(config: StreamConfig) -> Self {
        Self { config: Arc::new(config) }
    }

    /// RTSP cameras are checked with DESCRIBE first so a dead camera fails fast
    async fn describe_rtsp(&self, camera_id: &str, original_url: &url::Url) -> Result<()> {
        let creds = if !original_url.username().is_empty() {
            Some(retina::client::Credentials {
                username: original_url.username().to_string(),
                password: original_url.password().unwrap_or("").to_string(),
            })
        } else {
            None
        };

        let mut url = original_url.clone();
        let _ = url.set_username("");
        let _ = url.set_password(None);

        let session_group = Arc::new(retina::client::SessionGroup::default());
        match tokio::time::timeout(
            self.config.open_timeout,
            retina::client::Session::describe(
                url.clone(),
                retina::client::SessionOptions::default()
                    .creds(creds)
                    .session_group(session_group)
                    .user_agent("vigilnet/0.1".to_string()),
            ),
        )
        .await
        {
            Ok(Ok(session)) => {
                let has_video = session.streams().iter().any(|s| s.media() == "video");
                if !has_video {
                    return Err(VigilError::stream_unavailable(format!("no video stream at {}", url)));
                }
                debug!("[{}] DESCRIBE ok, {} streams", camera_id, session.streams().len());
                Ok(())
            }
            Ok(Err(e)) => Err(VigilError::stream_unavailable(format!("RTSP DESCRIBE failed: {}", e))),
            Err(_) => Err(VigilError::stream_unavailable(format!(
                "timeout connecting to {} ({:?})",
                url, self.config.open_timeout
            ))),
        }
    }

    fn ffmpeg_args(&self, url: &url::Url, address: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(), "error".into(),
            "-fflags".into(), "+nobuffer+discardcorrupt".into(),
            "-flags".into(), "low_delay".into(),
        ];
        if matches!(url.scheme(), "rtsp" | "rtsps") {
            args.extend(["-rtsp_transport".into(), self.config.transport.clone()]);
        }
        let input = match url.scheme() {
            "file" => url
                .to_file_path()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| address.to_string()),
            _ => address.to_string(),
        };
        args.extend([
            "-i".into(), input,
            "-f".into(), "mjpeg".into(),
            "-q:v".into(), self.config.jpeg_quality.to_string(),
            "-flush_packets".into(), "1".into(),
            "-an".into(),
            "-".into(),
        ]);
        args
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn open(&self, camera_id: &str, address: &str) -> Result<Box<dyn FrameStream>> {
        let url = validate_address(address)?;
        if matches!(url.scheme(), "rtsp" | "rtsps") {
            self.describe_rtsp(camera_id, &url).await?;
        }

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(self.ffmpeg_args(&url, address))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VigilError::stream_unavailable(format!("failed to start ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VigilError::stream_unavailable("ffmpeg stdout unavailable"))?;

        let mut stream = FfmpegStream {
            camera_id: camera_id.to_string(),
            child,
            stdout,
            parser: MjpegParser::new(),
            chunk: vec![0u8; self.config.chunk_read_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1024)],
            read_timeout: self.config.read_timeout,
            first_frame: None,
        };

        // Opening succeeds only once the first frame has been decoded
        match tokio::time::timeout(self.config.open_timeout, stream.read_jpeg()).await {
            Ok(Ok(frame)) => {
                info!("[{}] Stream opened via ffmpeg", camera_id);
                stream.first_frame = Some(frame);
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => {
                stream.close().await;
                Err(e)
            }
            Err(_) => {
                stream.close().await;
                Err(VigilError::stream_unavailable(format!(
                    "no frame within {:?}",
                    self.config.open_timeout
                )))
            }
        }
    }
}

pub struct FfmpegStream {
    camera_id: String,
    child: Child,
    stdout: ChildStdout,
    parser: MjpegParser,
    chunk: Vec<u8>,
    read_timeout: Duration,
    first_frame: Option<Bytes>,
}

impl FfmpegStream {
    async fn read_jpeg(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.parser.next_frame() {
                return Ok(frame);
            }
            let n = self.stdout.read(&mut self.chunk).await?;
            if n == 0 {
                return Err(VigilError::stream_unavailable("ffmpeg output ended"));
            }
            self.parser.push(&self.chunk[..n]);
        }
    }
}

#[async_trait]
impl FrameStream for FfmpegStream {
    async fn next_frame(&mut self) -> Result<Bytes> {
        if let Some(frame) = self.first_frame.take() {
            return Ok(frame);
        }
        match tokio::time::timeout(self.read_timeout, self.read_jpeg()).await {
            Ok(result) => result,
            Err(_) => Err(VigilError::stream_unavailable(format!(
                "no frame within {:?}",
                self.read_timeout
            ))),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("[{}] ffmpeg already exited: {}", self.camera_id, e);
        }
    }
}
