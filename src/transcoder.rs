use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::TranscodingConfig;
use crate::errors::{Result, VigilError};

/// Converts a raw clip into a web-playable file, returning the new path
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, input: &Path) -> Result<PathBuf>;
}

/// H.264/MP4 transcoding through an external ffmpeg binary
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    video_codec: String,
    preset: String,
    input_fps: f32,
}

impl FfmpegTranscoder {
    pub fn new(config: &TranscodingConfig, input_fps: f32) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            video_codec: config.video_codec.clone(),
            preset: config.preset.clone(),
            input_fps,
        }
    }

    fn args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(), "error".to_string(),
            "-f".to_string(), "mjpeg".to_string(),
            "-framerate".to_string(), self.input_fps.to_string(),
            "-i".to_string(), input.to_string_lossy().to_string(),
            "-c:v".to_string(), self.video_codec.clone(),
            "-preset".to_string(), self.preset.clone(),
            "-pix_fmt".to_string(), "yuv420p".to_string(),
            "-movflags".to_string(), "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

/// `clip.mjpeg` becomes `clip.mp4`; an input that is already `.mp4` gets a `_web` suffix
pub fn output_path_for(input: &Path) -> PathBuf {
    let is_mp4 = input.extension().and_then(|e| e.to_str()) == Some("mp4");
    if is_mp4 {
        let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("recording");
        input.with_file_name(format!("{}_web.mp4", stem))
    } else {
        input.with_extension("mp4")
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path) -> Result<PathBuf> {
        let output_path = output_path_for(input);
        let args = self.args(input, &output_path);
        debug!("Running {} {}", self.ffmpeg_path, args.join(" "));

        let output = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VigilError::transcode(format!("failed to run {}: {}", self.ffmpeg_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VigilError::transcode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        info!("Transcoded {} to {}", input.display(), output_path.display());
        Ok(output_path)
    }
}
