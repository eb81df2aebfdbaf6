use serde::{Deserialize, Serialize};
use std::fs;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use crate::errors::{Result, VigilError};
use crate::processing::ProcessingMode;
use crate::utils::deserialize_duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_cameras_directory")]
    pub cameras_directory: String,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub transcoding: TranscodingConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    pub mqtt: Option<MqttConfig>,
}

/// One camera definition file; the file stem is the camera id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub enabled: Option<bool>,
    pub url: String,
    pub name: Option<String>,
    pub location: Option<String>,
    pub transport: Option<String>,
}

impl CameraConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_target_fps")]
    pub target_fps: f32,
    #[serde(default)]
    pub mode: ProcessingMode,
    #[serde(default = "default_preview_interval", deserialize_with = "deserialize_duration")]
    pub preview_interval: Duration,
    #[serde(default = "default_absence_window", deserialize_with = "deserialize_duration")]
    pub presence_absence_window: Duration,
    /// CSV file receiving one row per new presence; empty disables it
    #[serde(default = "default_detection_log")]
    pub detection_log: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_detector_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_detector_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_streak_threshold")]
    pub start_threshold: u32,
    #[serde(default = "default_streak_threshold")]
    pub stop_threshold: u32,
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: u32,
    #[serde(default = "default_target_fps")]
    pub recording_fps: f32,
    #[serde(default = "default_min_duration", deserialize_with = "deserialize_duration")]
    pub min_duration: Duration,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_live_queue_size")]
    pub live_queue_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_preset")]
    pub preset: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_one_second", deserialize_with = "deserialize_duration")]
    pub reconnect_interval: Duration,
    #[serde(default = "default_max_failed_reads")]
    pub max_failed_reads: u32,
    #[serde(default = "default_one_second", deserialize_with = "deserialize_duration")]
    pub failed_read_backoff: Duration,
    #[serde(default = "default_open_timeout", deserialize_with = "deserialize_duration")]
    pub open_timeout: Duration,
    #[serde(default = "default_one_second", deserialize_with = "deserialize_duration")]
    pub read_timeout: Duration,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    pub chunk_read_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    pub publish_preview: Option<bool>,
    pub max_packet_size: Option<usize>,
}

fn default_cameras_directory() -> String { "cameras".to_string() }
fn default_target_fps() -> f32 { 1.0 }
fn default_preview_interval() -> Duration { Duration::from_secs(1) }
fn default_absence_window() -> Duration { Duration::from_secs(30) }
fn default_detection_log() -> String { "auto_recordings/detections.csv".to_string() }
fn default_pool_size() -> usize { 4 }
fn default_detector_endpoint() -> String { "http://127.0.0.1:9000/detect".to_string() }
fn default_labels() -> Vec<String> { vec!["person".to_string()] }
fn default_confidence_threshold() -> f32 { 0.45 }
fn default_detector_timeout() -> Duration { Duration::from_secs(5) }
fn default_streak_threshold() -> u32 { 5 }
fn default_buffer_seconds() -> u32 { 30 }
fn default_min_duration() -> Duration { Duration::from_secs(30) }
fn default_output_dir() -> String { "auto_recordings".to_string() }
fn default_database_path() -> String { "auto_recordings/recordings.db".to_string() }
fn default_live_queue_size() -> usize { 64 }
fn default_true() -> bool { true }
fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_video_codec() -> String { "libx264".to_string() }
fn default_preset() -> String { "veryfast".to_string() }
fn default_one_second() -> Duration { Duration::from_secs(1) }
fn default_max_failed_reads() -> u32 { 5 }
fn default_open_timeout() -> Duration { Duration::from_secs(10) }
fn default_transport() -> String { "tcp".to_string() }
fn default_jpeg_quality() -> u8 { 5 }
fn default_keep_alive_secs() -> u64 { 30 }

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            mode: ProcessingMode::default(),
            preview_interval: default_preview_interval(),
            presence_absence_window: default_absence_window(),
            detection_log: default_detection_log(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            endpoint: default_detector_endpoint(),
            labels: default_labels(),
            confidence_threshold: default_confidence_threshold(),
            timeout: default_detector_timeout(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            start_threshold: default_streak_threshold(),
            stop_threshold: default_streak_threshold(),
            buffer_seconds: default_buffer_seconds(),
            recording_fps: default_target_fps(),
            min_duration: default_min_duration(),
            output_dir: default_output_dir(),
            database_path: default_database_path(),
            live_queue_size: default_live_queue_size(),
        }
    }
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ffmpeg_path: default_ffmpeg_path(),
            video_codec: default_video_codec(),
            preset: default_preset(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: default_one_second(),
            max_failed_reads: default_max_failed_reads(),
            failed_read_backoff: default_one_second(),
            open_timeout: default_open_timeout(),
            read_timeout: default_one_second(),
            transport: default_transport(),
            jpeg_quality: default_jpeg_quality(),
            ffmpeg_path: default_ffmpeg_path(),
            chunk_read_size: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cameras_directory: default_cameras_directory(),
            processing: ProcessingConfig::default(),
            detector: DetectorConfig::default(),
            recording: RecordingConfig::default(),
            transcoding: TranscodingConfig::default(),
            stream: StreamConfig::default(),
            mqtt: None,
        }
    }
}

impl RecordingConfig {
    /// Maximum number of frames the pre-roll buffer may hold
    pub fn buffer_capacity(&self) -> usize {
        let frames = (self.recording_fps.max(0.0) * self.buffer_seconds as f32).round() as usize;
        frames.max(1)
    }
}

impl MqttConfig {
    pub fn substitute_variables(&mut self) {
        let hostname = gethostname::gethostname()
            .to_string_lossy()
            .to_string();

        self.base_topic = self.base_topic.replace("${hostname}", &hostname);
        self.client_id = self.client_id.replace("${hostname}", &hostname);

        info!("MQTT config substituted: base_topic = {}, client_id = {}",
              self.base_topic, self.client_id);
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;

        if let Some(ref mut mqtt) = config.mqtt {
            mqtt.substitute_variables();
        }

        Ok(config)
    }

    /// Parse and validate a config file without side effects
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.detector.pool_size == 0 {
            return Err(VigilError::config("detector.pool_size must be at least 1"));
        }
        if self.recording.start_threshold == 0 || self.recording.stop_threshold == 0 {
            return Err(VigilError::config("recording thresholds must be at least 1"));
        }
        if !(self.processing.target_fps > 0.0) || !(self.recording.recording_fps > 0.0) {
            return Err(VigilError::config("frame rates must be positive"));
        }
        // Clips are encoded at recording_fps but receive one frame per processed frame
        if (self.processing.target_fps - self.recording.recording_fps).abs() > f32::EPSILON {
            return Err(VigilError::config(format!(
                "recording.recording_fps ({}) must equal processing.target_fps ({})",
                self.recording.recording_fps, self.processing.target_fps
            )));
        }
        if self.stream.max_failed_reads == 0 {
            return Err(VigilError::config("stream.max_failed_reads must be at least 1"));
        }
        Ok(())
    }

    pub fn load_cameras_from_directory(cameras_dir: &str) -> Result<HashMap<String, CameraConfig>> {
        let mut cameras = HashMap::new();

        if !Path::new(cameras_dir).exists() {
            warn!("Cameras directory '{}' does not exist, no cameras will be loaded", cameras_dir);
            return Ok(cameras);
        }

        for entry in fs::read_dir(cameras_dir)? {
            let path = entry?.path();
            let Some(camera_id) = camera_id_from_path(&path) else {
                continue;
            };

            match load_camera_file(&path) {
                Ok(camera_config) => {
                    info!("Loaded camera configuration: {}", camera_id);
                    cameras.insert(camera_id, camera_config);
                }
                Err(e) => {
                    warn!("Skipping camera config file {}: {}", path.display(), e);
                }
            }
        }

        Ok(cameras)
    }
}

/// Camera id for a definition file, or None when the path is not a camera file
pub fn camera_id_from_path(path: &Path) -> Option<String> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("json") | Some("toml") => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

pub fn load_camera_file(path: &Path) -> Result<CameraConfig> {
    let content = fs::read_to_string(path)?;
    let camera_config = match path.extension().and_then(|s| s.to_str()) {
        Some("toml") => toml::from_str::<CameraConfig>(&content)?,
        _ => serde_json::from_str::<CameraConfig>(&content)?,
    };
    Ok(camera_config)
}
