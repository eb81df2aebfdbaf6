use std::time::Duration;
use serde::{Deserialize, Deserializer};
use crate::errors::{Result, VigilError};

/// Parse a duration string like "500ms", "1s", "30s", "10m" into a std Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(VigilError::config("Empty duration string"));
    }

    let duration = humantime::parse_duration(s)
        .map_err(|e| VigilError::config(format!("Invalid duration '{}': {}", s, e)))?;

    if duration.is_zero() {
        return Err(VigilError::config("Duration must be positive"));
    }

    Ok(duration)
}

/// Serde adapter for duration fields written as humantime strings
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Interval between frames for a frames-per-second rate; non-positive rates fall back to 1 fps
pub fn frame_interval(fps: f32) -> Duration {
    if fps.is_finite() && fps > 0.0 {
        Duration::from_secs_f64(1.0 / fps as f64)
    } else {
        Duration::from_secs(1)
    }
}
