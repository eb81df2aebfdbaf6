use thiserror::Error;

#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Stream unavailable: {message}")]
    StreamUnavailable { message: String },

    #[error("Detector error: {message}")]
    Detector { message: String },

    #[error("Recorder IO error: {message}")]
    RecorderIo { message: String },

    #[error("Transcode error: {message}")]
    Transcode { message: String },

    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("MQTT client error: {source}")]
    MqttClient {
        #[from]
        source: rumqttc::ClientError,
    },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("Image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
}

impl VigilError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn stream_unavailable(message: impl Into<String>) -> Self {
        Self::StreamUnavailable { message: message.into() }
    }

    pub fn detector(message: impl Into<String>) -> Self {
        Self::Detector { message: message.into() }
    }

    pub fn recorder_io(message: impl Into<String>) -> Self {
        Self::RecorderIo { message: message.into() }
    }

    pub fn transcode(message: impl Into<String>) -> Self {
        Self::Transcode { message: message.into() }
    }

    pub fn mqtt(message: impl Into<String>) -> Self {
        Self::Mqtt { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;
