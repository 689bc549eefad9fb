use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Camera not found: {name}")]
    CameraNotFound { name: String },

    #[error("Source unreachable: {message}")]
    SourceUnreachable { message: String },

    #[error("Source interrupted: {message}")]
    SourceInterrupted { message: String },

    #[error("Frame encoding error: {message}")]
    Encode { message: String },

    #[error("Send failed: {message}")]
    Send { message: String },

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

    #[error("Image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn camera_not_found(name: impl Into<String>) -> Self {
        Self::CameraNotFound { name: name.into() }
    }

    pub fn source_unreachable(message: impl Into<String>) -> Self {
        Self::SourceUnreachable { message: message.into() }
    }

    pub fn source_interrupted(message: impl Into<String>) -> Self {
        Self::SourceInterrupted { message: message.into() }
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode { message: message.into() }
    }

    pub fn send(message: impl Into<String>) -> Self {
        Self::Send { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
