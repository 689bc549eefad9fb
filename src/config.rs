use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tracing::info;

use crate::errors::{Result, StreamError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub cameras: HashMap<String, CameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_url: Option<String>, // Base for WebSocket URLs handed to clients, e.g. "wss://cams.example.org"
    pub api_key: Option<String>,    // Required in the `api-key` header of plain HTTP requests when set
    pub cors_allow_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize, // Frames buffered between capture thread and fan-out task
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64, // 0 = wait forever
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize, // Largest JPEG accepted from ffmpeg, in bytes
}

/// A camera is addressed either by an explicit `url` or by the network
/// address plus RTSP credentials of the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub stream_path: Option<String>,
}

fn default_frame_queue_capacity() -> usize { 8 }
fn default_send_timeout_ms() -> u64 { 5000 }
fn default_jpeg_quality() -> u8 { 80 }
fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_rtsp_transport() -> String { "tcp".to_string() }
fn default_max_frame_size() -> usize { crate::capture::DEFAULT_MAX_FRAME_SIZE }

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            frame_queue_capacity: default_frame_queue_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            jpeg_quality: default_jpeg_quality(),
            ffmpeg_path: default_ffmpeg_path(),
            rtsp_transport: default_rtsp_transport(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl RelayConfig {
    pub fn send_timeout(&self) -> Option<Duration> {
        if self.send_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.send_timeout_ms))
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let cameras = HashMap::new(); // No default cameras - must be configured

        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                public_url: None,
                api_key: None,
                cors_allow_origin: Some("*".to_string()),
            },
            relay: RelayConfig::default(),
            cameras,
        }
    }
}

impl ServerConfig {
    /// Base URL clients use to open stream WebSockets.
    pub fn websocket_base(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                // A wildcard bind address is not reachable by clients
                let host = if self.host == "0.0.0.0" { "localhost" } else { self.host.as_str() };
                format!("ws://{}:{}", host, self.port)
            }
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.validate()?;
        info!("Loaded configuration from {} ({} cameras)", path, config.cameras.len());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.frame_queue_capacity == 0 {
            return Err(StreamError::config("relay.frame_queue_capacity must be at least 1"));
        }
        if !(1..=100).contains(&self.relay.jpeg_quality) {
            return Err(StreamError::config(format!(
                "relay.jpeg_quality must be between 1 and 100, got {}",
                self.relay.jpeg_quality
            )));
        }
        for (name, camera) in &self.cameras {
            if camera.url.is_none() && camera.host.is_none() {
                return Err(StreamError::config(format!(
                    "camera '{}' needs either 'url' or 'host'",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [cameras.garden]
            host = "192.168.1.20"
            username = "viewer"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.frame_queue_capacity, 8);
        assert_eq!(config.relay.jpeg_quality, 80);
        assert_eq!(config.relay.max_frame_size, 10 * 1024 * 1024);
        assert_eq!(config.relay.send_timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(config.cameras["garden"].host.as_deref(), Some("192.168.1.20"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.relay.frame_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cameras.insert("empty".to_string(), CameraConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_send_timeout_disables_it() {
        let relay = RelayConfig { send_timeout_ms: 0, ..RelayConfig::default() };
        assert_eq!(relay.send_timeout(), None);
    }

    #[test]
    fn test_websocket_base() {
        let mut server = Config::default().server;
        assert_eq!(server.websocket_base(), "ws://localhost:8000");

        server.public_url = Some("wss://cams.example.org/".to_string());
        assert_eq!(server.websocket_base(), "wss://cams.example.org");
    }
}
