use std::collections::HashMap;
use tracing::debug;

use crate::config::CameraConfig;
use crate::errors::{Result, StreamError};

const DEFAULT_RTSP_PORT: u16 = 554;
const DEFAULT_STREAM_PATH: &str = "stream2";

/// Resolves a camera name to the locator its video is read from.
pub trait CameraGateway: Send + Sync {
    fn stream_locator(&self, camera: &str) -> Result<String>;
}

/// Gateway backed by the `[cameras.*]` configuration tables.
pub struct ConfigGateway {
    cameras: HashMap<String, CameraConfig>,
}

impl ConfigGateway {
    pub fn new(cameras: HashMap<String, CameraConfig>) -> Self {
        Self { cameras }
    }
}

impl CameraGateway for ConfigGateway {
    fn stream_locator(&self, camera: &str) -> Result<String> {
        let config = self
            .cameras
            .get(camera)
            .ok_or_else(|| StreamError::camera_not_found(camera))?;

        if let Some(url) = &config.url {
            return Ok(url.clone());
        }

        let host = config
            .host
            .as_deref()
            .ok_or_else(|| StreamError::config(format!("camera '{}' has no host", camera)))?;
        let port = config.port.unwrap_or(DEFAULT_RTSP_PORT);
        let path = config
            .stream_path
            .as_deref()
            .unwrap_or(DEFAULT_STREAM_PATH)
            .trim_start_matches('/');

        let mut url = url::Url::parse(&format!("rtsp://{}:{}/", host, port))?;
        url.set_path(&format!("/{}", path));
        if let Some(username) = &config.username {
            url.set_username(username)
                .map_err(|_| StreamError::config(format!("camera '{}' cannot carry a username", camera)))?;
            url.set_password(config.password.as_deref())
                .map_err(|_| StreamError::config(format!("camera '{}' cannot carry a password", camera)))?;
        }

        debug!("Resolved camera '{}' to rtsp://{}:{}/{}", camera, host, port, path);
        Ok(url.to_string())
    }
}
