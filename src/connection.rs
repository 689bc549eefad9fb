use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One viewer's duplex text channel.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Fails once the peer is gone.
    async fn send_text(&self, text: String) -> Result<()>;

    /// Ends the connection from our side after a terminal notice.
    async fn close(&self, _reason: &str) {}
}

/// Why a stream stopped producing frames on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFailure {
    SourceUnreachable,
    SourceInterrupted,
}

/// Terminal message sent once to every viewer of a failed stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamNotice {
    Error { kind: StreamFailure, message: String },
}

impl StreamNotice {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_json_shape() {
        let notice = StreamNotice::Error {
            kind: StreamFailure::SourceUnreachable,
            message: "camera offline".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&notice.to_text().unwrap()).unwrap();

        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "source_unreachable");
        assert_eq!(value["message"], "camera offline");
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
