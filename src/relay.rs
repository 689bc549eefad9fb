//! Multi-viewer frame relay.
//!
//! Each watched locator gets one [`Stream`]: a capture thread that reads and
//! encodes frames, and a fan-out task on the Tokio runtime that broadcasts
//! them as data URIs to every subscribed [`Connection`]. The two sides meet
//! in a bounded mpsc queue; the capture thread enqueues with
//! `blocking_send`, so a slow fan-out pass applies backpressure to capture
//! instead of growing memory.
//!
//! Registry invariant: a stream present in the registry always has at least
//! one subscriber. Every path that empties a subscriber list does so while
//! holding the registry lock and removes the entry in the same step.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::capture::{redact_locator, FrameSource};
use crate::config::RelayConfig;
use crate::connection::{Connection, ConnectionId, StreamFailure, StreamNotice};
use crate::errors::{Result, StreamError};
use crate::transcoder::{to_data_uri, FrameTranscoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum QueueItem {
    Frame(Bytes),
    Failed(StreamFailure, String),
}

struct Stream {
    id: StreamId,
    locator: String,
    display: String,
    subscribers: Mutex<Vec<Arc<dyn Connection>>>,
    closing: AtomicBool,
    wake: Notify,
}

impl Stream {
    fn new(id: StreamId, locator: &str) -> Self {
        Self {
            id,
            locator: locator.to_string(),
            display: redact_locator(locator),
            subscribers: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Marks the stream for teardown; both loops notice on their next check.
    fn retire(&self) {
        self.closing.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn add(&self, connection: Arc<dyn Connection>) -> usize {
        let mut subscribers = lock(&self.subscribers);
        let id = connection.id();
        if !subscribers.iter().any(|c| c.id() == id) {
            subscribers.push(connection);
        }
        subscribers.len()
    }

    /// Returns the remaining count, or `None` when `id` was not subscribed.
    fn remove(&self, id: ConnectionId) -> Option<usize> {
        let mut subscribers = lock(&self.subscribers);
        let index = subscribers.iter().position(|c| c.id() == id)?;
        subscribers.remove(index);
        Some(subscribers.len())
    }

    fn contains(&self, id: ConnectionId) -> bool {
        lock(&self.subscribers).iter().any(|c| c.id() == id)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        lock(&self.subscribers).clone()
    }

    fn len(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RelayInner {
    source: Arc<dyn FrameSource>,
    config: RelayConfig,
    streams: Mutex<HashMap<String, Arc<Stream>>>,
    next_id: AtomicU64,
}

/// Shared handle to the relay; clones refer to the same registry.
#[derive(Clone)]
pub struct StreamRelay {
    inner: Arc<RelayInner>,
}

impl StreamRelay {
    pub fn new(source: Arc<dyn FrameSource>, config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                source,
                config,
                streams: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `connection` as a viewer of `locator`, starting the stream
    /// if nobody was watching it. Never waits for frames.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, locator: &str, connection: Arc<dyn Connection>) {
        let connection_id = connection.id();
        let stream = {
            let mut streams = lock(&self.inner.streams);
            if let Some(stream) = streams.get(locator) {
                let count = stream.add(connection);
                info!(
                    "Added client {} to stream {} ({}). Total clients: {}",
                    connection_id, stream.id, stream.display, count
                );
                return;
            }

            let id = StreamId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
            let stream = Arc::new(Stream::new(id, locator));
            stream.add(connection);
            streams.insert(locator.to_string(), stream.clone());
            stream
        };

        info!(
            "Added client {} to new stream {} ({})",
            connection_id, stream.id, stream.display
        );
        self.inner.clone().start(stream);
    }

    /// Removes `connection_id` from `locator`'s viewers; the last one out
    /// stops the stream. Unknown locators and ids are ignored.
    pub fn unsubscribe(&self, locator: &str, connection_id: ConnectionId) {
        self.inner.detach(locator, connection_id, None);
    }

    pub fn is_active(&self, locator: &str) -> bool {
        lock(&self.inner.streams).contains_key(locator)
    }

    pub fn subscriber_count(&self, locator: &str) -> usize {
        lock(&self.inner.streams).get(locator).map_or(0, |s| s.len())
    }

    /// Identity of the live stream for `locator`; a restarted stream gets a new id.
    pub fn stream_id(&self, locator: &str) -> Option<StreamId> {
        lock(&self.inner.streams).get(locator).map(|s| s.id)
    }

    pub fn active_streams(&self) -> Vec<String> {
        let mut locators: Vec<String> = lock(&self.inner.streams).keys().cloned().collect();
        locators.sort();
        locators
    }

    /// Stops every stream without notifying viewers. Returns how many were running.
    pub fn shutdown(&self) -> usize {
        let streams: Vec<Arc<Stream>> = lock(&self.inner.streams).drain().map(|(_, s)| s).collect();
        for stream in &streams {
            lock(&stream.subscribers).clear();
            stream.retire();
        }
        if !streams.is_empty() {
            info!("Relay shut down, stopped {} streams", streams.len());
        }
        streams.len()
    }
}

impl RelayInner {
    fn start(self: Arc<Self>, stream: Arc<Stream>) {
        let (frame_tx, frame_rx) = mpsc::channel(self.config.frame_queue_capacity.max(1));

        let source = self.source.clone();
        let transcoder = FrameTranscoder::new(self.config.jpeg_quality);
        let capture_stream = stream.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("capture-{}", stream.id.0))
            .spawn(move || capture_loop(source, transcoder, capture_stream, frame_tx));
        if let Err(e) = spawned {
            // frame_tx was dropped with the closure, so the fan-out task sees a
            // closed queue and reports the stream as interrupted.
            error!("Failed to spawn capture thread for stream {}: {}", stream.id, e);
        }

        tokio::spawn(self.fan_out(stream, frame_rx));
    }

    async fn fan_out(self: Arc<Self>, stream: Arc<Stream>, mut frame_rx: mpsc::Receiver<QueueItem>) {
        let mut frames_sent = 0u64;

        loop {
            if stream.is_closing() {
                break;
            }

            let item = tokio::select! {
                item = frame_rx.recv() => item,
                _ = stream.wake.notified() => continue,
            };

            match item {
                Some(QueueItem::Frame(jpeg)) => {
                    frames_sent += 1;
                    if frames_sent % 100 == 0 {
                        debug!("Stream {} broadcast {} frames", stream.id, frames_sent);
                    }
                    self.broadcast(&stream, to_data_uri(&jpeg)).await;
                }
                Some(QueueItem::Failed(kind, message)) => {
                    self.fail(&stream, kind, message).await;
                    break;
                }
                None => {
                    self.fail(&stream, StreamFailure::SourceInterrupted, "capture loop stopped".to_string())
                        .await;
                    break;
                }
            }
        }

        // Dropping the receiver unblocks a capture thread parked in blocking_send
        drop(frame_rx);
        info!("Stream {} ({}) stopped after {} frames", stream.id, stream.display, frames_sent);
    }

    /// One pass over the current viewers. A failed send only drops that viewer.
    async fn broadcast(&self, stream: &Stream, text: String) {
        let mut failed = Vec::new();

        for connection in stream.snapshot() {
            let id = connection.id();
            // Viewers that left while the pass was running are skipped
            if !stream.contains(id) {
                continue;
            }
            if let Err(e) = self.send(connection.as_ref(), text.clone()).await {
                debug!("Error sending frame to client {} on stream {}: {}", id, stream.id, e);
                failed.push(connection);
            }
        }

        for connection in failed {
            self.detach(&stream.locator, connection.id(), Some(stream.id));
            // Closing a slow peer may itself stall, so it runs off the broadcast path
            let limit = self.config.send_timeout();
            tokio::spawn(async move {
                match limit {
                    Some(limit) => {
                        if tokio::time::timeout(limit, connection.close("send failed")).await.is_err() {
                            debug!("Close of client {} timed out", connection.id());
                        }
                    }
                    None => connection.close("send failed").await,
                }
            });
        }
    }

    async fn send(&self, connection: &dyn Connection, text: String) -> Result<()> {
        match self.config.send_timeout() {
            Some(limit) => tokio::time::timeout(limit, connection.send_text(text))
                .await
                .map_err(|_| StreamError::send(format!("no progress within {:?}", limit)))?,
            None => connection.send_text(text).await,
        }
    }

    fn detach(&self, locator: &str, connection_id: ConnectionId, only: Option<StreamId>) {
        let mut streams = lock(&self.streams);
        let Some(stream) = streams.get(locator) else {
            return;
        };
        if only.is_some_and(|id| id != stream.id) {
            return;
        }

        match stream.remove(connection_id) {
            Some(0) => {
                info!(
                    "Removed client {} from stream {} ({}). No clients left, stopping stream",
                    connection_id, stream.id, stream.display
                );
                stream.retire();
                streams.remove(locator);
            }
            Some(remaining) => {
                info!(
                    "Removed client {} from stream {} ({}). Remaining clients: {}",
                    connection_id, stream.id, stream.display, remaining
                );
            }
            None => {}
        }
    }

    /// Ends a stream whose source gave out, telling each viewer once.
    async fn fail(&self, stream: &Stream, kind: StreamFailure, message: String) {
        let subscribers = {
            let mut streams = lock(&self.streams);
            if streams.get(&stream.locator).is_some_and(|s| s.id == stream.id) {
                streams.remove(&stream.locator);
            }
            stream.retire();
            std::mem::take(&mut *lock(&stream.subscribers))
        };
        if subscribers.is_empty() {
            return;
        }

        warn!(
            "Stream {} ({}) failed with {:?}: {}. Notifying {} clients",
            stream.id, stream.display, kind, message, subscribers.len()
        );
        let notice = StreamNotice::Error { kind, message };
        let text = match notice.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize stream notice: {}", e);
                return;
            }
        };

        for connection in subscribers {
            if let Err(e) = self.send(connection.as_ref(), text.clone()).await {
                debug!("Could not notify client {}: {}", connection.id(), e);
            }
            connection.close("stream ended").await;
        }
    }
}

fn capture_loop(
    source: Arc<dyn FrameSource>,
    transcoder: FrameTranscoder,
    stream: Arc<Stream>,
    frame_tx: mpsc::Sender<QueueItem>,
) {
    let mut reader = match source.open(&stream.locator) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("Failed to open stream {} ({}): {}", stream.id, stream.display, e);
            let _ = frame_tx.blocking_send(QueueItem::Failed(StreamFailure::SourceUnreachable, e.to_string()));
            return;
        }
    };
    info!("Capture started for stream {} ({})", stream.id, stream.display);

    let mut frame_count = 0u64;
    let failure = loop {
        if stream.is_closing() {
            break None;
        }

        match reader.read_frame() {
            Ok(Some(frame)) => match transcoder.encode(frame) {
                Ok(jpeg) => {
                    if frame_tx.blocking_send(QueueItem::Frame(jpeg)).is_err() {
                        break None;
                    }
                    frame_count += 1;
                }
                Err(e) => warn!("Dropping frame on stream {}: {}", stream.id, e),
            },
            Ok(None) => {
                break Some((StreamFailure::SourceInterrupted, "source ended".to_string()));
            }
            Err(StreamError::SourceUnreachable { message }) => {
                break Some((StreamFailure::SourceUnreachable, message));
            }
            Err(e) => break Some((StreamFailure::SourceInterrupted, e.to_string())),
        }
    };

    // Release the capture handle before reporting
    drop(reader);
    info!("Capture for stream {} ended after {} frames", stream.id, frame_count);

    if let Some((kind, message)) = failure {
        let _ = frame_tx.blocking_send(QueueItem::Failed(kind, message));
    }
}
