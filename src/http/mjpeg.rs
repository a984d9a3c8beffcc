//! Multipart MJPEG stream and single-frame still endpoints

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{respond, ByteSink, HttpError, HttpRequest, RequestHandler};
use crate::pool::Frame;
use crate::rtsp::SessionError;
use crate::scheduler::{SchedulerError, SchedulerHandle};

/// Multipart boundary token
pub const BOUNDARY: &str = "imgboundary";

const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace;boundary=imgboundary";

/// How long a still request waits for the next captured frame
const STILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Head of the never-ending multipart response
pub fn stream_header() -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nAccess-Control-Allow-Origin: *\r\nCache-Control: no-cache, no-store, must-revalidate\r\nPragma: no-cache\r\nConnection: close\r\n\r\n",
        STREAM_CONTENT_TYPE
    )
}

/// Headers that precede one JPEG in the stream
pub fn part_header(len: usize) -> String {
    format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY, len
    )
}

/// Writes one multipart part and flushes
pub async fn write_part(sink: &mut dyn ByteSink, jpeg: &[u8]) -> std::io::Result<()> {
    sink.write_all(part_header(jpeg.len()).as_bytes()).await?;
    sink.write_all(jpeg).await?;
    sink.write_all(b"\r\n").await?;
    sink.flush().await
}

async fn refuse(sink: &mut dyn ByteSink, error: SchedulerError) -> Result<(), HttpError> {
    match error {
        SchedulerError::Session(SessionError::LimitReached(max)) => {
            debug!(max, "HTTP client limit reached");
            respond(sink, 503, "Service Unavailable", "text/plain", b"Already streaming!").await
        }
        other => {
            warn!(error = %other, "Could not register HTTP client");
            respond(sink, 503, "Service Unavailable", "text/plain", b"Stream unavailable").await
        }
    }
}

/// Serves the live multipart stream
pub struct MjpegHandler {
    scheduler: SchedulerHandle,
    queue_depth: usize,
    min_interval: Duration,
}

impl MjpegHandler {
    pub fn new(scheduler: SchedulerHandle, queue_depth: usize, max_fps: u32) -> Self {
        let min_interval = if max_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / max_fps
        };

        Self {
            scheduler,
            queue_depth: queue_depth.max(1),
            min_interval,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    async fn pump(
        &self,
        sink: &mut dyn ByteSink,
        frames: &mut mpsc::Receiver<Frame>,
    ) -> std::io::Result<u64> {
        sink.write_all(stream_header().as_bytes()).await?;
        sink.flush().await?;

        let mut sent = 0u64;
        let mut last_sent: Option<Instant> = None;

        while let Some(frame) = frames.recv().await {
            if let Some(last) = last_sent {
                if last.elapsed() < self.min_interval {
                    continue;
                }
            }

            write_part(sink, frame.payload()).await?;
            last_sent = Some(Instant::now());
            sent += 1;
        }

        Ok(sent)
    }
}

#[async_trait]
impl RequestHandler for MjpegHandler {
    async fn handle(&self, request: HttpRequest, mut sink: Box<dyn ByteSink>) -> Result<(), HttpError> {
        let (tx, mut rx) = mpsc::channel(self.queue_depth);

        let id = match self.scheduler.open_http(request.peer, false, tx).await {
            Ok(id) => id,
            Err(e) => return refuse(&mut *sink, e).await,
        };

        info!(session = %id, peer = %request.peer, "MJPEG client connected");

        let result = self.pump(&mut *sink, &mut rx).await;

        // Deregister before draining so no more frames are queued
        self.scheduler.close(id).await;
        drop(rx);

        match result {
            Ok(sent) => {
                info!(session = %id, frames = sent, "MJPEG stream ended");
                Ok(())
            }
            Err(e) => {
                info!(session = %id, error = %e, "MJPEG client disconnected");
                Err(e.into())
            }
        }
    }
}

/// Serves the next captured frame as a single JPEG
pub struct StillHandler {
    scheduler: SchedulerHandle,
}

impl StillHandler {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl RequestHandler for StillHandler {
    async fn handle(&self, request: HttpRequest, mut sink: Box<dyn ByteSink>) -> Result<(), HttpError> {
        let (tx, mut rx) = mpsc::channel(1);

        let id = match self.scheduler.open_http(request.peer, true, tx).await {
            Ok(id) => id,
            Err(e) => return refuse(&mut *sink, e).await,
        };

        match tokio::time::timeout(STILL_TIMEOUT, rx.recv()).await {
            Ok(Some(frame)) => {
                debug!(session = %id, bytes = frame.len(), "Serving still");
                respond(&mut *sink, 200, "OK", "image/jpeg", frame.payload()).await
            }
            Ok(None) => {
                respond(&mut *sink, 503, "Service Unavailable", "text/plain", b"No frame").await
            }
            Err(_) => {
                self.scheduler.close(id).await;
                warn!(session = %id, "Timed out waiting for a still frame");
                respond(&mut *sink, 504, "Gateway Timeout", "text/plain", b"No frame").await
            }
        }
    }
}
