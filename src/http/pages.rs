//! Index page and JSON status endpoint

use async_trait::async_trait;
use serde::Serialize;

use super::{respond, ByteSink, HttpError, HttpRequest, RequestHandler};
use crate::capture::{CaptureMonitor, CaptureStats};
use crate::pool::FramePool;
use crate::scheduler::{SchedulerHandle, SchedulerReport};

/// Landing page linking the stream endpoints
pub struct IndexHandler {
    page: String,
}

impl IndexHandler {
    pub fn new(stream_path: &str, still_path: &str, rtsp_url: Option<&str>) -> Self {
        let rtsp = rtsp_url
            .map(|url| format!("    <p>RTSP: <code>{}</code></p>\n", url))
            .unwrap_or_default();

        let page = format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>camstream</title>
    <style>
        body {{ font-family: sans-serif; margin: 20px; background: #111; color: #eee; }}
        img {{ max-width: 100%; border: 1px solid #444; }}
        a {{ color: #6af; }}
    </style>
</head>
<body>
    <h1>camstream</h1>
    <img src="{stream}" alt="live stream">
    <p><a href="{stream}">Stream</a> | <a href="{still}">Still</a> | <a href="/status">Status</a></p>
{rtsp}</body>
</html>"#,
            stream = stream_path,
            still = still_path,
            rtsp = rtsp,
        );

        Self { page }
    }
}

#[async_trait]
impl RequestHandler for IndexHandler {
    async fn handle(&self, _request: HttpRequest, mut sink: Box<dyn ByteSink>) -> Result<(), HttpError> {
        respond(&mut *sink, 200, "OK", "text/html; charset=utf-8", self.page.as_bytes()).await
    }
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    pub slot_size: usize,
    pub free_slots: usize,
    pub exhaustions: u64,
}

impl PoolStatus {
    pub fn from_pool(pool: &FramePool) -> Self {
        Self {
            capacity: pool.capacity(),
            slot_size: pool.slot_size(),
            free_slots: pool.free_slots(),
            exhaustions: pool.exhaustions(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub scheduler: SchedulerReport,
    pub pool: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureStats>,
}

/// Serves scheduler, pool and capture statistics as JSON
pub struct StatusHandler {
    scheduler: SchedulerHandle,
    pool: FramePool,
    capture: Option<CaptureMonitor>,
}

impl StatusHandler {
    pub fn new(scheduler: SchedulerHandle, pool: FramePool, capture: Option<CaptureMonitor>) -> Self {
        Self {
            scheduler,
            pool,
            capture,
        }
    }
}

#[async_trait]
impl RequestHandler for StatusHandler {
    async fn handle(&self, _request: HttpRequest, mut sink: Box<dyn ByteSink>) -> Result<(), HttpError> {
        let scheduler = match self.scheduler.report().await {
            Ok(report) => report,
            Err(e) => {
                let body = format!("{}", e);
                return respond(&mut *sink, 503, "Service Unavailable", "text/plain", body.as_bytes())
                    .await;
            }
        };

        let status = StatusBody {
            scheduler,
            pool: PoolStatus::from_pool(&self.pool),
            capture: self.capture.as_ref().map(CaptureMonitor::stats),
        };

        match serde_json::to_vec_pretty(&status) {
            Ok(body) => respond(&mut *sink, 200, "OK", "application/json", &body).await,
            Err(e) => {
                let body = format!("{}", e);
                respond(&mut *sink, 500, "Internal Server Error", "text/plain", body.as_bytes()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_links() {
        let index = IndexHandler::new("/stream", "/still", Some("rtsp://cam:554/mjpeg/1"));
        assert!(index.page.contains(r#"<img src="/stream""#));
        assert!(index.page.contains(r#"href="/still""#));
        assert!(index.page.contains("rtsp://cam:554/mjpeg/1"));

        let no_rtsp = IndexHandler::new("/s", "/p", None);
        assert!(!no_rtsp.page.contains("RTSP"));
    }

    #[test]
    fn test_pool_status() {
        let pool = FramePool::new(3, 128);
        let _held = pool.acquire().unwrap();

        let status = PoolStatus::from_pool(&pool);
        assert_eq!(status.capacity, 3);
        assert_eq!(status.slot_size, 128);
        assert_eq!(status.free_slots, 2);
    }
}
