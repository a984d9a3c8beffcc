//! Wires capture, pool, scheduler and the two transports together

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::capture::{build_source, CaptureLoop, CaptureStats};
use crate::config::Config;
use crate::error::Result;
use crate::http::{IndexHandler, MjpegHandler, StatusHandler, StillHandler, WebServer};
use crate::pool::FramePool;
use crate::rtsp::server::RtspSettings;
use crate::rtsp::RtspServer;
use crate::scheduler::{Scheduler, SchedulerHandle, SchedulerSettings};

/// Frames the capture thread may hand over before the scheduler catches up
const CAPTURE_QUEUE: usize = 2;

/// A running streaming subsystem
pub struct StreamComponent {
    config: Config,
    pool: FramePool,
    capture: CaptureLoop,
    scheduler: SchedulerHandle,
    scheduler_task: Option<JoinHandle<()>>,
    rtsp: Option<RtspServer>,
    rtsp_addr: Option<SocketAddr>,
}

impl StreamComponent {
    /// Starts capture, the scheduler and the RTSP listener, and mounts the
    /// HTTP handlers on `web`. The web server's own lifecycle stays with the
    /// caller.
    pub async fn setup(config: Config, web: &WebServer) -> Result<Self> {
        config.validate()?;
        let source = build_source(&config.camera)?;

        let (slot_count, slot_size) = config.pool.resolve(config.stream.psram);
        let pool = FramePool::new(slot_count, slot_size);
        let demand = Arc::new(AtomicUsize::new(0));

        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_QUEUE);
        let (scheduler, handle) = Scheduler::new(
            SchedulerSettings::from_config(&config),
            pool.clone(),
            capture_rx,
            Arc::clone(&demand),
        );
        let scheduler_task = scheduler.spawn();

        let mut capture = CaptureLoop::new(pool.clone(), config.camera.fps, demand);
        capture.start(source, capture_tx)?;

        let (rtsp, rtsp_addr) = if config.rtsp.enabled {
            let server = RtspServer::new(RtspSettings::from_config(&config), handle.clone());
            let addr = server.start().await?;
            (Some(server), Some(addr))
        } else {
            (None, None)
        };

        if config.http.enabled {
            let http = &config.http;
            web.add_handler(
                &http.stream_path,
                Arc::new(MjpegHandler::new(handle.clone(), http.queue_depth, http.max_fps)),
            );
            web.add_handler(&http.still_path, Arc::new(StillHandler::new(handle.clone())));
            web.add_handler(
                "/status",
                Arc::new(StatusHandler::new(
                    handle.clone(),
                    pool.clone(),
                    Some(capture.monitor()),
                )),
            );
            if !web.has_handler("/") {
                let rtsp_url = config
                    .rtsp
                    .enabled
                    .then(|| format!("rtsp://<device>:{}{}", config.rtsp.port, config.rtsp.path));
                web.add_handler(
                    "/",
                    Arc::new(IndexHandler::new(
                        &http.stream_path,
                        &http.still_path,
                        rtsp_url.as_deref(),
                    )),
                );
            }
        }

        let component = Self {
            config,
            pool,
            capture,
            scheduler: handle,
            scheduler_task: Some(scheduler_task),
            rtsp,
            rtsp_addr,
        };
        component.dump_config();
        Ok(component)
    }

    pub fn dump_config(&self) {
        let c = &self.config;
        info!(
            source = ?c.camera.source,
            frame_size = %c.camera.frame_size,
            fps = c.camera.fps,
            quality = c.camera.quality,
            "Camera"
        );
        info!(
            slots = self.pool.capacity(),
            slot_size = self.pool.slot_size(),
            psram = c.stream.psram,
            "Frame pool"
        );
        match self.rtsp_addr {
            Some(addr) => info!(
                addr = %addr,
                path = %c.rtsp.path,
                mtu = c.rtsp.mtu,
                max_sessions = c.rtsp.max_sessions,
                timeout_s = c.rtsp.session_timeout_seconds,
                "RTSP"
            ),
            None => info!("RTSP disabled"),
        }
        if c.http.enabled {
            info!(
                stream = %c.http.stream_path,
                still = %c.http.still_path,
                max_fps = c.http.max_fps,
                max_clients = c.http.max_clients,
                "HTTP MJPEG"
            );
        } else {
            info!("HTTP MJPEG disabled");
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn rtsp_addr(&self) -> Option<SocketAddr> {
        self.rtsp_addr
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    /// Stops the listener, every session and the capture thread
    pub async fn shutdown(mut self) {
        info!("Stopping stream component");

        if let Some(rtsp) = self.rtsp.take() {
            rtsp.stop().await;
        }

        self.scheduler.shutdown().await;
        if let Some(task) = self.scheduler_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }

        self.capture.stop().await;

        let stats = self.capture.stats();
        info!(
            captured = stats.frames_captured,
            skipped = stats.frames_skipped,
            errors = stats.capture_errors,
            "Stream component stopped"
        );
    }
}
