//! On-device MJPEG streaming over RTSP/RTP and HTTP
//!
//! Frames come from a single capture loop into a fixed pool of
//! reference-counted buffers. One scheduler task fans each frame out to every
//! active client without copying it:
//! - RTSP clients receive RFC 2435 RTP/JPEG over UDP or interleaved TCP
//! - HTTP clients receive a `multipart/x-mixed-replace` stream
//!
//! # Example
//!
//! ```no_run
//! use camstream::config::Config;
//! use camstream::http::WebServer;
//! use camstream::StreamComponent;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("config.toml")?;
//! let web = WebServer::new(config.http.bind.clone(), config.http.port);
//! let component = StreamComponent::setup(config, &web).await?;
//! web.start().await?;
//! // ...
//! component.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod component;
pub mod config;
pub mod error;
pub mod http;
pub mod pool;
pub mod rtp;
pub mod rtsp;
pub mod scheduler;

// Re-exports for convenience
pub use capture::{CaptureLoop, CaptureStats, FrameSource};
pub use component::StreamComponent;
pub use error::StreamError;
pub use pool::{Frame, FramePool, PoolError};
pub use rtp::{PacketizerStats, RtpPacketizer};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerStats};
