//! Crate-level error for the streaming component

use thiserror::Error;

use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::http::HttpError;
use crate::pool::PoolError;
use crate::rtp::PacketizerError;
use crate::rtsp::SessionError;
use crate::scheduler::SchedulerError;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("packetizer error: {0}")]
    Packetizer(#[from] PacketizerError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("RTSP listener error: {0}")]
    Rtsp(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
