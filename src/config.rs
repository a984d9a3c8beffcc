//! Configuration management for camera streaming

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::capture::FrameSize;
use crate::pool::{DRAM_SLOT_COUNT, DRAM_SLOT_SIZE, PSRAM_SLOT_COUNT, PSRAM_SLOT_SIZE};
use crate::rtp::MIN_MTU;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("MTU {mtu} is below the {min} byte RTP/JPEG minimum")]
    MtuBelowOverhead { mtu: usize, min: usize },

    #[error("{field}: path must start with '/', got {path:?}")]
    InvalidPath { field: &'static str, path: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete streaming configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub rtsp: RtspConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Top-level switch and board capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Enable streaming
    #[serde(default)]
    pub enabled: bool,

    /// Board has external RAM (defaults to the `psram` build feature)
    #[serde(default = "default_psram")]
    pub psram: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            psram: default_psram(),
        }
    }
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Synthetic moving test pattern
    TestPattern,

    /// JPEG files from a directory, played in a loop
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_source")]
    pub source: SourceKind,

    /// Directory of `.jpg` files for the `directory` source
    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default)]
    pub frame_size: FrameSize,

    /// Capture rate
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            directory: None,
            frame_size: FrameSize::default(),
            fps: default_fps(),
            quality: default_quality(),
        }
    }
}

/// Frame pool sizing overrides; unset fields follow the PSRAM flag
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub slot_count: Option<usize>,

    #[serde(default)]
    pub slot_size: Option<usize>,
}

impl PoolConfig {
    /// Effective `(slot_count, slot_size)`
    pub fn resolve(&self, psram: bool) -> (usize, usize) {
        let (count, size) = if psram {
            (PSRAM_SLOT_COUNT, PSRAM_SLOT_SIZE)
        } else {
            (DRAM_SLOT_COUNT, DRAM_SLOT_SIZE)
        };
        (self.slot_count.unwrap_or(count), self.slot_size.unwrap_or(size))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtspConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_rtsp_port")]
    pub port: u16,

    /// Stream path clients put in the RTSP URL
    #[serde(default = "default_rtsp_path")]
    pub path: String,

    /// Maximum RTP packet size (bytes)
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle sessions are torn down after this many seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_seconds: u64,

    /// Frames queued per session before new ones are dropped
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_rtsp_port(),
            path: default_rtsp_path(),
            mtu: default_mtu(),
            max_sessions: default_max_sessions(),
            session_timeout_seconds: default_session_timeout(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl RtspConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    #[serde(default = "default_still_path")]
    pub still_path: String,

    /// Per-client frame rate ceiling
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_http_port(),
            stream_path: default_stream_path(),
            still_path: default_still_path(),
            max_fps: default_max_fps(),
            max_clients: default_max_clients(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Statistics reporting interval (seconds)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,

    /// How often idle sessions are checked for (milliseconds)
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,

    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stats_interval_seconds: default_stats_interval(),
            reap_interval_ms: default_reap_interval(),
            command_queue: default_command_queue(),
        }
    }
}

// Default value functions
fn default_psram() -> bool {
    cfg!(feature = "psram")
}
fn default_true() -> bool {
    true
}
fn default_source() -> SourceKind {
    SourceKind::TestPattern
}
fn default_fps() -> u32 {
    20
}
fn default_quality() -> u8 {
    80
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_rtsp_port() -> u16 {
    554
}
fn default_rtsp_path() -> String {
    "/mjpeg/1".to_string()
}
fn default_mtu() -> usize {
    1400
}
fn default_max_sessions() -> usize {
    4
}
fn default_session_timeout() -> u64 {
    60
}
fn default_queue_depth() -> usize {
    2
}
fn default_http_port() -> u16 {
    80
}
fn default_stream_path() -> String {
    "/stream".to_string()
}
fn default_still_path() -> String {
    "/still".to_string()
}
fn default_max_fps() -> u32 {
    25
}
fn default_max_clients() -> usize {
    2
}
fn default_stats_interval() -> u64 {
    10
}
fn default_reap_interval() -> u64 {
    1000
}
fn default_command_queue() -> usize {
    64
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cam = &self.camera;
        if cam.fps == 0 || cam.fps > 60 {
            return Err(ConfigError::Invalid(format!(
                "camera: FPS must be between 1 and 60, got {}",
                cam.fps
            )));
        }
        if cam.quality == 0 || cam.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "camera: quality must be between 1 and 100, got {}",
                cam.quality
            )));
        }
        if cam.source == SourceKind::Directory && cam.directory.is_none() {
            return Err(ConfigError::Invalid(
                "camera: directory source needs `directory`".to_string(),
            ));
        }

        let (slots, slot_size) = self.pool.resolve(self.stream.psram);
        if slots == 0 || slot_size == 0 {
            return Err(ConfigError::Invalid(
                "pool: slot_count and slot_size must be > 0".to_string(),
            ));
        }

        self.validate_rtsp()?;
        self.validate_http()?;

        if self.scheduler.stats_interval_seconds == 0
            || self.scheduler.reap_interval_ms == 0
            || self.scheduler.command_queue == 0
        {
            return Err(ConfigError::Invalid(
                "scheduler: intervals and queue sizes must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_rtsp(&self) -> Result<(), ConfigError> {
        let rtsp = &self.rtsp;

        if rtsp.mtu < MIN_MTU {
            return Err(ConfigError::MtuBelowOverhead {
                mtu: rtsp.mtu,
                min: MIN_MTU,
            });
        }
        if rtsp.mtu > 9000 {
            return Err(ConfigError::Invalid(format!(
                "rtsp: MTU must be at most 9000, got {}",
                rtsp.mtu
            )));
        }
        validate_path("rtsp.path", &rtsp.path)?;

        if rtsp.max_sessions == 0 || rtsp.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "rtsp: max_sessions and queue_depth must be > 0".to_string(),
            ));
        }
        if rtsp.session_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "rtsp: session_timeout_seconds must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_http(&self) -> Result<(), ConfigError> {
        let http = &self.http;

        validate_path("http.stream_path", &http.stream_path)?;
        validate_path("http.still_path", &http.still_path)?;
        if http.stream_path == http.still_path {
            return Err(ConfigError::Invalid(
                "http: stream_path and still_path must differ".to_string(),
            ));
        }

        if http.max_fps == 0 {
            return Err(ConfigError::Invalid("http: max_fps must be > 0".to_string()));
        }
        if http.max_clients == 0 || http.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "http: max_clients and queue_depth must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn validate_path(field: &'static str, path: &str) -> Result<(), ConfigError> {
    if !path.starts_with('/') || path.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidPath {
            field,
            path: path.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.stream.enabled);
        assert_eq!(config.rtsp.port, 554);
        assert_eq!(config.rtsp.path, "/mjpeg/1");
        assert_eq!(config.rtsp.mtu, 1400);
        assert_eq!(config.http.max_fps, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[stream]
enabled = true
psram = true

[camera]
source = "directory"
directory = "/var/lib/frames"
frame_size = "svga"
fps = 15
quality = 90

[pool]
slot_count = 6

[rtsp]
port = 8554
mtu = 1200
session_timeout_seconds = 30

[http]
port = 8080
max_clients = 1
        "#;

        let config = Config::from_str(toml).unwrap();

        assert!(config.stream.enabled);
        assert_eq!(config.camera.source, SourceKind::Directory);
        assert_eq!(config.camera.frame_size, FrameSize::Svga);
        assert_eq!(config.camera.fps, 15);
        assert_eq!(config.pool.resolve(true), (6, PSRAM_SLOT_SIZE));
        assert_eq!(config.rtsp.port, 8554);
        assert_eq!(config.rtsp.session_timeout(), Duration::from_secs(30));
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.http.stream_path, "/stream");
    }

    #[test]
    fn test_pool_follows_psram_flag() {
        let pool = PoolConfig::default();
        assert_eq!(pool.resolve(false), (DRAM_SLOT_COUNT, DRAM_SLOT_SIZE));
        assert_eq!(pool.resolve(true), (PSRAM_SLOT_COUNT, PSRAM_SLOT_SIZE));
    }

    #[test]
    fn test_mtu_below_overhead() {
        let result = Config::from_str("[rtsp]\nmtu = 100\n");
        assert!(matches!(
            result,
            Err(ConfigError::MtuBelowOverhead { mtu: 100, .. })
        ));
    }

    #[test]
    fn test_invalid_values() {
        assert!(Config::from_str("[camera]\nfps = 0\n").is_err());
        assert!(Config::from_str("[camera]\nquality = 101\n").is_err());
        assert!(Config::from_str("[camera]\nsource = \"directory\"\n").is_err());
        assert!(Config::from_str("[pool]\nslot_size = 0\n").is_err());
        assert!(Config::from_str("[rtsp]\nsession_timeout_seconds = 0\n").is_err());
        assert!(Config::from_str("[http]\nstill_path = \"/stream\"\n").is_err());
    }

    #[test]
    fn test_invalid_path() {
        let result = Config::from_str("[http]\nstream_path = \"stream\"\n");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidPath {
                field: "http.stream_path",
                ..
            })
        ));
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.stream.enabled = true;
        config.rtsp.port = 8554;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.stream.enabled);
        assert_eq!(loaded.rtsp.port, 8554);
        assert_eq!(loaded.camera.frame_size, config.camera.frame_size);
    }

    #[test]
    fn test_shipped_config_loads() {
        let config = Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml")).unwrap();
        assert!(config.stream.enabled);
        assert_eq!(config.rtsp.path, "/mjpeg/1");
        assert_eq!(config.http.max_fps, 25);
    }
}
