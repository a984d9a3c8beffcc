//! Shared HTTP host and the handlers mounted on it
//!
//! The host server only parses the request head and routes by path. A handler
//! receives the parsed request plus the raw socket as a [`ByteSink`] and owns
//! the connection from then on, which is what long-lived MJPEG streams need.

pub mod mjpeg;
pub mod pages;
pub mod server;

pub use mjpeg::{MjpegHandler, StillHandler, BOUNDARY};
pub use pages::{IndexHandler, StatusHandler};
pub use server::WebServer;

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Request heads larger than this are refused
pub const MAX_HEAD_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("server already started")]
    AlreadyStarted,
}

/// Write half handed to request handlers
pub trait ByteSink: AsyncWrite + Unpin + Send {}

impl<T: AsyncWrite + Unpin + Send> ByteSink for T {}

/// A path handler mounted on the [`WebServer`]
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: HttpRequest, sink: Box<dyn ByteSink>) -> Result<(), HttpError>;
}

/// Parsed request head
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub peer: SocketAddr,
}

impl HttpRequest {
    /// Parses a request head from `buf`; `Ok(None)` until it is complete
    pub fn parse(buf: &[u8], peer: SocketAddr) -> Result<Option<Self>, HttpError> {
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(HttpError::HeadTooLarge(MAX_HEAD_SIZE));
            }
            return Ok(None);
        };

        let head = String::from_utf8_lossy(&buf[..end]);
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();

        let mut parts = request_line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/1.") => (m, t),
            _ => {
                return Err(HttpError::MalformedRequest(format!(
                    "bad request line {:?}",
                    request_line
                )))
            }
        };

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        Ok(Some(Self {
            method: method.to_string(),
            path,
            query,
            headers,
            peer,
        }))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Formats a complete, non-streaming response
pub fn simple_response(status: u16, reason: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Writes a complete response and flushes
pub async fn respond(
    sink: &mut dyn ByteSink,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> Result<(), HttpError> {
    sink.write_all(&simple_response(status, reason, content_type, body))
        .await?;
    sink.flush().await?;
    Ok(())
}
