//! RTSP request parsing and response building

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use super::ProtocolError;

/// Requests larger than this are refused outright
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;

const RTSP_VERSION: &str = "RTSP/1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    Other(String),
}

impl Method {
    pub fn parse(s: &str) -> Self {
        match s {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Other(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed RTSP request
#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RtspRequest {
    /// Parses one request from the front of `buf`.
    ///
    /// Returns `Ok(None)` until the header block (and any body announced by
    /// `Content-Length`) is complete; otherwise the request and the number
    /// of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let Some(head_end) = find_header_end(buf) else {
            if buf.len() > MAX_REQUEST_SIZE {
                return Err(ProtocolError::MessageTooLarge(MAX_REQUEST_SIZE));
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&buf[..head_end])
            .map_err(|_| ProtocolError::MalformedRequest("non UTF-8 header".to_string()))?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (m, u, v),
            _ => {
                return Err(ProtocolError::MalformedRequest(format!(
                    "bad request line {:?}",
                    request_line
                )))
            }
        };
        if version != RTSP_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version.to_string()));
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::MalformedRequest(format!("bad header {:?}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut request = RtspRequest {
            method: Method::parse(method),
            uri: uri.to_string(),
            headers,
            body: Bytes::new(),
        };

        let body_start = head_end + 4;
        let body_len = match request.header("Content-Length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| ProtocolError::MalformedRequest("bad Content-Length".to_string()))?,
            None => 0,
        };
        let end = body_start
            .checked_add(body_len)
            .filter(|&end| end <= MAX_REQUEST_SIZE)
            .ok_or(ProtocolError::MessageTooLarge(MAX_REQUEST_SIZE))?;
        if buf.len() < end {
            return Ok(None);
        }

        request.body = Bytes::copy_from_slice(&buf[body_start..end]);
        Ok(Some((request, end)))
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Result<u32, ProtocolError> {
        self.header("CSeq")
            .ok_or(ProtocolError::MissingHeader("CSeq"))?
            .parse()
            .map_err(|_| ProtocolError::MalformedRequest("bad CSeq".to_string()))
    }

    /// Session id without any `;timeout=` suffix
    pub fn session(&self) -> Option<&str> {
        self.header("Session")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    /// Path component of the request URI
    pub fn path(&self) -> &str {
        let uri = self.uri.as_str();
        let without_scheme = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtspu://"));

        match without_scheme {
            Some(rest) => rest.find('/').map_or("/", |i| &rest[i..]),
            None => uri,
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// RTSP status codes used by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const NOT_ENOUGH_BANDWIDTH: StatusCode = StatusCode(453);
    pub const SESSION_NOT_FOUND: StatusCode = StatusCode(454);
    pub const METHOD_NOT_VALID_IN_STATE: StatusCode = StatusCode(455);
    pub const UNSUPPORTED_TRANSPORT: StatusCode = StatusCode(461);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    pub const VERSION_NOT_SUPPORTED: StatusCode = StatusCode(505);

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            453 => "Not Enough Bandwidth",
            454 => "Session Not Found",
            455 => "Method Not Valid in This State",
            461 => "Unsupported Transport",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            505 => "RTSP Version Not Supported",
            _ => "Unknown",
        }
    }
}

/// An RTSP response under construction
#[derive(Debug, Clone)]
pub struct RtspResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Option<(String, Bytes)>,
}

impl RtspResponse {
    pub fn new(status: StatusCode, cseq: Option<u32>) -> Self {
        let mut headers = Vec::new();
        if let Some(cseq) = cseq {
            headers.push(("CSeq".to_string(), cseq.to_string()));
        }
        Self {
            status,
            headers,
            body: None,
        }
    }

    pub fn ok(cseq: u32) -> Self {
        Self::new(StatusCode::OK, Some(cseq))
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.body = Some((content_type.to_string(), body.into()));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(
            format!(
                "{} {} {}\r\n",
                RTSP_VERSION,
                self.status.as_u16(),
                self.status.reason()
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            buf.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        match &self.body {
            Some((content_type, body)) => {
                buf.put_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
                buf.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
                buf.put_slice(body);
            }
            None => buf.put_slice(b"\r\n"),
        }
        buf.freeze()
    }
}
