//! RTSP control protocol (RFC 2326)
//!
//! ```text
//! DESCRIBE rtsp://camera/mjpeg/1 RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! | Method        | Effect                                   |
//! |---------------|------------------------------------------|
//! | OPTIONS       | capability discovery                     |
//! | DESCRIBE      | SDP for the single MJPEG stream          |
//! | SETUP         | negotiate UDP ports or interleaved TCP   |
//! | PLAY          | start delivery (READY -> PLAYING)        |
//! | PAUSE         | stop delivery (PLAYING -> READY)         |
//! | TEARDOWN      | destroy the session                      |
//! | GET_PARAMETER | keep-alive                               |

pub mod message;
pub mod sdp;
pub mod server;
pub mod session;
pub mod transport;

pub use message::{Method, RtspRequest, RtspResponse, StatusCode};
pub use server::RtspServer;
pub use session::{
    Session, SessionId, SessionKind, SessionManager, SessionSnapshot, SessionState, SetupInfo,
};
pub use transport::TransportSpec;

use thiserror::Error;

use crate::rtp::PacketizerError;

/// Malformed or unsupported client input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request exceeds {0} bytes")]
    MessageTooLarge(usize),

    #[error("unsupported RTSP version {0}")]
    UnsupportedVersion(String),

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid Transport header: {0}")]
    InvalidTransport(String),

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{method} not valid in state {from}")]
    InvalidStateTransition {
        from: SessionState,
        method: &'static str,
    },

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session limit of {0} reached")]
    LimitReached(usize),

    #[error(transparent)]
    Packetizer(#[from] PacketizerError),
}

impl SessionError {
    /// RTSP status reported to the client for this failure
    pub fn status(&self) -> StatusCode {
        match self {
            SessionError::Protocol(ProtocolError::UnsupportedTransport(_)) => {
                StatusCode::UNSUPPORTED_TRANSPORT
            }
            SessionError::Protocol(ProtocolError::UnsupportedVersion(_)) => {
                StatusCode::VERSION_NOT_SUPPORTED
            }
            SessionError::Protocol(_) => StatusCode::BAD_REQUEST,
            SessionError::InvalidStateTransition { .. } => StatusCode::METHOD_NOT_VALID_IN_STATE,
            SessionError::NotFound(_) => StatusCode::SESSION_NOT_FOUND,
            SessionError::LimitReached(_) => StatusCode::NOT_ENOUGH_BANDWIDTH,
            SessionError::Packetizer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let invalid = SessionError::InvalidStateTransition {
            from: SessionState::Init,
            method: "PLAY",
        };
        assert_eq!(invalid.status().as_u16(), 455);
        assert_eq!(SessionError::NotFound(SessionId::from_raw(1)).status().as_u16(), 454);
        assert_eq!(SessionError::LimitReached(4).status().as_u16(), 453);
        assert_eq!(
            SessionError::from(ProtocolError::UnsupportedTransport("multicast".into()))
                .status()
                .as_u16(),
            461
        );
        assert_eq!(
            SessionError::from(ProtocolError::InvalidTransport("x".into()))
                .status()
                .as_u16(),
            400
        );
    }
}
