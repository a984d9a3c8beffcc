//! Session bookkeeping for RTSP and HTTP clients
//!
//! The manager owns every [`Session`]. It is plain synchronous state: the
//! scheduler task is its only caller, so nothing here needs locking.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{SessionError, TransportSpec};
use crate::pool::Frame;

/// Server-assigned session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Parses the hex form sent in the `Session` header
    pub fn parse(s: &str) -> Option<Self> {
        u64::from_str_radix(s.trim(), 16).ok().map(Self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Ready,
    Playing,
    /// Terminal
    Teardown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Init => "INIT",
            SessionState::Ready => "READY",
            SessionState::Playing => "PLAYING",
            SessionState::Teardown => "TEARDOWN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Rtsp,
    /// `one_shot` sessions take a single frame, then end
    Http { one_shot: bool },
}

/// What a successful SETUP hands back to the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupInfo {
    pub id: SessionId,
    pub ssrc: u32,
    pub transport: TransportSpec,
}

/// Outcome of offering a frame to a session's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queue full; this frame is skipped for this session only
    Dropped,
    /// Receiver gone; the session must be torn down
    Closed,
}

/// One connected client
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    kind: SessionKind,
    peer: SocketAddr,
    state: SessionState,
    transport: Option<TransportSpec>,
    ssrc: u32,
    created_at: Instant,
    last_activity: Instant,
    outbound: mpsc::Sender<Frame>,
    frames_queued: u64,
    frames_dropped: u64,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport(&self) -> Option<TransportSpec> {
        self.transport
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, SessionKind::Http { one_shot: true })
    }

    /// Receiving frames right now
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Playing
    }

    /// Hands `frame` to the client task without waiting
    pub fn offer(&mut self, frame: Frame) -> Offer {
        match self.outbound.try_send(frame) {
            Ok(()) => {
                self.frames_queued += 1;
                Offer::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.frames_dropped += 1;
                Offer::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            kind: self.kind,
            peer: self.peer.to_string(),
            state: self.state,
            transport: self.transport.map(|t| t.to_string()),
            age_seconds: now.saturating_duration_since(self.created_at).as_secs(),
            frames_queued: self.frames_queued,
            frames_dropped: self.frames_dropped,
        }
    }

    fn expect_state(&self, allowed: &[SessionState], method: &'static str) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidStateTransition {
                from: self.state,
                method,
            })
        }
    }
}

/// Serializable view of a session for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: SessionKind,
    pub peer: String,
    pub state: SessionState,
    pub transport: Option<String>,
    pub age_seconds: u64,
    pub frames_queued: u64,
    pub frames_dropped: u64,
}

/// xorshift64* over a time-derived seed; ids only need to be unguessable
/// enough not to collide between reconnecting clients
struct IdGenerator(u64);

impl IdGenerator {
    fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E37_79B9_7F4A_7C15);
        Self(nanos | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

/// Owns all sessions and enforces the RTSP state machine
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    max_rtsp: usize,
    max_http: usize,
    timeout: Duration,
    ids: IdGenerator,
}

impl SessionManager {
    pub fn new(max_rtsp: usize, max_http: usize, timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            max_rtsp,
            max_http,
            timeout,
            ids: IdGenerator::new(),
        }
    }

    /// Registers a new RTSP connection in `INIT`
    pub fn open_rtsp(
        &mut self,
        peer: SocketAddr,
        outbound: mpsc::Sender<Frame>,
        now: Instant,
    ) -> Result<SessionId, SessionError> {
        if self.count_kind(|k| k == SessionKind::Rtsp) >= self.max_rtsp {
            return Err(SessionError::LimitReached(self.max_rtsp));
        }
        Ok(self.insert(SessionKind::Rtsp, SessionState::Init, peer, outbound, now))
    }

    /// Registers an HTTP client; it is active immediately
    pub fn open_http(
        &mut self,
        peer: SocketAddr,
        one_shot: bool,
        outbound: mpsc::Sender<Frame>,
        now: Instant,
    ) -> Result<SessionId, SessionError> {
        // Still requests are short-lived and do not count against the limit
        if !one_shot
            && self.count_kind(|k| k == SessionKind::Http { one_shot: false }) >= self.max_http
        {
            return Err(SessionError::LimitReached(self.max_http));
        }
        Ok(self.insert(
            SessionKind::Http { one_shot },
            SessionState::Playing,
            peer,
            outbound,
            now,
        ))
    }

    fn insert(
        &mut self,
        kind: SessionKind,
        state: SessionState,
        peer: SocketAddr,
        outbound: mpsc::Sender<Frame>,
        now: Instant,
    ) -> SessionId {
        let id = loop {
            let candidate = SessionId(self.ids.next());
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        self.sessions.insert(
            id,
            Session {
                id,
                kind,
                peer,
                state,
                transport: None,
                ssrc: 0,
                created_at: now,
                last_activity: now,
                outbound,
                frames_queued: 0,
                frames_dropped: 0,
            },
        );

        info!(session = %id, peer = %peer, kind = ?kind, "Session opened");
        id
    }

    /// Negotiates transport; on any failure the session stays where it was
    pub fn setup(
        &mut self,
        id: SessionId,
        transport_header: &str,
        now: Instant,
    ) -> Result<SetupInfo, SessionError> {
        let session = self.rtsp_session_mut(id)?;
        session.expect_state(&[SessionState::Init, SessionState::Ready], "SETUP")?;

        let transport = TransportSpec::parse(transport_header)?;

        // Keep the SSRC stable across a repeated SETUP
        let existing = session.ssrc;
        let ssrc = if existing != 0 {
            existing
        } else {
            (self.ids.next() >> 32) as u32 | 1
        };

        let session = self.rtsp_session_mut(id)?;
        session.transport = Some(transport);
        session.ssrc = ssrc;
        session.state = SessionState::Ready;
        session.last_activity = now;

        debug!(session = %id, transport = %transport, ssrc = %format!("{:08X}", ssrc), "Session ready");
        Ok(SetupInfo {
            id,
            ssrc,
            transport,
        })
    }

    pub fn play(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = self.rtsp_session_mut(id)?;
        session.expect_state(&[SessionState::Ready, SessionState::Playing], "PLAY")?;
        session.state = SessionState::Playing;
        session.last_activity = now;
        debug!(session = %id, "Session playing");
        Ok(())
    }

    pub fn pause(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = self.rtsp_session_mut(id)?;
        session.expect_state(&[SessionState::Ready, SessionState::Playing], "PAUSE")?;
        session.state = SessionState::Ready;
        session.last_activity = now;
        debug!(session = %id, "Session paused");
        Ok(())
    }

    /// Ends a session and releases everything it held.
    ///
    /// Dropping the session drops its queue sender, so the client task sees
    /// the queue close and any frames still queued go back to the pool.
    pub fn teardown(&mut self, id: SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        session.state = SessionState::Teardown;
        info!(
            session = %id,
            peer = %session.peer,
            queued = session.frames_queued,
            dropped = session.frames_dropped,
            "Session torn down"
        );
        Some(session)
    }

    /// Records client activity (RTSP request or RTCP packet)
    pub fn touch(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = self.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        session.last_activity = now;
        Ok(())
    }

    /// Tears down RTSP sessions silent for longer than the timeout
    pub fn reap_idle(&mut self, now: Instant) -> Vec<SessionId> {
        let timeout = self.timeout;
        let idle: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.kind == SessionKind::Rtsp)
            .filter(|s| now.saturating_duration_since(s.last_activity) > timeout)
            .map(|s| s.id)
            .collect();

        for id in &idle {
            info!(session = %id, "Session timed out");
            self.teardown(*id);
        }
        idle
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Sessions currently receiving frames
    pub fn active_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut().filter(|s| s.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshots(&self, now: Instant) -> Vec<SessionSnapshot> {
        let mut out: Vec<_> = self.sessions.values().map(|s| s.snapshot(now)).collect();
        out.sort_by_key(|s| s.age_seconds);
        out
    }

    /// Drops every session
    pub fn clear(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.teardown(id);
        }
    }

    fn count_kind(&self, pred: impl Fn(SessionKind) -> bool) -> usize {
        self.sessions.values().filter(|s| pred(s.kind)).count()
    }

    fn rtsp_session_mut(&mut self, id: SessionId) -> Result<&mut Session, SessionError> {
        match self.sessions.get_mut(&id) {
            Some(s) if s.kind == SessionKind::Rtsp => Ok(s),
            _ => Err(SessionError::NotFound(id)),
        }
    }
}
