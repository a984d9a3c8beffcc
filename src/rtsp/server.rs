//! RTSP listener and per-connection control loop
//!
//! Each TCP connection owns exactly one session, created in `INIT` when the
//! connection is accepted. The connection task parses requests, forwards the
//! state changes to the scheduler, and turns the frames the scheduler queues
//! for it into RTP packets sent over UDP or interleaved on the connection.

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::MAX_REQUEST_SIZE;
use super::sdp::{self, TRACK_CONTROL};
use super::{
    Method, RtspRequest, RtspResponse, SessionError, SessionId, StatusCode, TransportSpec,
};
use crate::config::Config;
use crate::pool::Frame;
use crate::rtp::{interleave, RtpPacketizer, INTERLEAVED_HEADER_SIZE};
use crate::scheduler::{SchedulerError, SchedulerHandle};

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// Listener and per-session parameters
#[derive(Debug, Clone)]
pub struct RtspSettings {
    pub bind: String,
    pub port: u16,
    pub path: String,
    pub mtu: usize,
    pub queue_depth: usize,
    pub session_timeout: Duration,
    pub fps: u32,
}

impl RtspSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind: config.rtsp.bind.clone(),
            port: config.rtsp.port,
            path: config.rtsp.path.clone(),
            mtu: config.rtsp.mtu,
            queue_depth: config.rtsp.queue_depth,
            session_timeout: config.rtsp.session_timeout(),
            fps: config.camera.fps,
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct RtspServer {
    settings: Arc<RtspSettings>,
    scheduler: SchedulerHandle,
    running: Mutex<Option<Running>>,
}

impl RtspServer {
    pub fn new(settings: RtspSettings, scheduler: SchedulerHandle) -> Self {
        Self {
            settings: Arc::new(settings),
            scheduler,
            running: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind((self.settings.bind.as_str(), self.settings.port)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.settings),
            self.scheduler.clone(),
            shutdown_rx,
        ));

        *self.running.lock() = Some(Running {
            local_addr,
            shutdown,
            task,
        });

        info!(
            addr = %local_addr,
            path = %self.settings.path,
            mtu = self.settings.mtu,
            "RTSP server listening"
        );
        Ok(local_addr)
    }

    /// Stops accepting and closes every open connection
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.task.await {
                warn!(error = %e, "RTSP server task ended abnormally");
            }
            info!("RTSP server stopped");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// URL clients should open, given the address they reach us on
    pub fn url(&self, host: IpAddr) -> String {
        format!("rtsp://{}:{}{}", host, self.settings.port, self.settings.path)
    }
}

async fn accept_loop(
    listener: TcpListener,
    settings: Arc<RtspSettings>,
    scheduler: SchedulerHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let settings = Arc::clone(&settings);
                    let scheduler = scheduler.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_connection(stream, peer, settings, scheduler, shutdown).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "RTSP accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<RtspSettings>,
    scheduler: SchedulerHandle,
    shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));

    let id = match scheduler.open_rtsp(peer, tx).await {
        Ok(id) => id,
        Err(e) => {
            let status = match &e {
                SchedulerError::Session(err) => err.status(),
                SchedulerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            };
            info!(peer = %peer, error = %e, "Refusing RTSP connection");
            let _ = refuse(&mut stream, status).await;
            return;
        }
    };

    let local_ip = stream
        .local_addr()
        .map(|a| a.ip())
        .unwrap_or(IpAddr::from([0, 0, 0, 0]));

    let mut connection = Connection {
        id,
        peer,
        local_ip,
        settings,
        scheduler: scheduler.clone(),
        stream,
        frames: rx,
        delivery: None,
        packetizer_failed: false,
    };

    match connection.run(shutdown).await {
        Ok(()) => debug!(session = %id, "RTSP connection closed"),
        Err(e) => debug!(session = %id, error = %e, "RTSP connection ended with error"),
    }

    if let Some(delivery) = connection.delivery.take() {
        delivery.shutdown();
    }
    scheduler.close(id).await;
}

/// Best-effort error response when no CSeq is known yet
async fn refuse(stream: &mut TcpStream, status: StatusCode) -> std::io::Result<()> {
    // Read whatever request is already in flight so the client sees a reply to it
    let mut buf = BytesMut::with_capacity(1024);
    let cseq = match tokio::time::timeout(Duration::from_millis(500), stream.read_buf(&mut buf)).await {
        Ok(Ok(_)) => RtspRequest::parse(&buf)
            .ok()
            .flatten()
            .and_then(|(req, _)| req.cseq().ok()),
        _ => None,
    };

    stream
        .write_all(&RtspResponse::new(status, cseq).to_bytes())
        .await?;
    stream.shutdown().await
}

/// Where RTP for a playing session goes
enum Sink {
    Udp {
        rtp: Arc<UdpSocket>,
        destination: SocketAddr,
        rtcp_reader: JoinHandle<()>,
    },
    Interleaved {
        channel: u8,
    },
}

struct Delivery {
    packetizer: RtpPacketizer,
    sink: Sink,
}

impl Delivery {
    fn shutdown(self) {
        if let Sink::Udp { rtcp_reader, .. } = self.sink {
            rtcp_reader.abort();
        }
    }
}

struct Connection {
    id: SessionId,
    peer: SocketAddr,
    local_ip: IpAddr,
    settings: Arc<RtspSettings>,
    scheduler: SchedulerHandle,
    stream: TcpStream,
    frames: mpsc::Receiver<Frame>,
    delivery: Option<Delivery>,
    packetizer_failed: bool,
}

impl Connection {
    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(2048);

        loop {
            tokio::select! {
                read = self.stream.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    if !self.process_input(&mut buf).await? {
                        return Ok(());
                    }
                }
                frame = self.frames.recv() => match frame {
                    Some(frame) => self.send_frame(frame).await?,
                    // The scheduler ended the session (teardown, reaping or shutdown)
                    None => return Ok(()),
                },
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Handles every complete message in `buf`; `false` ends the connection
    async fn process_input(&mut self, buf: &mut BytesMut) -> std::io::Result<bool> {
        loop {
            if buf.is_empty() {
                return Ok(true);
            }

            // Interleaved binary data, usually RTCP receiver reports
            if buf[0] == b'$' {
                if buf.len() < INTERLEAVED_HEADER_SIZE {
                    return Ok(true);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if buf.len() < INTERLEAVED_HEADER_SIZE + len {
                    return Ok(true);
                }
                buf.advance(INTERLEAVED_HEADER_SIZE + len);
                self.scheduler.keep_alive(self.id).await;
                continue;
            }

            match RtspRequest::parse(buf) {
                Ok(Some((request, used))) => {
                    buf.advance(used);
                    let (response, keep_open) = self.handle_request(&request).await;
                    self.stream.write_all(&response.to_bytes()).await?;
                    if !keep_open {
                        return Ok(false);
                    }
                }
                Ok(None) => {
                    if buf.len() > MAX_REQUEST_SIZE {
                        return Ok(false);
                    }
                    return Ok(true);
                }
                Err(e) => {
                    let status = SessionError::from(e.clone()).status();
                    debug!(session = %self.id, error = %e, "Bad RTSP request");
                    self.stream
                        .write_all(&RtspResponse::new(status, None).to_bytes())
                        .await?;
                    return Ok(false);
                }
            }
        }
    }

    /// Builds the reply; the flag is `false` when the connection should close
    async fn handle_request(&mut self, request: &RtspRequest) -> (RtspResponse, bool) {
        let cseq = match request.cseq() {
            Ok(cseq) => cseq,
            Err(e) => {
                debug!(session = %self.id, error = %e, "Request without CSeq");
                return (RtspResponse::new(StatusCode::BAD_REQUEST, None), true);
            }
        };

        debug!(session = %self.id, method = %request.method, uri = %request.uri, cseq, "RTSP request");

        if let Some(raw) = request.session() {
            if SessionId::parse(raw) != Some(self.id) {
                return (RtspResponse::new(StatusCode::SESSION_NOT_FOUND, Some(cseq)), true);
            }
            self.scheduler.keep_alive(self.id).await;
        }

        let result = match request.method {
            Method::Options => Ok(RtspResponse::ok(cseq).header("Public", PUBLIC_METHODS)),
            Method::Describe => Ok(self.describe(request, cseq)),
            Method::Setup => self.setup(request, cseq).await,
            Method::Play => self.play(request, cseq).await,
            Method::Pause => self
                .scheduler
                .pause(self.id)
                .await
                .map(|()| self.session_reply(cseq)),
            Method::Teardown => {
                // Sessions are bound to their connection, so a fresh SETUP
                // needs a new connection
                let _ = self.scheduler.teardown(self.id).await;
                return (RtspResponse::ok(cseq).header("Session", self.id.to_string()), false);
            }
            Method::GetParameter | Method::SetParameter => {
                self.scheduler.keep_alive(self.id).await;
                Ok(self.session_reply(cseq))
            }
            _ => Ok(RtspResponse::new(StatusCode::NOT_IMPLEMENTED, Some(cseq))),
        };

        match result {
            Ok(response) => (response, true),
            Err(SchedulerError::Stopped) => (
                RtspResponse::new(StatusCode::SERVICE_UNAVAILABLE, Some(cseq)),
                false,
            ),
            Err(SchedulerError::Session(e)) => {
                debug!(session = %self.id, error = %e, "Request refused");
                // A session the scheduler no longer knows cannot recover
                let keep_open = !matches!(e, SessionError::NotFound(_));
                (RtspResponse::new(e.status(), Some(cseq)), keep_open)
            }
        }
    }

    fn session_reply(&self, cseq: u32) -> RtspResponse {
        RtspResponse::ok(cseq).header("Session", self.id.to_string())
    }

    fn describe(&self, request: &RtspRequest, cseq: u32) -> RtspResponse {
        if request.path().trim_end_matches('/') != self.settings.path.trim_end_matches('/') {
            return RtspResponse::new(StatusCode::NOT_FOUND, Some(cseq));
        }

        let base = format!("{}/", request.uri.trim_end_matches('/'));
        RtspResponse::ok(cseq)
            .header("Content-Base", base)
            .body(
                "application/sdp",
                sdp::describe(self.id.as_u64(), self.local_ip, self.settings.fps),
            )
    }

    async fn setup(&mut self, request: &RtspRequest, cseq: u32) -> Result<RtspResponse, SchedulerError> {
        let path = request.path();
        let stream_path = self.settings.path.trim_end_matches('/');
        let track = path
            .strip_prefix(stream_path)
            .map(|rest| rest.trim_matches('/'));
        if !matches!(track, Some("") | Some(TRACK_CONTROL)) {
            return Ok(RtspResponse::new(StatusCode::NOT_FOUND, Some(cseq)));
        }

        let header = request
            .header("Transport")
            .ok_or(SessionError::Protocol(super::ProtocolError::MissingHeader("Transport")))?;

        let info = self.scheduler.setup(self.id, header).await?;
        let packetizer = RtpPacketizer::new(info.ssrc, self.settings.mtu).map_err(SessionError::from)?;

        let (sink, server_ports) = match info.transport {
            TransportSpec::Interleaved { rtp_channel, .. } => {
                (Sink::Interleaved { channel: rtp_channel }, None)
            }
            TransportSpec::Udp { client_rtp, .. } => {
                let (rtp, rtcp) = match bind_udp_pair(self.local_ip).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(session = %self.id, error = %e, "Could not bind RTP sockets");
                        return Ok(RtspResponse::new(StatusCode::INTERNAL_SERVER_ERROR, Some(cseq)));
                    }
                };
                let ports = (
                    rtp.local_addr().map(|a| a.port()).unwrap_or_default(),
                    rtcp.local_addr().map(|a| a.port()).unwrap_or_default(),
                );
                let rtcp_reader = tokio::spawn(read_rtcp(rtcp, self.id, self.scheduler.clone()));
                let sink = Sink::Udp {
                    rtp: Arc::new(rtp),
                    destination: SocketAddr::new(self.peer.ip(), client_rtp),
                    rtcp_reader,
                };
                (sink, Some(ports))
            }
        };

        if let Some(previous) = self.delivery.replace(Delivery { packetizer, sink }) {
            previous.shutdown();
        }
        self.packetizer_failed = false;

        info!(session = %self.id, peer = %self.peer, transport = %info.transport, "RTSP session set up");

        Ok(RtspResponse::ok(cseq)
            .header("Transport", info.transport.reply_header(server_ports, info.ssrc))
            .header(
                "Session",
                format!("{};timeout={}", self.id, self.settings.session_timeout.as_secs()),
            ))
    }

    async fn play(&mut self, request: &RtspRequest, cseq: u32) -> Result<RtspResponse, SchedulerError> {
        self.scheduler.play(self.id).await?;

        let mut response = self.session_reply(cseq).header("Range", "npt=0.000-");
        if let Some(delivery) = &self.delivery {
            response = response.header(
                "RTP-Info",
                format!(
                    "url={};seq={}",
                    request.uri,
                    delivery.packetizer.sequence_number()
                ),
            );
        }
        info!(session = %self.id, "RTSP session playing");
        Ok(response)
    }

    async fn send_frame(&mut self, frame: Frame) -> std::io::Result<()> {
        let Some(delivery) = self.delivery.as_mut() else {
            return Ok(());
        };

        let fragments = match delivery.packetizer.packetize(&frame) {
            Ok(fragments) => fragments,
            Err(e) => {
                if !self.packetizer_failed {
                    warn!(session = %self.id, error = %e, "Frame cannot be sent over RTP, skipping");
                    self.packetizer_failed = true;
                }
                return Ok(());
            }
        };

        match &delivery.sink {
            Sink::Udp {
                rtp, destination, ..
            } => {
                for packet in fragments {
                    rtp.send_to(&packet, *destination).await?;
                }
            }
            Sink::Interleaved { channel } => {
                for packet in fragments {
                    self.stream.write_all(&interleave(*channel, &packet)).await?;
                }
            }
        }
        Ok(())
    }
}

/// Binds an RTP socket and the RTCP socket on the next port when possible
async fn bind_udp_pair(ip: IpAddr) -> std::io::Result<(UdpSocket, UdpSocket)> {
    for _ in 0..8 {
        let rtp = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        let port = rtp.local_addr()?.port();
        if let Some(next) = port.checked_add(1) {
            if let Ok(rtcp) = UdpSocket::bind(SocketAddr::new(ip, next)).await {
                return Ok((rtp, rtcp));
            }
        }
    }

    // No adjacent pair free; any two ports still work for unicast
    let rtp = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
    let rtcp = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
    Ok((rtp, rtcp))
}

/// Every RTCP packet from the client counts as a keep-alive
async fn read_rtcp(socket: UdpSocket, id: SessionId, scheduler: SchedulerHandle) {
    let mut buf = [0u8; 1500];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                debug!(session = %id, bytes = n, from = %from, "RTCP received");
                scheduler.keep_alive(id).await;
            }
            Err(e) => {
                debug!(session = %id, error = %e, "RTCP socket closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = Config::default();
        let settings = RtspSettings::from_config(&config);

        assert_eq!(settings.port, 554);
        assert_eq!(settings.path, "/mjpeg/1");
        assert_eq!(settings.mtu, 1400);
        assert_eq!(settings.session_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_udp_pair_binds() {
        let (rtp, rtcp) = bind_udp_pair(IpAddr::from([127, 0, 0, 1])).await.unwrap();
        assert_ne!(
            rtp.local_addr().unwrap().port(),
            rtcp.local_addr().unwrap().port()
        );
    }
}
