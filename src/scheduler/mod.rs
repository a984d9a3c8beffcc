//! Transport scheduler: the single dispatch loop
//!
//! One task owns the [`SessionManager`] and is the only place session state
//! changes. Connection tasks talk to it through a [`SchedulerHandle`]; the
//! capture loop feeds it frames. For every frame it takes one pool reference
//! per active session and offers it to that session's bounded queue. A full
//! queue skips the frame for that session only; a closed queue ends the
//! session.

mod stats;

pub use stats::{SchedulerReport, SchedulerStats};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::capture::CaptureEvent;
use crate::config::Config;
use crate::pool::{Frame, FramePool};
use crate::rtsp::session::Offer;
use crate::rtsp::{SessionError, SessionId, SessionManager, SetupInfo};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler stopped")]
    Stopped,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Limits and intervals for the dispatch loop
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_rtsp_sessions: usize,
    pub max_http_clients: usize,
    pub session_timeout: Duration,
    pub reap_interval: Duration,
    pub stats_interval: Duration,
    pub command_queue: usize,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_rtsp_sessions: config.rtsp.max_sessions,
            max_http_clients: config.http.max_clients,
            session_timeout: config.rtsp.session_timeout(),
            reap_interval: Duration::from_millis(config.scheduler.reap_interval_ms),
            stats_interval: Duration::from_secs(config.scheduler.stats_interval_seconds),
            command_queue: config.scheduler.command_queue,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    OpenRtsp {
        peer: SocketAddr,
        outbound: mpsc::Sender<Frame>,
        reply: Reply<SessionId>,
    },
    OpenHttp {
        peer: SocketAddr,
        one_shot: bool,
        outbound: mpsc::Sender<Frame>,
        reply: Reply<SessionId>,
    },
    Setup {
        id: SessionId,
        transport: String,
        reply: Reply<SetupInfo>,
    },
    Play {
        id: SessionId,
        reply: Reply<()>,
    },
    Pause {
        id: SessionId,
        reply: Reply<()>,
    },
    Teardown {
        id: SessionId,
        reply: Option<oneshot::Sender<bool>>,
    },
    KeepAlive {
        id: SessionId,
    },
    Report {
        reply: oneshot::Sender<SchedulerReport>,
    },
    Shutdown,
}

/// Cloneable front door to the scheduler task
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        Ok(rx.await.map_err(|_| SchedulerError::Stopped)??)
    }

    /// Registers an RTSP connection; its session starts in `INIT`
    pub async fn open_rtsp(
        &self,
        peer: SocketAddr,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<SessionId, SchedulerError> {
        self.request(|reply| Command::OpenRtsp {
            peer,
            outbound,
            reply,
        })
        .await
    }

    /// Registers an HTTP client that starts receiving frames immediately
    pub async fn open_http(
        &self,
        peer: SocketAddr,
        one_shot: bool,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<SessionId, SchedulerError> {
        self.request(|reply| Command::OpenHttp {
            peer,
            one_shot,
            outbound,
            reply,
        })
        .await
    }

    pub async fn setup(&self, id: SessionId, transport: &str) -> Result<SetupInfo, SchedulerError> {
        let transport = transport.to_string();
        self.request(|reply| Command::Setup {
            id,
            transport,
            reply,
        })
        .await
    }

    pub async fn play(&self, id: SessionId) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Play { id, reply }).await
    }

    pub async fn pause(&self, id: SessionId) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Pause { id, reply }).await
    }

    /// Ends a session; `false` if it was already gone
    pub async fn teardown(&self, id: SessionId) -> Result<bool, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Teardown {
                id,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Ends a session without waiting for the outcome
    pub async fn close(&self, id: SessionId) {
        let _ = self.tx.send(Command::Teardown { id, reply: None }).await;
    }

    /// Marks a session alive, waiting for queue room when the scheduler is busy
    pub async fn keep_alive(&self, id: SessionId) {
        let _ = self.tx.send(Command::KeepAlive { id }).await;
    }

    pub async fn report(&self) -> Result<SchedulerReport, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Report { reply })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Tears down every session and stops the loop
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// The dispatch loop state
pub struct Scheduler {
    sessions: SessionManager,
    commands: mpsc::Receiver<Command>,
    capture: mpsc::Receiver<CaptureEvent>,
    pool: FramePool,
    demand: Arc<AtomicUsize>,
    settings: SchedulerSettings,
    stats: SchedulerStats,
}

impl Scheduler {
    /// `demand` receives the active session count after every change
    pub fn new(
        settings: SchedulerSettings,
        pool: FramePool,
        capture: mpsc::Receiver<CaptureEvent>,
        demand: Arc<AtomicUsize>,
    ) -> (Self, SchedulerHandle) {
        let (tx, commands) = mpsc::channel(settings.command_queue.max(1));
        let scheduler = Self {
            sessions: SessionManager::new(
                settings.max_rtsp_sessions,
                settings.max_http_clients,
                settings.session_timeout,
            ),
            commands,
            capture,
            pool,
            demand,
            settings,
            stats: SchedulerStats::default(),
        };

        (scheduler, SchedulerHandle { tx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut reap = tokio::time::interval(self.settings.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut report = tokio::time::interval(self.settings.stats_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_report = (Instant::now(), self.stats.clone());

        let mut capture_open = true;
        info!("Scheduler started");

        loop {
            tokio::select! {
                // Frames already captured go out before later commands
                biased;

                event = self.capture.recv(), if capture_open => match event {
                    Some(CaptureEvent::Captured(frame)) => self.dispatch(frame),
                    Some(CaptureEvent::Exhausted) => {
                        self.stats.capture_skipped += 1;
                        trace!("Pool exhausted, capture cycle skipped");
                    }
                    None => {
                        debug!("Capture channel closed");
                        capture_open = false;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = reap.tick() => self.reap(Instant::now()),
                _ = report.tick() => {
                    let now = Instant::now();
                    self.log_stats(&last_report.1, now.duration_since(last_report.0));
                    last_report = (now, self.stats.clone());
                }
            }
        }

        self.sessions.clear();
        self.publish_demand();
        info!(
            dispatched = self.stats.frames_dispatched,
            deliveries = self.stats.deliveries,
            "Scheduler stopped"
        );
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();

        // Demand is published before replying so callers observe it
        match command {
            Command::OpenRtsp {
                peer,
                outbound,
                reply,
            } => {
                let result = self.sessions.open_rtsp(peer, outbound, now);
                if result.is_ok() {
                    self.stats.sessions_opened += 1;
                }
                let _ = reply.send(result);
            }
            Command::OpenHttp {
                peer,
                one_shot,
                outbound,
                reply,
            } => {
                let result = self.sessions.open_http(peer, one_shot, outbound, now);
                if result.is_ok() {
                    self.stats.sessions_opened += 1;
                }
                self.publish_demand();
                let _ = reply.send(result);
            }
            Command::Setup {
                id,
                transport,
                reply,
            } => {
                let _ = reply.send(self.sessions.setup(id, &transport, now));
            }
            Command::Play { id, reply } => {
                let result = self.sessions.play(id, now);
                self.publish_demand();
                let _ = reply.send(result);
            }
            Command::Pause { id, reply } => {
                let result = self.sessions.pause(id, now);
                self.publish_demand();
                let _ = reply.send(result);
            }
            Command::Teardown { id, reply } => {
                let existed = self.close(id);
                self.publish_demand();
                if let Some(reply) = reply {
                    let _ = reply.send(existed);
                }
            }
            Command::KeepAlive { id } => {
                let _ = self.sessions.touch(id, now);
            }
            Command::Report { reply } => {
                let _ = reply.send(SchedulerReport {
                    stats: self.current_stats(),
                    sessions: self.sessions.snapshots(now),
                });
            }
            Command::Shutdown => {}
        }
    }

    /// Fans one frame out to every active session
    fn dispatch(&mut self, frame: Frame) {
        self.stats.frames_dispatched += 1;
        let mut finished = Vec::new();

        for session in self.sessions.active_mut() {
            match session.offer(self.pool.retain(&frame)) {
                Offer::Queued => {
                    self.stats.deliveries += 1;
                    if session.is_one_shot() {
                        finished.push(session.id());
                    }
                }
                Offer::Dropped => {
                    self.stats.frames_dropped += 1;
                    trace!(session = %session.id(), seq = frame.sequence(), "Queue full, frame skipped");
                }
                Offer::Closed => {
                    debug!(session = %session.id(), "Client queue closed");
                    finished.push(session.id());
                }
            }
        }

        self.pool.release(frame);

        if !finished.is_empty() {
            for id in finished {
                self.close(id);
            }
            self.publish_demand();
        }
    }

    fn reap(&mut self, now: Instant) {
        let reaped = self.sessions.reap_idle(now);
        if !reaped.is_empty() {
            self.stats.sessions_reaped += reaped.len() as u64;
            self.stats.sessions_torn_down += reaped.len() as u64;
            self.publish_demand();
        }
    }

    fn close(&mut self, id: SessionId) -> bool {
        let existed = self.sessions.teardown(id).is_some();
        if existed {
            self.stats.sessions_torn_down += 1;
        }
        existed
    }

    fn publish_demand(&self) {
        self.demand
            .store(self.sessions.active_count(), Ordering::Release);
    }

    fn current_stats(&self) -> SchedulerStats {
        SchedulerStats {
            active_sessions: self.sessions.active_count(),
            open_sessions: self.sessions.len(),
            ..self.stats.clone()
        }
    }

    fn log_stats(&self, previous: &SchedulerStats, elapsed: Duration) {
        let stats = self.current_stats();
        if stats.open_sessions == 0 && stats.frames_dispatched == previous.frames_dispatched {
            return;
        }

        info!(
            fps = %format!("{:.1}", stats.calculate_fps(previous, elapsed.as_secs_f64())),
            active = stats.active_sessions,
            open = stats.open_sessions,
            dispatched = stats.frames_dispatched,
            dropped = stats.frames_dropped,
            skipped = stats.capture_skipped,
            free_slots = self.pool.free_slots(),
            "Stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtsp::SessionState;

    struct Harness {
        handle: SchedulerHandle,
        capture: mpsc::Sender<CaptureEvent>,
        pool: FramePool,
        demand: Arc<AtomicUsize>,
        task: JoinHandle<()>,
    }

    fn start(settings: SchedulerSettings) -> Harness {
        let pool = FramePool::new(4, 64);
        let demand = Arc::new(AtomicUsize::new(0));
        let (capture, capture_rx) = mpsc::channel(4);
        let (scheduler, handle) =
            Scheduler::new(settings, pool.clone(), capture_rx, Arc::clone(&demand));

        Harness {
            handle,
            capture,
            pool,
            demand,
            task: scheduler.spawn(),
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn push_frame(h: &Harness, seq: u64) {
        let mut slot = h.pool.acquire().unwrap();
        slot.extend(&[0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        let frame = slot.commit(seq, Instant::now());
        h.capture.send(CaptureEvent::Captured(frame)).await.unwrap();
    }

    #[tokio::test]
    async fn test_rtsp_flow_controls_delivery() {
        let h = start(SchedulerSettings::default());
        let (tx, mut rx) = mpsc::channel(4);

        let id = h.handle.open_rtsp(peer(), tx).await.unwrap();
        assert_eq!(
            h.handle.play(id).await.unwrap_err(),
            SchedulerError::Session(SessionError::InvalidStateTransition {
                from: SessionState::Init,
                method: "PLAY",
            })
        );

        h.handle
            .setup(id, "RTP/AVP/TCP;unicast;interleaved=0-1")
            .await
            .unwrap();
        h.handle.play(id).await.unwrap();
        assert_eq!(h.demand.load(Ordering::Acquire), 1);

        push_frame(&h, 7).await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.sequence(), 7);
        drop(frame);

        assert!(h.handle.teardown(id).await.unwrap());
        assert!(rx.recv().await.is_none());
        assert_eq!(h.demand.load(Ordering::Acquire), 0);
        assert_eq!(h.pool.free_slots(), 4);

        h.handle.shutdown().await;
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_shared_across_sessions() {
        let h = start(SchedulerSettings::default());
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);

        h.handle.open_http(peer(), false, tx_a).await.unwrap();
        h.handle.open_http(peer(), false, tx_b).await.unwrap();

        push_frame(&h, 1).await;
        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();

        assert_eq!(a.slot(), b.slot());
        assert_eq!(a.payload().as_ptr(), b.payload().as_ptr());
        assert_eq!(h.pool.free_slots(), 3);

        drop(a);
        assert_eq!(h.pool.free_slots(), 3);
        drop(b);
        assert_eq!(h.pool.free_slots(), 4);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_for_that_session_only() {
        let h = start(SchedulerSettings::default());
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(4);

        h.handle.open_http(peer(), false, slow_tx).await.unwrap();
        h.handle.open_http(peer(), false, fast_tx).await.unwrap();

        push_frame(&h, 0).await;
        assert_eq!(fast_rx.recv().await.unwrap().sequence(), 0);
        push_frame(&h, 1).await;
        assert_eq!(fast_rx.recv().await.unwrap().sequence(), 1);

        let report = h.handle.report().await.unwrap();
        assert_eq!(report.stats.frames_dropped, 1);
        assert_eq!(report.stats.deliveries, 3);

        // The slow client still has only its first frame queued
        assert_eq!(slow_rx.recv().await.unwrap().sequence(), 0);
        assert!(slow_rx.try_recv().is_err());

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_client_is_torn_down() {
        let h = start(SchedulerSettings::default());
        let (tx, rx) = mpsc::channel(4);
        h.handle.open_http(peer(), false, tx).await.unwrap();
        drop(rx);

        push_frame(&h, 0).await;

        let report = h.handle.report().await.unwrap();
        assert_eq!(report.stats.open_sessions, 0);
        assert_eq!(report.stats.sessions_torn_down, 1);
        assert_eq!(h.pool.free_slots(), 4);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_shot_session_ends_after_first_frame() {
        let h = start(SchedulerSettings::default());
        let (tx, mut rx) = mpsc::channel(1);
        h.handle.open_http(peer(), true, tx).await.unwrap();

        push_frame(&h, 3).await;
        assert_eq!(rx.recv().await.unwrap().sequence(), 3);
        assert!(rx.recv().await.is_none());

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhaustion_counted() {
        let h = start(SchedulerSettings::default());
        h.capture.send(CaptureEvent::Exhausted).await.unwrap();

        let report = h.handle.report().await.unwrap();
        assert_eq!(report.stats.capture_skipped, 1);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_rtsp_session_reaped() {
        let settings = SchedulerSettings {
            session_timeout: Duration::from_millis(50),
            reap_interval: Duration::from_millis(10),
            ..SchedulerSettings::default()
        };
        let h = start(settings);
        let (tx, mut rx) = mpsc::channel(1);
        h.handle.open_rtsp(peer(), tx).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(closed, Ok(None)));

        let report = h.handle.report().await.unwrap();
        assert_eq!(report.stats.sessions_reaped, 1);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_keep_alive_holds_off_reaping() {
        let settings = SchedulerSettings {
            session_timeout: Duration::from_millis(200),
            reap_interval: Duration::from_millis(10),
            ..SchedulerSettings::default()
        };
        let h = start(settings);
        let (tx, mut rx) = mpsc::channel(1);
        let id = h.handle.open_rtsp(peer(), tx).await.unwrap();

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.handle.keep_alive(id).await;
        }

        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)));
        let report = h.handle.report().await.unwrap();
        assert_eq!(report.stats.sessions_reaped, 0);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_keep_alive_waits_for_queue_room() {
        let settings = SchedulerSettings {
            command_queue: 1,
            ..SchedulerSettings::default()
        };
        let (_capture, capture_rx) = mpsc::channel(1);
        let (scheduler, handle) = Scheduler::new(
            settings,
            FramePool::new(1, 64),
            capture_rx,
            Arc::new(AtomicUsize::new(0)),
        );
        let id = SessionId::from_raw(7);

        // The loop is not running yet, so the second keep-alive has no room
        handle.keep_alive(id).await;
        let mut second = tokio_test::task::spawn(handle.keep_alive(id));
        tokio_test::assert_pending!(second.poll());

        let task = scheduler.spawn();
        tokio::time::timeout(Duration::from_secs(2), async {
            while second.poll().is_pending() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let h = start(SchedulerSettings::default());
        h.handle.shutdown().await;
        h.task.await.unwrap();

        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(
            h.handle.open_http(peer(), false, tx).await.unwrap_err(),
            SchedulerError::Stopped
        );
    }
}
