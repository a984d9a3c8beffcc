//! HTTP MJPEG fan-out: a failing client must not disturb the others

mod common;

use camstream::capture::CaptureEvent;
use camstream::http::mjpeg::{part_header, stream_header};
use camstream::http::{HttpRequest, MjpegHandler, RequestHandler, StillHandler, WebServer};
use camstream::pool::FramePool;
use camstream::scheduler::{Scheduler, SchedulerHandle, SchedulerSettings};
use std::io;
use std::pin::Pin;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(5);

/// Accepts `budget` bytes, then fails every write
struct FailingSink {
    budget: usize,
}

impl AsyncWrite for FailingSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.budget == 0 {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone")));
        }
        let n = buf.len().min(self.budget);
        self.budget -= n;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct Harness {
    pool: FramePool,
    capture: mpsc::Sender<CaptureEvent>,
    handle: SchedulerHandle,
}

fn start(settings: SchedulerSettings) -> Harness {
    let pool = FramePool::new(4, 16 * 1024);
    let (capture, capture_rx) = mpsc::channel(4);
    let (scheduler, handle) = Scheduler::new(
        settings,
        pool.clone(),
        capture_rx,
        Arc::new(AtomicUsize::new(0)),
    );
    scheduler.spawn();

    Harness {
        pool,
        capture,
        handle,
    }
}

fn request() -> HttpRequest {
    HttpRequest {
        method: "GET".to_string(),
        path: "/stream".to_string(),
        query: None,
        headers: Vec::new(),
        peer: "127.0.0.1:40000".parse().unwrap(),
    }
}

async fn push(h: &Harness, seq: u64, jpeg: &[u8]) {
    let mut slot = h.pool.acquire().unwrap();
    slot.extend(jpeg).unwrap();
    h.capture
        .send(CaptureEvent::Captured(slot.commit(seq, Instant::now())))
        .await
        .unwrap();
}

async fn wait_for_sessions(handle: &SchedulerHandle, open: usize) {
    timeout(WAIT, async {
        loop {
            if handle.report().await.unwrap().stats.open_sessions == open {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session count never reached");
}

/// Reads one multipart part and returns its JPEG bytes
async fn read_part<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(reader.read_u8().await.unwrap());
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("--imgboundary\r\n"), "unexpected part head {:?}", head);
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .unwrap()
        .parse()
        .unwrap();

    let mut body = vec![0u8; len + 2];
    reader.read_exact(&mut body).await.unwrap();
    assert!(body.ends_with(b"\r\n"));
    body.truncate(len);
    body
}

#[tokio::test]
async fn test_failing_client_is_deregistered() {
    let h = start(SchedulerSettings::default());
    let handler = Arc::new(MjpegHandler::new(h.handle.clone(), 2, 0));

    // The failing client accepts the response head and nothing more
    let failing = FailingSink {
        budget: stream_header().len(),
    };
    let failing_task = {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { handler.handle(request(), Box::new(failing)).await })
    };

    let (server_side, mut client_side) = tokio::io::duplex(64 * 1024);
    let healthy_task = {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { handler.handle(request(), Box::new(server_side)).await })
    };

    wait_for_sessions(&h.handle, 2).await;

    let mut head = vec![0u8; stream_header().len()];
    client_side.read_exact(&mut head).await.unwrap();
    assert_eq!(head, stream_header().as_bytes());

    let frame_a = common::baseline_jpeg(320, 240, 500);
    push(&h, 0, &frame_a).await;
    assert_eq!(read_part(&mut client_side).await, frame_a);

    let result = timeout(WAIT, failing_task).await.unwrap().unwrap();
    assert_err!(result);
    wait_for_sessions(&h.handle, 1).await;

    // The healthy client keeps receiving later frames
    let frame_b = common::baseline_jpeg(320, 240, 800);
    push(&h, 1, &frame_b).await;
    assert_eq!(read_part(&mut client_side).await, frame_b);

    let report = h.handle.report().await.unwrap();
    assert_eq!(report.stats.sessions_torn_down, 1);

    drop(client_side);
    push(&h, 2, &frame_a).await;
    let result = timeout(WAIT, healthy_task).await.unwrap().unwrap();
    assert_err!(result);
    wait_for_sessions(&h.handle, 0).await;
    assert_eq!(h.pool.free_slots(), 4);

    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_client_limit_gets_503() {
    let settings = SchedulerSettings {
        max_http_clients: 1,
        ..SchedulerSettings::default()
    };
    let h = start(settings);
    let handler = Arc::new(MjpegHandler::new(h.handle.clone(), 2, 25));

    let (first_server, _first_client) = tokio::io::duplex(64 * 1024);
    {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { handler.handle(request(), Box::new(first_server)).await });
    }
    wait_for_sessions(&h.handle, 1).await;

    let (second_server, mut second_client) = tokio::io::duplex(64 * 1024);
    assert_ok!(handler.handle(request(), Box::new(second_server)).await);

    let mut response = String::new();
    second_client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 503"));
    assert!(response.ends_with("Already streaming!"));

    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_still_over_real_socket() {
    let h = start(SchedulerSettings::default());

    let web = WebServer::new("127.0.0.1", 0);
    web.add_handler("/still", Arc::new(StillHandler::new(h.handle.clone())));
    let addr = web.start().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /still HTTP/1.1\r\nHost: cam\r\n\r\n")
        .await
        .unwrap();

    wait_for_sessions(&h.handle, 1).await;
    let frame = common::baseline_jpeg(160, 120, 64);
    push(&h, 0, &frame).await;

    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();

    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap();
    let head = String::from_utf8_lossy(&response[..split]);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: image/jpeg"));
    assert_eq!(&response[split + 4..], &frame[..]);

    // One-shot sessions end after their frame
    wait_for_sessions(&h.handle, 0).await;

    web.stop().await;
    h.handle.shutdown().await;
}

#[test]
fn test_part_header_format() {
    assert_eq!(
        part_header(10),
        "--imgboundary\r\nContent-Type: image/jpeg\r\nContent-Length: 10\r\n\r\n"
    );
}
