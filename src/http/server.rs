//! Minimal shared web server
//!
//! Handlers are registered per path before or after `start`; the accept loop
//! looks them up for every connection.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{respond, HttpError, HttpRequest, RequestHandler, MAX_HEAD_SIZE};

/// Clients must send their request head within this time
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

type Routes = Arc<RwLock<HashMap<String, Arc<dyn RequestHandler>>>>;

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct WebServer {
    bind: String,
    port: u16,
    routes: Routes,
    running: Mutex<Option<Running>>,
}

impl WebServer {
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            routes: Arc::new(RwLock::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Mounts `handler` at `path`, replacing any previous handler there
    pub fn add_handler(&self, path: &str, handler: Arc<dyn RequestHandler>) {
        debug!(path, "Registering HTTP handler");
        self.routes.write().insert(path.to_string(), handler);
    }

    pub fn has_handler(&self, path: &str) -> bool {
        self.routes.read().contains_key(path)
    }

    /// Binds the listener and starts accepting connections
    pub async fn start(&self) -> Result<SocketAddr, HttpError> {
        if self.running.lock().is_some() {
            return Err(HttpError::AlreadyStarted);
        }

        let listener = TcpListener::bind((self.bind.as_str(), self.port)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.routes), shutdown_rx));

        let mut running = self.running.lock();
        if running.is_some() {
            // Lost a race with a concurrent start
            task.abort();
            return Err(HttpError::AlreadyStarted);
        }
        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });

        info!(addr = %local_addr, "Web server listening");
        Ok(local_addr)
    }

    /// Stops accepting; connections already handed to handlers continue
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.task.await {
                warn!(error = %e, "Web server task ended abnormally");
            }
            info!("Web server stopped");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }
}

async fn accept_loop(listener: TcpListener, routes: Routes, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let routes = Arc::clone(&routes);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, routes).await {
                            debug!(peer = %peer, error = %e, "HTTP connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    routes: Routes,
) -> Result<(), HttpError> {
    let _ = stream.set_nodelay(true);

    let request = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut stream, peer)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            let _ = respond(&mut stream, 400, "Bad Request", "text/plain", b"Bad Request").await;
            return Err(e);
        }
        Err(_) => {
            debug!(peer = %peer, "Timed out waiting for request head");
            return Ok(());
        }
    };

    debug!(peer = %peer, method = %request.method, path = %request.path, "HTTP request");

    if request.method != "GET" {
        return respond(
            &mut stream,
            405,
            "Method Not Allowed",
            "text/plain",
            b"Method Not Allowed",
        )
        .await;
    }

    let handler = routes.read().get(&request.path).cloned();
    match handler {
        Some(handler) => handler.handle(request, Box::new(stream)).await,
        None => respond(&mut stream, 404, "Not Found", "text/html; charset=utf-8", NOT_FOUND_PAGE).await,
    }
}

/// Reads until the end of the request head; `None` if the peer hung up first
async fn read_head(stream: &mut TcpStream, peer: SocketAddr) -> Result<Option<HttpRequest>, HttpError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(request) = HttpRequest::parse(&buf, peer)? {
            return Ok(Some(request));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge(MAX_HEAD_SIZE));
        }
    }
}

const NOT_FOUND_PAGE: &[u8] = br#"<!DOCTYPE html>
<html>
<head><title>404 Not Found</title></head>
<body>
    <h1>404 - Page Not Found</h1>
    <p>The requested page was not found.</p>
    <p><a href="/">Go to Home</a></p>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ByteSink;
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;

    struct Hello;

    #[async_trait]
    impl RequestHandler for Hello {
        async fn handle(&self, request: HttpRequest, mut sink: Box<dyn ByteSink>) -> Result<(), HttpError> {
            let body = format!("hello {}", request.query.unwrap_or_default());
            respond(&mut *sink, 200, "OK", "text/plain", body.as_bytes()).await
        }
    }

    async fn get(addr: SocketAddr, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", target).as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_routes_and_404() {
        let server = WebServer::new("127.0.0.1", 0);
        server.add_handler("/hello", Arc::new(Hello));
        let addr = server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        let ok = get(addr, "/hello?world").await;
        assert!(ok.starts_with("HTTP/1.1 200 OK"));
        assert!(ok.ends_with("hello world"));

        let missing = get(addr, "/missing").await;
        assert!(missing.starts_with("HTTP/1.1 404 Not Found"));

        server.stop().await;
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_handler_added_after_start() {
        let server = WebServer::new("127.0.0.1", 0);
        let addr = server.start().await.unwrap();

        server.add_handler("/late", Arc::new(Hello));
        assert!(get(addr, "/late").await.starts_with("HTTP/1.1 200 OK"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let server = WebServer::new("127.0.0.1", 0);
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(HttpError::AlreadyStarted)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_non_get_rejected() {
        let server = WebServer::new("127.0.0.1", 0);
        server.add_handler("/hello", Arc::new(Hello));
        let addr = server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST /hello HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 405"));

        server.stop().await;
    }
}
