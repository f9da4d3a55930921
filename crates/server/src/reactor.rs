//! Single-threaded polling reactor.
//!
//! # Architecture Notes
//!
//! All sockets are non-blocking and serviced from one thread. Each pass of
//! [`Reactor::poll_once`] accepts new connections, then visits every
//! connection once, handling its events to completion before moving on:
//!
//! - `on_accept`: register the socket as pending until its request head
//!   arrives, then classify it as a WebSocket upgrade or a plain HTTP request
//! - `on_message`: hand a complete WebSocket message to the upload session
//! - `on_writable`: send at most one queued reply
//! - `on_close`: drop the connection and its session
//!
//! Uploads execute on this thread (under the engine lock), so a slow script
//! stalls the reactor for its duration.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ledsand_engine::{Engine, UploadError, UploadSession};
use tungstenite::handshake::server::{NoCallback, ServerHandshake};
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tungstenite::{Message, WebSocket};

use crate::http::{self, Response, StatusContext, MAX_HEAD_LEN};
use crate::{ServerConfig, ServerMetrics};

/// Sleep between passes that found nothing to do.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// How long a connection may take to send its request head or finish the
/// WebSocket handshake.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the peer to acknowledge a close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Unclassified sockets held at once; more are dropped on accept.
const MAX_PENDING: usize = 64;

/// Write timeout for plain HTTP responses.
const HTTP_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

type Handshake = MidHandshake<ServerHandshake<TcpStream, NoCallback>>;

enum Connection {
    /// Waiting for a complete request head.
    Pending { stream: TcpStream, since: Instant },
    /// Handshake response not fully written yet.
    Handshaking { handshake: Handshake, since: Instant },
    /// Established upload connection.
    Open(Box<Upload>),
}

impl Connection {
    fn is_upload(&self) -> bool {
        !matches!(self, Connection::Pending { .. })
    }
}

struct Upload {
    ws: WebSocket<TcpStream>,
    session: UploadSession,
    drops_reported: u64,
    closing: Option<Instant>,
}

pub struct Reactor {
    listener: TcpListener,
    engine: Engine,
    config: ServerConfig,
    metrics: ServerMetrics,
    connections: HashMap<u64, (SocketAddr, Connection)>,
    next_id: u64,
    busy: bool,
}

impl Reactor {
    /// Bind the listening socket. Nothing is served until `run`/`poll_once`.
    pub fn bind(addr: impl ToSocketAddrs, engine: Engine, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        log::info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            engine,
            config,
            metrics: ServerMetrics::new(),
            connections: HashMap::new(),
            next_id: 1,
            busy: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Established (or handshaking) upload connections.
    pub fn connection_count(&self) -> usize {
        self.connections.values().filter(|(_, c)| c.is_upload()).count()
    }

    /// Serve until `running` is cleared, then close every connection.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            if !self.poll_once() {
                thread::sleep(IDLE_SLEEP);
            }
        }
        self.shutdown();
    }

    /// One pass over the listener and every connection.
    ///
    /// Returns whether anything happened, so callers can back off when idle.
    pub fn poll_once(&mut self) -> bool {
        self.busy = false;

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.on_accept(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // Out of descriptors or an aborted handshake; retry next pass
                    log::warn!("Accept error: {}", e);
                    break;
                }
            }
        }

        let ids: Vec<u64> = self.connections.keys().copied().collect();
        for id in ids {
            let Some((peer, connection)) = self.connections.remove(&id) else {
                continue;
            };
            let next = match connection {
                Connection::Pending { stream, since } => self.service_pending(id, peer, stream, since),
                Connection::Handshaking { handshake, since } => {
                    self.service_handshake(id, peer, handshake.handshake(), since)
                }
                Connection::Open(upload) => self.service_upload(id, peer, upload),
            };
            match next {
                Some(connection) => {
                    self.connections.insert(id, (peer, connection));
                }
                None => self.on_close(id, peer),
            }
        }

        self.busy
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.busy = true;
        let pending = self.connections.len() - self.connection_count();
        if pending >= MAX_PENDING {
            log::warn!("Connection refused from {}: {} requests already pending", peer, pending);
            ServerMetrics::bump(&self.metrics.connections_refused, 1);
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("Cannot make socket from {} non-blocking: {}", peer, e);
            return;
        }
        let _ = stream.set_nodelay(true);

        let id = self.next_id;
        self.next_id += 1;
        log::debug!("Accepted connection {} from {}", id, peer);
        self.connections.insert(id, (peer, Connection::Pending { stream, since: Instant::now() }));
    }

    fn on_close(&mut self, id: u64, peer: SocketAddr) {
        log::debug!("Connection {} from {} closed", id, peer);
    }

    fn service_pending(&mut self, id: u64, peer: SocketAddr, stream: TcpStream, since: Instant) -> Option<Connection> {
        let mut buf = [0u8; MAX_HEAD_LEN];
        match stream.peek(&mut buf) {
            Ok(0) => None,
            Ok(n) => match http::head_len(&buf[..n]) {
                Some(len) => self.classify(id, peer, stream, &buf[..len]),
                None if n >= MAX_HEAD_LEN => {
                    respond(stream, &Response::text(431, "Request head too large"));
                    None
                }
                None => keep_pending(stream, since, peer),
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => keep_pending(stream, since, peer),
            Err(e) => {
                log::debug!("Read from {} failed: {}", peer, e);
                None
            }
        }
    }

    /// Route a complete request head: upgrade to an upload connection or
    /// answer it over plain HTTP.
    fn classify(&mut self, id: u64, peer: SocketAddr, mut stream: TcpStream, head: &[u8]) -> Option<Connection> {
        self.busy = true;
        let Some(request) = http::parse_head(head) else {
            respond(stream, &Response::text(400, "Bad Request"));
            return None;
        };

        if request.upgrade {
            if self.connection_count() >= self.config.max_clients {
                log::warn!(
                    "Connection refused from {}: limit of {} reached",
                    peer,
                    self.config.max_clients
                );
                ServerMetrics::bump(&self.metrics.connections_refused, 1);
                respond(stream, &Response::text(503, "Too many connections"));
                return None;
            }
            let config = self.ws_config();
            let since = Instant::now();
            return self.service_handshake(id, peer, tungstenite::accept_with_config(stream, Some(config)), since);
        }

        // Consume the peeked head; the body, if any, is ignored
        let mut consumed = vec![0u8; head.len()];
        if let Err(e) = stream.read_exact(&mut consumed) {
            log::debug!("Read from {} failed: {}", peer, e);
            return None;
        }
        ServerMetrics::bump(&self.metrics.http_requests, 1);
        let ctx = StatusContext {
            engine: &self.engine,
            examples_dir: &self.config.examples_dir,
            connections: self.connection_count(),
            metrics: &self.metrics,
        };
        let response = http::route(&request.method, &request.path, &self.config.mount, &ctx);
        log::debug!("{} {} -> {}", request.method, request.path, response.status);
        respond(stream, &response);
        None
    }

    fn service_handshake(
        &mut self,
        id: u64,
        peer: SocketAddr,
        result: Result<WebSocket<TcpStream>, HandshakeError<ServerHandshake<TcpStream, NoCallback>>>,
        since: Instant,
    ) -> Option<Connection> {
        match result {
            Ok(ws) => {
                self.busy = true;
                ServerMetrics::bump(&self.metrics.connections_accepted, 1);
                log::info!("Upload connection {} opened from {}", id, peer);
                let session = UploadSession::new(self.engine.clone(), self.config.max_upload, self.config.outbox_depth);
                Some(Connection::Open(Box::new(Upload {
                    ws,
                    session,
                    drops_reported: 0,
                    closing: None,
                })))
            }
            Err(HandshakeError::Interrupted(handshake)) => {
                if since.elapsed() > HEAD_TIMEOUT {
                    log::debug!("Handshake with {} timed out", peer);
                    return None;
                }
                Some(Connection::Handshaking { handshake, since })
            }
            Err(HandshakeError::Failure(e)) => {
                log::debug!("Handshake with {} failed: {}", peer, e);
                None
            }
        }
    }

    fn service_upload(&mut self, id: u64, peer: SocketAddr, mut upload: Box<Upload>) -> Option<Connection> {
        if let Some(since) = upload.closing {
            return drain_close(upload, since, peer);
        }

        loop {
            match upload.ws.read() {
                Ok(Message::Text(text)) => self.on_message(id, &mut upload, text.as_bytes()),
                Ok(Message::Binary(data)) => self.on_message(id, &mut upload, &data),
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                    log::info!("Upload connection {} from {} closed by peer", id, peer);
                    return None;
                }
                Err(tungstenite::Error::Capacity(e)) => {
                    log::warn!("Upload connection {} from {}: {}", id, peer, e);
                    self.reject_oversize(&mut upload);
                }
                Err(e) => {
                    log::debug!("Upload connection {} from {} failed: {}", id, peer, e);
                    return None;
                }
            }
            if upload.closing.is_some() {
                return Some(Connection::Open(upload));
            }
        }

        if self.on_writable(&mut upload, peer) {
            Some(Connection::Open(upload))
        } else {
            None
        }
    }

    fn on_message(&mut self, id: u64, upload: &mut Upload, data: &[u8]) {
        self.busy = true;
        match upload.session.receive(data, true) {
            Ok(()) => {
                let dropped = upload.session.outbox().dropped();
                if dropped > upload.drops_reported {
                    ServerMetrics::bump(&self.metrics.notifications_dropped, dropped - upload.drops_reported);
                    upload.drops_reported = dropped;
                }
            }
            Err(UploadError::TooLarge { .. }) => {
                log::warn!("Upload connection {}: message exceeds {} bytes", id, self.config.max_upload);
                self.reject_oversize(upload);
            }
            Err(UploadError::Closed) => {}
        }
    }

    fn reject_oversize(&mut self, upload: &mut Upload) {
        ServerMetrics::bump(&self.metrics.oversize_closed, 1);
        begin_close(upload, CloseCode::Size, "Upload too large");
    }

    /// Flush pending output and send at most one queued reply.
    fn on_writable(&mut self, upload: &mut Upload, peer: SocketAddr) -> bool {
        match upload.ws.flush() {
            Ok(()) => {}
            Err(tungstenite::Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) => {
                log::debug!("Write to {} failed: {}", peer, e);
                return false;
            }
        }

        let Some(reply) = upload.session.next_notification() else {
            return true;
        };
        self.busy = true;
        match upload.ws.send(Message::Text(reply)) {
            Ok(()) => true,
            // Queued inside the socket wrapper; flushed on a later pass
            Err(tungstenite::Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                log::debug!("Write to {} failed: {}", peer, e);
                false
            }
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        // One byte of headroom so the session sees (and rejects) cap + 1
        config.max_message_size = Some(self.config.max_upload + 1);
        config.max_frame_size = Some(self.config.max_upload + 1);
        config
    }

    /// Close every connection; used when the reactor stops.
    pub fn shutdown(&mut self) {
        for (id, (peer, connection)) in self.connections.drain() {
            if let Connection::Open(mut upload) = connection {
                begin_close(&mut upload, CloseCode::Away, "Server shutting down");
            }
            log::debug!("Connection {} from {} dropped at shutdown", id, peer);
        }
    }
}

fn keep_pending(stream: TcpStream, since: Instant, peer: SocketAddr) -> Option<Connection> {
    if since.elapsed() > HEAD_TIMEOUT {
        log::debug!("Request head from {} timed out", peer);
        return None;
    }
    Some(Connection::Pending { stream, since })
}

fn begin_close(upload: &mut Upload, code: CloseCode, reason: &str) {
    let frame = CloseFrame { code, reason: reason.to_string().into() };
    match upload.ws.close(Some(frame)) {
        Ok(()) => {}
        Err(tungstenite::Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => log::debug!("Close failed: {}", e),
    }
    upload.closing = Some(Instant::now());
}

/// Wait for the peer's close acknowledgement, bounded by `CLOSE_TIMEOUT`.
fn drain_close(mut upload: Box<Upload>, since: Instant, peer: SocketAddr) -> Option<Connection> {
    loop {
        match upload.ws.read() {
            Ok(_) => continue,
            Err(tungstenite::Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(_) => return None,
        }
    }
    if let Err(tungstenite::Error::Io(ref e)) = upload.ws.flush() {
        if e.kind() != io::ErrorKind::WouldBlock {
            return None;
        }
    }
    if since.elapsed() > CLOSE_TIMEOUT {
        log::debug!("Close handshake with {} timed out", peer);
        return None;
    }
    Some(Connection::Open(upload))
}

/// Write a plain HTTP response and close. Errors are logged and ignored.
fn respond(mut stream: TcpStream, response: &Response) {
    let result = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_write_timeout(Some(HTTP_WRITE_TIMEOUT)))
        .and_then(|_| stream.write_all(&response.to_bytes()))
        .and_then(|_| stream.flush());
    if let Err(e) = result {
        log::debug!("HTTP response write failed: {}", e);
    }
    let _ = stream.shutdown(Shutdown::Write);
}
