//! Tokio driver for one relay session.
//!
//! The reactor owns the sockets; the session owns the buffers. Each turn of
//! the loop waits for readiness on any socket whose buffers have room or
//! pending output, or for an upstream connect to finish, then moves bytes
//! between the socket and its port and reports the event to the session.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use plexus_relay::{BackendId, DuplexPort, Peer, Protocol, Session, SessionStats};
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::upstream::UpstreamConnector;

/// Largest single socket read.
const READ_CHUNK: usize = 16 * 1024;

type ConnectFuture = BoxFuture<'static, (BackendId, SocketAddr, io::Result<TcpStream>)>;

/// Bytes moved through one session's sockets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_from_frontend: u64,
    pub bytes_to_frontend: u64,
    pub bytes_from_backends: u64,
    pub bytes_to_backends: u64,
}

impl TrafficStats {
    fn record_read(&mut self, peer: Peer, n: usize) {
        match peer {
            Peer::Frontend => self.bytes_from_frontend += n as u64,
            Peer::Backend(_) => self.bytes_from_backends += n as u64,
        }
    }

    fn record_write(&mut self, peer: Peer, n: usize) {
        match peer {
            Peer::Frontend => self.bytes_to_frontend += n as u64,
            Peer::Backend(_) => self.bytes_to_backends += n as u64,
        }
    }
}

/// Summary returned when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub traffic: TrafficStats,
    pub session: SessionStats,
    /// Reason code of the error that closed the session, if any.
    pub close_reason: Option<&'static str>,
}

enum Event {
    Ready(Peer, io::Result<Ready>),
    Connect(BackendId, SocketAddr, io::Result<TcpStream>),
    Idle,
    Stalled,
}

/// Drives a [`Session`] over real sockets.
pub struct Reactor<M: Protocol> {
    session: Session<M, UpstreamConnector>,
    sockets: Vec<(Peer, TcpStream)>,
    connecting: FuturesUnordered<ConnectFuture>,
    idle_timeout: Option<Duration>,
    traffic: TrafficStats,
}

impl<M: Protocol> Reactor<M> {
    pub fn new(
        frontend: TcpStream,
        session: Session<M, UpstreamConnector>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            sockets: vec![(Peer::Frontend, frontend)],
            connecting: FuturesUnordered::new(),
            idle_timeout,
            traffic: TrafficStats::default(),
        }
    }

    /// Run until the session closes.
    pub async fn run(mut self) -> SessionReport {
        loop {
            self.start_connects();
            if self.session.is_closed() {
                break;
            }

            match self.next_event().await {
                Event::Ready(peer, Ok(ready)) => self.handle_ready(peer, ready),
                Event::Ready(peer, Err(e)) => self.session.exception(peer, e),
                Event::Connect(id, addr, result) => self.handle_connect(id, addr, result),
                Event::Idle => {
                    info!(timeout = ?self.idle_timeout, "Session idle, closing");
                    self.session.close_all();
                }
                Event::Stalled => {
                    warn!("Session has nothing to wait on, closing");
                    self.session.close_all();
                }
            }
        }

        for (peer, _) in &self.sockets {
            self.session.removed(*peer);
        }

        let report = SessionReport {
            traffic: self.traffic,
            session: self.session.stats(),
            close_reason: self.session.close_reason().map(|e| e.reason_code()),
        };
        debug!(?report, "Session finished");
        report
    }

    fn start_connects(&mut self) {
        for pending in self.session.connector_mut().take_pending() {
            let connect = async move {
                let result = match timeout(pending.timeout, TcpStream::connect(pending.addr)).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
                };
                (pending.id, pending.addr, result)
            };
            self.connecting.push(connect.boxed());
        }
    }

    async fn next_event(&mut self) -> Event {
        let mut ready = FuturesUnordered::new();
        for (peer, stream) in &self.sockets {
            let Some(port) = self.session.port(*peer) else {
                continue;
            };
            let mut interest: Option<Interest> = None;
            if port.input_free() > 0 {
                interest = Some(Interest::READABLE);
            }
            if port.output_used() > 0 {
                interest = Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
            }
            if let Some(interest) = interest {
                let peer = *peer;
                ready.push(async move { (peer, stream.ready(interest).await) });
            }
        }

        let idle_timeout = self.idle_timeout;
        tokio::select! {
            Some((peer, result)) = ready.next(), if !ready.is_empty() => Event::Ready(peer, result),
            Some((id, addr, result)) = self.connecting.next(), if !self.connecting.is_empty() => {
                Event::Connect(id, addr, result)
            }
            _ = idle(idle_timeout), if idle_timeout.is_some() => Event::Idle,
            else => Event::Stalled,
        }
    }

    fn handle_ready(&mut self, peer: Peer, ready: Ready) {
        if ready.is_writable() {
            self.flush(peer);
        }
        if (ready.is_readable() || ready.is_read_closed()) && !self.session.is_closed() {
            self.fill(peer);
        }
    }

    /// Read from the socket into the port's input buffer.
    fn fill(&mut self, peer: Peer) {
        let Some((_, stream)) = self.sockets.iter().find(|(p, _)| *p == peer) else {
            return;
        };
        let Some(port) = self.session.port_mut(peer) else {
            return;
        };
        let free = port.input_free().min(READ_CHUNK);
        if free == 0 {
            return;
        }

        let mut buf = vec![0u8; free];
        match stream.try_read(&mut buf) {
            Ok(0) => {
                debug!(?peer, "Peer closed connection");
                self.session.closed(peer);
            }
            Ok(n) => {
                port.push_input(&buf[..n]);
                self.traffic.record_read(peer, n);
                self.session.readable(peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.session.exception(peer, e),
        }
    }

    /// Write pending port output to the socket.
    fn flush(&mut self, peer: Peer) {
        let Some((_, stream)) = self.sockets.iter().find(|(p, _)| *p == peer) else {
            return;
        };
        let Some(port) = self.session.port_mut(peer) else {
            return;
        };
        if port.output_used() == 0 {
            return;
        }

        match stream.try_write(port.output_chunk()) {
            Ok(n) => {
                port.consume_output(n);
                self.traffic.record_write(peer, n);
                self.session.writable(peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.session.exception(peer, e),
        }
    }

    fn handle_connect(&mut self, id: BackendId, addr: SocketAddr, result: io::Result<TcpStream>) {
        let pool = self.session.connector().pool().clone();
        match result {
            Ok(stream) => {
                pool.mark_healthy(addr);
                if self.session.backend(id).is_none() {
                    debug!(backend_id = %id, "Dropping connection for closed backend");
                    return;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(backend_id = %id, error = %e, "Failed to set TCP_NODELAY");
                }
                debug!(backend_id = %id, upstream = %addr, "Upstream connected");
                self.sockets.push((Peer::Backend(id), stream));
                self.session.connected(id);
            }
            Err(e) => {
                warn!(backend_id = %id, upstream = %addr, error = %e, "Upstream connection failed");
                pool.mark_unhealthy(addr);
                self.session.exception(Peer::Backend(id), e);
            }
        }
    }
}

async fn idle(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}
