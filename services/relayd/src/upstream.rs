//! Upstream pool and the session connector built on it.
//!
//! - Round-robin among eligible upstreams
//! - An upstream that failed to connect sits out a cooldown before it is
//!   tried again
//! - Connects are started by the reactor; the connector only records them

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use std::{io, mem};

use plexus_relay::{BackendId, BufferedPort, ConnectOptions, Connector};
use tracing::{debug, warn};

/// How long a failed upstream is skipped.
pub const DEFAULT_FAILURE_COOLDOWN: Duration = Duration::from_secs(10);

/// Health status of an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Last connect succeeded.
    Healthy,
    /// Last connect failed.
    Unhealthy,
    /// Never connected to yet.
    Unknown,
}

#[derive(Debug)]
struct UpstreamState {
    addr: SocketAddr,
    health: HealthStatus,
    last_failure: Option<Instant>,
    consecutive_failures: u32,
}

impl UpstreamState {
    fn is_eligible(&self, now: Instant, cooldown: Duration) -> bool {
        match self.health {
            HealthStatus::Healthy | HealthStatus::Unknown => true,
            HealthStatus::Unhealthy => self
                .last_failure
                .is_none_or(|at| now.duration_since(at) >= cooldown),
        }
    }
}

/// Upstream addresses shared by every session of a listener.
#[derive(Debug)]
pub struct UpstreamPool {
    upstreams: Mutex<Vec<UpstreamState>>,
    rr_counter: AtomicUsize,
    cooldown: Duration,
    selections: AtomicU64,
    refusals: AtomicU64,
}

impl UpstreamPool {
    pub fn new(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self::with_cooldown(addrs, DEFAULT_FAILURE_COOLDOWN)
    }

    pub fn with_cooldown(addrs: impl IntoIterator<Item = SocketAddr>, cooldown: Duration) -> Self {
        let upstreams = addrs
            .into_iter()
            .map(|addr| UpstreamState {
                addr,
                health: HealthStatus::Unknown,
                last_failure: None,
                consecutive_failures: 0,
            })
            .collect();
        Self {
            upstreams: Mutex::new(upstreams),
            rr_counter: AtomicUsize::new(0),
            cooldown,
            selections: AtomicU64::new(0),
            refusals: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<UpstreamState>> {
        self.upstreams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Upstreams currently eligible for new connections.
    pub fn eligible_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|s| s.is_eligible(now, self.cooldown))
            .count()
    }

    pub fn health(&self, addr: SocketAddr) -> Option<HealthStatus> {
        self.lock().iter().find(|s| s.addr == addr).map(|s| s.health)
    }

    /// Pick the next eligible upstream round-robin.
    pub fn select(&self) -> Option<SocketAddr> {
        let now = Instant::now();
        let upstreams = self.lock();
        let eligible: Vec<SocketAddr> = upstreams
            .iter()
            .filter(|s| s.is_eligible(now, self.cooldown))
            .map(|s| s.addr)
            .collect();

        if eligible.is_empty() {
            self.refusals.fetch_add(1, Ordering::Relaxed);
            warn!(upstreams = upstreams.len(), "No eligible upstreams");
            return None;
        }

        self.selections.fetch_add(1, Ordering::Relaxed);
        let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[idx])
    }

    pub fn mark_healthy(&self, addr: SocketAddr) {
        if let Some(state) = self.lock().iter_mut().find(|s| s.addr == addr) {
            state.health = HealthStatus::Healthy;
            state.consecutive_failures = 0;
        }
    }

    pub fn mark_unhealthy(&self, addr: SocketAddr) {
        if let Some(state) = self.lock().iter_mut().find(|s| s.addr == addr) {
            state.health = HealthStatus::Unhealthy;
            state.last_failure = Some(Instant::now());
            state.consecutive_failures += 1;
            debug!(
                upstream = %addr,
                consecutive_failures = state.consecutive_failures,
                "Upstream marked unhealthy"
            );
        }
    }

    pub fn stats(&self) -> UpstreamPoolStats {
        UpstreamPoolStats {
            selections: self.selections.load(Ordering::Relaxed),
            refusals: self.refusals.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for an upstream pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamPoolStats {
    pub selections: u64,
    pub refusals: u64,
}

/// A connect the reactor still has to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConnect {
    pub id: BackendId,
    pub addr: SocketAddr,
    pub timeout: Duration,
}

/// Per-session connector over a shared [`UpstreamPool`].
///
/// `open` hands back an unconnected buffered port and queues the connect;
/// the reactor drains the queue with [`UpstreamConnector::take_pending`].
#[derive(Debug)]
pub struct UpstreamConnector {
    pool: Arc<UpstreamPool>,
    pending: Vec<PendingConnect>,
}

impl UpstreamConnector {
    pub fn new(pool: Arc<UpstreamPool>) -> Self {
        Self {
            pool,
            pending: Vec::new(),
        }
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    /// Connects queued since the last call.
    pub fn take_pending(&mut self) -> Vec<PendingConnect> {
        mem::take(&mut self.pending)
    }
}

impl Connector for UpstreamConnector {
    type Port = BufferedPort;
    type Endpoint = SocketAddr;

    fn resolve(&mut self, _frontend: &BufferedPort) -> Option<SocketAddr> {
        self.pool.select()
    }

    fn open(&mut self, id: BackendId, endpoint: &SocketAddr, options: &ConnectOptions) -> io::Result<BufferedPort> {
        debug!(backend_id = %id, upstream = %endpoint, "Queueing upstream connect");
        self.pending.push(PendingConnect {
            id,
            addr: *endpoint,
            timeout: options.timeout,
        });
        Ok(BufferedPort::new(options.in_buffer, options.out_buffer))
    }
}

#[cfg(test)]
mod tests {
    use plexus_relay::DuplexPort;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_round_robin() {
        let pool = UpstreamPool::new([addr(1), addr(2), addr(3)]);
        let picks: Vec<_> = (0..6).filter_map(|_| pool.select()).collect();
        assert_eq!(picks, vec![addr(1), addr(2), addr(3), addr(1), addr(2), addr(3)]);
        assert_eq!(pool.stats().selections, 6);
    }

    #[test]
    fn test_unhealthy_skipped_during_cooldown() {
        let pool = UpstreamPool::with_cooldown([addr(1), addr(2)], Duration::from_secs(60));
        pool.mark_unhealthy(addr(1));

        assert_eq!(pool.eligible_count(), 1);
        assert_eq!(pool.health(addr(1)), Some(HealthStatus::Unhealthy));
        for _ in 0..4 {
            assert_eq!(pool.select(), Some(addr(2)));
        }

        pool.mark_healthy(addr(1));
        assert_eq!(pool.eligible_count(), 2);
    }

    #[test]
    fn test_unhealthy_retried_after_cooldown() {
        let pool = UpstreamPool::with_cooldown([addr(1)], Duration::ZERO);
        pool.mark_unhealthy(addr(1));
        assert_eq!(pool.select(), Some(addr(1)));
    }

    #[test]
    fn test_no_eligible_upstreams() {
        let pool = UpstreamPool::with_cooldown([addr(1)], Duration::from_secs(60));
        pool.mark_unhealthy(addr(1));
        assert_eq!(pool.select(), None);
        assert_eq!(pool.stats().refusals, 1);
    }

    #[test]
    fn test_connector_queues_connects() {
        let pool = Arc::new(UpstreamPool::new([addr(9)]));
        let mut connector = UpstreamConnector::new(Arc::clone(&pool));
        let frontend = BufferedPort::new(8, 8);

        let endpoint = connector.resolve(&frontend).unwrap();
        let options = ConnectOptions {
            in_buffer: 32,
            out_buffer: 64,
            ..ConnectOptions::default()
        };
        let id = BackendId::new(1).unwrap();
        let port = connector.open(id, &endpoint, &options).unwrap();

        assert_eq!(port.input_free(), 32);
        assert_eq!(port.output_free(), 64);
        assert_eq!(
            connector.take_pending(),
            vec![PendingConnect {
                id,
                addr: addr(9),
                timeout: options.timeout,
            }]
        );
        assert!(connector.take_pending().is_empty());
    }
}
