//! Test harness for relayd integration tests.
//!
//! Provides helpers to spawn TCP upstreams and a relay listener on loopback.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plexus_relayd::{Listener, ListenerConfig, ProxyHeaderMode, UpstreamPool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Upstream that echoes everything it receives.
#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Upstream that records what it receives and never answers.
#[allow(dead_code)]
pub struct RecordingBackend {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl RecordingBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let sink = Arc::clone(&received);
        tokio::spawn(async move {
            tokio::select! {
                accept_result = listener.accept() => {
                    if let Ok((mut stream, _)) = accept_result {
                        let mut buf = vec![0u8; 8192];
                        while let Ok(n) = stream.read(&mut buf).await {
                            if n == 0 {
                                break;
                            }
                            sink.lock().unwrap().extend_from_slice(&buf[..n]);
                        }
                    }
                }
                _ = &mut shutdown_rx => {}
            }
        });

        Ok(Self {
            addr,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Wait until at least `len` bytes arrived, or give up after `limit`.
    pub async fn wait_for(&self, len: usize, limit: Duration) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let data = self.received.lock().unwrap().clone();
            if data.len() >= len || tokio::time::Instant::now() >= deadline {
                return data;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for RecordingBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running relay listener.
#[allow(dead_code)]
pub struct RelayHandle {
    pub listen_addr: SocketAddr,
    pub listener: Arc<Listener>,
    task: JoinHandle<io::Result<()>>,
}

#[allow(dead_code)]
impl RelayHandle {
    pub async fn spawn(upstreams: Vec<SocketAddr>) -> io::Result<Self> {
        Self::spawn_with(upstreams, |_| {}).await
    }

    pub async fn spawn_with(
        upstreams: Vec<SocketAddr>,
        configure: impl FnOnce(&mut ListenerConfig),
    ) -> io::Result<Self> {
        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.proxy_header = ProxyHeaderMode::Off;
        configure(&mut config);

        let pool = Arc::new(UpstreamPool::new(upstreams));
        let listener = Arc::new(Listener::bind(config, pool).await?);
        let listen_addr = listener.local_addr()?;
        let task = tokio::spawn(Arc::clone(&listener).run());

        Ok(Self {
            listen_addr,
            listener,
            task,
        })
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
