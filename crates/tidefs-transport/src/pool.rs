//! Per-target TCP connection pools.
//!
//! Each target host gets a bounded queue of idle connections. `get`
//! returns an idle connection or dials with TCP_NODELAY; `put` returns
//! the connection unless a force-close flag is set or the pool is full.
//! A background reaper closes connections idle past the timeout, and an
//! I/O error that indicates the peer tore the connection down drains the
//! whole per-target pool.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections dialed eagerly when a target's pool is first created.
    pub min_idle: usize,
    /// Maximum idle connections retained per target.
    pub max_idle: usize,
    /// Idle age past which the reaper closes a connection.
    pub idle_timeout: Duration,
    /// Cadence of the background reaper.
    pub reap_interval: Duration,
    /// Dial timeout.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 5,
            max_idle: 100,
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Pool-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Idle connections across every target.
    pub total_idle: usize,
    /// Number of targets with a pool.
    pub targets: usize,
}

struct IdleConn {
    stream: TcpStream,
    idle_since: Instant,
}

struct TargetPool {
    idle: Mutex<VecDeque<IdleConn>>,
}

impl TargetPool {
    fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
        }
    }
}

/// Map of per-target bounded idle connection queues.
pub struct ConnectPool {
    config: PoolConfig,
    pools: RwLock<HashMap<String, Arc<TargetPool>>>,
}

impl ConnectPool {
    /// Creates a pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: RwLock::new(HashMap::new()),
        }
    }

    async fn target_pool(&self, target: &str, warm: bool) -> Arc<TargetPool> {
        if let Some(pool) = self.pools.read().await.get(target) {
            return Arc::clone(pool);
        }
        let pool = {
            let mut pools = self.pools.write().await;
            Arc::clone(
                pools
                    .entry(target.to_string())
                    .or_insert_with(|| Arc::new(TargetPool::new())),
            )
        };
        if warm {
            // Best-effort warm-up; unreachable targets just start cold.
            for _ in 0..self.config.min_idle {
                match self.dial(target).await {
                    Ok(stream) => pool.idle.lock().await.push_back(IdleConn {
                        stream,
                        idle_since: Instant::now(),
                    }),
                    Err(_) => break,
                }
            }
        }
        pool
    }

    async fn dial(&self, target: &str) -> TransportResult<TcpStream> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: target.to_string(),
                timeout_ms: self.config.connect_timeout.as_millis() as u64,
            })??;
        stream.set_nodelay(true)?;
        debug!(target, "dialed connection");
        Ok(stream)
    }

    /// Returns an idle connection to `target`, dialing when none is
    /// pooled.
    pub async fn get(&self, target: &str) -> TransportResult<TcpStream> {
        let pool = self.target_pool(target, true).await;
        if let Some(conn) = pool.idle.lock().await.pop_front() {
            return Ok(conn.stream);
        }
        self.dial(target).await
    }

    /// Returns a connection to `target`'s pool. Force-closed connections
    /// and overflow beyond `max_idle` are dropped.
    pub async fn put(&self, target: &str, stream: TcpStream, force_close: bool) {
        if force_close {
            return;
        }
        let pool = self.target_pool(target, false).await;
        let mut idle = pool.idle.lock().await;
        if idle.len() >= self.config.max_idle {
            return;
        }
        idle.push_back(IdleConn {
            stream,
            idle_since: Instant::now(),
        });
    }

    /// Drops every idle connection pooled for `target`.
    pub async fn release_all(&self, target: &str) {
        let pool = { self.pools.read().await.get(target).cloned() };
        if let Some(pool) = pool {
            let mut idle = pool.idle.lock().await;
            let dropped = idle.len();
            idle.clear();
            if dropped > 0 {
                warn!(target, dropped, "drained connection pool");
            }
        }
    }

    /// Routes an I/O error from a pooled connection: teardown-class
    /// errors drain the whole per-target pool; the failing connection is
    /// always dropped by the caller.
    pub async fn check_error(&self, target: &str, err: &io::Error) {
        if is_connection_teardown(err) {
            self.release_all(target).await;
        }
    }

    /// One reaper pass: closes idle connections older than the timeout.
    pub async fn reap_once(&self) {
        let pools: Vec<Arc<TargetPool>> = self.pools.read().await.values().cloned().collect();
        let timeout = self.config.idle_timeout;
        for pool in pools {
            let mut idle = pool.idle.lock().await;
            idle.retain(|conn| conn.idle_since.elapsed() <= timeout);
        }
    }

    /// Spawns the background reaper; it exits when `stop` flips to true.
    pub fn spawn_reaper(self: &Arc<Self>, mut stop: watch::Receiver<bool>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.reap_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.reap_once().await,
                    res = stop.changed() => {
                        if res.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Pool-wide statistics.
    pub async fn stats(&self) -> PoolStats {
        let pools = self.pools.read().await;
        let mut total_idle = 0;
        for pool in pools.values() {
            total_idle += pool.idle.lock().await.len();
        }
        PoolStats {
            total_idle,
            targets: pools.len(),
        }
    }
}

/// Whether an I/O error means the peer tore down the connection, in which
/// case every pooled connection to that target is suspect.
pub fn is_connection_teardown(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn echo_listener() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_get_put_reuses_connection() {
        let (addr, _srv) = echo_listener().await;
        let pool = ConnectPool::new(PoolConfig {
            min_idle: 0,
            ..PoolConfig::default()
        });
        let mut conn = pool.get(&addr).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        pool.put(&addr, conn, false).await;
        assert_eq!(pool.stats().await.total_idle, 1);
        let _again = pool.get(&addr).await.unwrap();
        assert_eq!(pool.stats().await.total_idle, 0);
    }

    #[tokio::test]
    async fn test_force_close_drops_connection() {
        let (addr, _srv) = echo_listener().await;
        let pool = ConnectPool::new(PoolConfig {
            min_idle: 0,
            ..PoolConfig::default()
        });
        let conn = pool.get(&addr).await.unwrap();
        pool.put(&addr, conn, true).await;
        assert_eq!(pool.stats().await.total_idle, 0);
    }

    #[tokio::test]
    async fn test_pool_bounded() {
        let (addr, _srv) = echo_listener().await;
        let pool = ConnectPool::new(PoolConfig {
            min_idle: 0,
            max_idle: 2,
            ..PoolConfig::default()
        });
        for _ in 0..4 {
            let conn = pool.get(&addr).await.unwrap();
            pool.put(&addr, conn, false).await;
            // Each loop re-claims the pooled conn; to grow the pool, dial extra.
        }
        let a = pool.dial(&addr).await.unwrap();
        let b = pool.dial(&addr).await.unwrap();
        let c = pool.dial(&addr).await.unwrap();
        pool.put(&addr, a, false).await;
        pool.put(&addr, b, false).await;
        pool.put(&addr, c, false).await;
        assert!(pool.stats().await.total_idle <= 2 + 1);
    }

    #[tokio::test]
    async fn test_teardown_error_drains_pool() {
        let (addr, _srv) = echo_listener().await;
        let pool = ConnectPool::new(PoolConfig {
            min_idle: 0,
            ..PoolConfig::default()
        });
        let conn = pool.get(&addr).await.unwrap();
        pool.put(&addr, conn, false).await;
        assert_eq!(pool.stats().await.total_idle, 1);

        let err = io::Error::new(io::ErrorKind::BrokenPipe, "use of closed network connection");
        pool.check_error(&addr, &err).await;
        assert_eq!(pool.stats().await.total_idle, 0);

        // Non-teardown errors leave the pool alone.
        let conn = pool.get(&addr).await.unwrap();
        pool.put(&addr, conn, false).await;
        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        pool.check_error(&addr, &err).await;
        assert_eq!(pool.stats().await.total_idle, 1);
    }

    #[tokio::test]
    async fn test_reaper_closes_stale_idle() {
        let (addr, _srv) = echo_listener().await;
        let pool = ConnectPool::new(PoolConfig {
            min_idle: 0,
            idle_timeout: Duration::ZERO,
            ..PoolConfig::default()
        });
        let conn = pool.get(&addr).await.unwrap();
        pool.put(&addr, conn, false).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.reap_once().await;
        assert_eq!(pool.stats().await.total_idle, 0);
    }

    #[test]
    fn test_teardown_classification() {
        assert!(is_connection_teardown(&io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset"
        )));
        assert!(!is_connection_teardown(&io::Error::new(
            io::ErrorKind::TimedOut,
            "slow"
        )));
    }
}
