//! Client connection pooling.
//!
//! HTTP/1.1 connections are pooled per destination key with a concurrency
//! semaphore and a LIFO idle stack. Acquisition has a synchronous fast path:
//! a free permit plus a probed-live idle connection completes without
//! touching the async machinery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::client::connect::Transport;
use crate::common::cancel::CancelToken;
use crate::error::Result;

/// Pool and HTTP/2 cache key: one entry per distinct peer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub(crate) scheme: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tls_id: &'static str,
    pub(crate) alpn: String,
    pub(crate) proxy_id: Option<String>,
}

impl PoolKey {
    pub(crate) fn new(
        scheme: &str,
        host: &str,
        port: u16,
        tls_id: &'static str,
        alpn: &str,
        proxy_id: Option<String>,
    ) -> PoolKey {
        PoolKey {
            scheme: scheme.to_owned(),
            host: host.to_ascii_lowercase(),
            port,
            tls_id,
            alpn: alpn.to_owned(),
            proxy_id,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) max_per_host: usize,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_age: Option<Duration>,
}

/// A pooled HTTP/1.1 connection.
#[derive(Debug)]
pub(crate) struct Conn {
    pub(crate) transport: Transport,
    pub(crate) created_at: Instant,
}

impl Conn {
    pub(crate) fn new(transport: Transport) -> Conn {
        Conn {
            transport,
            created_at: Instant::now(),
        }
    }
}

struct Idle {
    conn: Conn,
    idle_at: Instant,
}

struct PerHost {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Idle>>,
}

#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    pub(crate) reused: u64,
    pub(crate) opened: u64,
    pub(crate) evicted: u64,
}

struct PoolInner {
    config: PoolConfig,
    hosts: Mutex<HashMap<PoolKey, Arc<PerHost>>>,
    // 64-bit counters guarded by one lock so snapshots are coherent on any
    // host width.
    stats: Mutex<PoolStats>,
}

#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

/// A checked-out slot. Holds the per-host permit until dropped; carries an
/// idle connection when one was available.
#[derive(Debug)]
pub(crate) struct Lease {
    key: PoolKey,
    conn: Option<Conn>,
    reused: bool,
    pool: Weak<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Pool {
    pub(crate) fn new(config: PoolConfig) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                config,
                hosts: Mutex::new(HashMap::new()),
                stats: Mutex::new(PoolStats::default()),
            }),
        }
    }

    fn per_host(&self, key: &PoolKey) -> Arc<PerHost> {
        let mut hosts = self.inner.hosts.lock().unwrap();
        hosts
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(PerHost {
                    semaphore: Arc::new(Semaphore::new(self.inner.config.max_per_host)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Synchronous fast path: a free permit plus a live idle connection.
    pub(crate) fn try_acquire(&self, key: &PoolKey) -> Option<Lease> {
        let host = self.per_host(key);
        let permit = host.semaphore.clone().try_acquire_owned().ok()?;
        match self.pop_live(&host) {
            Some(conn) => {
                self.inner.stats.lock().unwrap().reused += 1;
                trace!("pool fast path hit for {:?}", key);
                Some(Lease {
                    key: key.clone(),
                    conn: Some(conn),
                    reused: true,
                    pool: Arc::downgrade(&self.inner),
                    _permit: permit,
                })
            }
            None => {
                // No usable idle connection; hand back the permit with an
                // empty lease so the caller dials under it.
                Some(Lease {
                    key: key.clone(),
                    conn: None,
                    reused: false,
                    pool: Arc::downgrade(&self.inner),
                    _permit: permit,
                })
            }
        }
    }

    /// Waits for a permit, then checks the idle stack. Cancellation gives up
    /// the wait without consuming an idle connection.
    pub(crate) async fn acquire(&self, key: &PoolKey, cancel: &CancelToken) -> Result<Lease> {
        let host = self.per_host(key);
        let permit = match host.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tokio::select! {
                    acquired = host.semaphore.clone().acquire_owned() => {
                        acquired.expect("pool semaphore never closed")
                    }
                    _ = cancel.canceled() => return Err(cancel.error()),
                }
            }
        };
        let conn = self.pop_live(&host);
        let reused = conn.is_some();
        let mut stats = self.inner.stats.lock().unwrap();
        if reused {
            stats.reused += 1;
        } else {
            stats.opened += 1;
        }
        drop(stats);
        Ok(Lease {
            key: key.clone(),
            conn,
            reused,
            pool: Arc::downgrade(&self.inner),
            _permit: permit,
        })
    }

    /// Pops idle entries newest-first, dropping any that fail staleness or
    /// liveness checks.
    fn pop_live(&self, host: &PerHost) -> Option<Conn> {
        let now = Instant::now();
        let mut idle = host.idle.lock().unwrap();
        while let Some(entry) = idle.pop() {
            if self.is_stale(&entry, now) {
                self.inner.stats.lock().unwrap().evicted += 1;
                continue;
            }
            if !probe_live(entry.conn.transport.tcp_ref()) {
                debug!("discarding dead pooled connection");
                self.inner.stats.lock().unwrap().evicted += 1;
                continue;
            }
            return Some(entry.conn);
        }
        None
    }

    fn is_stale(&self, entry: &Idle, now: Instant) -> bool {
        if let Some(idle_timeout) = self.inner.config.idle_timeout {
            if now.duration_since(entry.idle_at) > idle_timeout {
                return true;
            }
        }
        if let Some(max_age) = self.inner.config.max_age {
            if now.duration_since(entry.conn.created_at) > max_age {
                return true;
            }
        }
        false
    }

    fn release(&self, key: &PoolKey, conn: Conn) {
        if let Some(max_age) = self.inner.config.max_age {
            if conn.created_at.elapsed() > max_age {
                self.inner.stats.lock().unwrap().evicted += 1;
                return;
            }
        }
        let host = self.per_host(key);
        let mut idle = host.idle.lock().unwrap();
        if idle.len() >= self.inner.config.max_per_host {
            self.inner.stats.lock().unwrap().evicted += 1;
            return;
        }
        trace!("returning connection to pool for {:?}", key);
        idle.push(Idle {
            conn,
            idle_at: Instant::now(),
        });
    }

    /// Drops every idle connection.
    pub(crate) fn clear(&self) {
        let hosts = self.inner.hosts.lock().unwrap();
        for host in hosts.values() {
            host.idle.lock().unwrap().clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> PoolStats {
        let stats = self.inner.stats.lock().unwrap();
        PoolStats {
            reused: stats.reused,
            opened: stats.opened,
            evicted: stats.evicted,
        }
    }
}

impl Lease {
    /// Whether the carried connection came from the idle stack.
    pub(crate) fn reused(&self) -> bool {
        self.reused
    }

    /// Takes the carried connection, if any. `None` means dial a new one.
    pub(crate) fn take(&mut self) -> Option<Conn> {
        self.conn.take()
    }

    /// Returns a healthy connection to the idle stack and releases the slot.
    ///
    /// The liveness probe on a later acquire may still race the peer closing
    /// this connection first; the HTTP/1.1 transport covers that window with
    /// its stale-connection retry.
    pub(crate) fn release(self, conn: Conn) {
        if let Some(pool) = self.pool.upgrade() {
            Pool { inner: pool }.release(&self.key, conn);
        }
        // permit drops here, freeing the slot
    }
}

/// Best-effort: a closed peer or unsolicited buffered bytes both disqualify
/// reuse. Bytes buffered inside a TLS session are invisible here, which is
/// exactly the window the stale-connection retry covers.
fn probe_live(tcp: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match tcp.try_read(&mut probe) {
        Ok(_) => false,
        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}
