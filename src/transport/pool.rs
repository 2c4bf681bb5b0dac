use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use super::{Command, ErrorKind, ExecResult, Transport, TransportError, TransportInfo};

/// Builds a fresh, unconnected transport for the pool.
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_conns: usize,
    pub max_idle: usize,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 10,
            max_idle: 5,
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetricsSnapshot {
    pub created: u64,
    pub destroyed: u64,
    pub active: usize,
    pub idle: usize,
    pub total_reused: u64,
}

struct Entry {
    id: u64,
    // None while a reserved slot is still connecting.
    transport: Option<Arc<dyn Transport>>,
    target: String,
    in_use: bool,
    created: Instant,
    last_used: Instant,
    use_count: u64,
}

impl Entry {
    fn healthy(&self) -> bool {
        match &self.transport {
            Some(t) => t.is_connected() && self.created.elapsed() < Duration::from_secs(3600),
            None => false,
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: TransportFactory,
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    created: AtomicU64,
    destroyed: AtomicU64,
    total_reused: AtomicU64,
}

impl PoolInner {
    /// Mark a connection idle again, then enforce lifetime and idle caps.
    fn release(&self, id: u64) -> Vec<Arc<dyn Transport>> {
        let mut entries = self.entries.lock().expect("pool entries poisoned");
        let mut dropped = Vec::new();

        let mut expired = None;
        if let Some((idx, entry)) = entries.iter_mut().enumerate().find(|(_, e)| e.id == id) {
            entry.in_use = false;
            entry.last_used = Instant::now();
            if entry.created.elapsed() > self.config.max_lifetime {
                expired = Some(idx);
            }
        }
        if let Some(idx) = expired {
            let entry = entries.remove(idx);
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            if let Some(t) = entry.transport {
                dropped.push(t);
            }
        }

        while entries.iter().filter(|e| !e.in_use).count() > self.config.max_idle {
            let oldest = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.in_use)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(idx, _)| idx);
            match oldest {
                Some(idx) => {
                    let entry = entries.remove(idx);
                    self.destroyed.fetch_add(1, Ordering::Relaxed);
                    if let Some(t) = entry.transport {
                        dropped.push(t);
                    }
                }
                None => break,
            }
        }
        dropped
    }

    fn evict_idle(&self) -> Vec<Arc<dyn Transport>> {
        let mut entries = self.entries.lock().expect("pool entries poisoned");
        let idle_timeout = self.config.idle_timeout;
        let mut dropped = Vec::new();
        let mut idx = 0;
        while idx < entries.len() {
            if !entries[idx].in_use && entries[idx].last_used.elapsed() > idle_timeout {
                let entry = entries.remove(idx);
                self.destroyed.fetch_add(1, Ordering::Relaxed);
                if let Some(t) = entry.transport {
                    dropped.push(t);
                }
            } else {
                idx += 1;
            }
        }
        dropped
    }
}

/// Per-target pool of live transport connections. `get` hands out a wrapper
/// whose `disconnect` returns the connection instead of closing it.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: TransportFactory) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            factory,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
        });
        Self::spawn_cleanup(Arc::downgrade(&inner));
        Self { inner }
    }

    fn spawn_cleanup(inner: Weak<PoolInner>) {
        let interval = match inner.upgrade() {
            Some(strong) => strong.config.cleanup_interval,
            None => return,
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = inner.upgrade() else { break };
                if pool.closed.load(Ordering::Relaxed) {
                    break;
                }
                let dropped = pool.evict_idle();
                for transport in dropped {
                    let _ = transport.disconnect().await;
                }
            }
        });
    }

    pub async fn get(&self, target: &str) -> Result<PooledConnection, TransportError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(TransportError::new(
                ErrorKind::NotConnected,
                "pool is closed",
            ));
        }

        let reserved_id = {
            let mut entries = self.inner.entries.lock().expect("pool entries poisoned");

            // Prune dead idle connections for this target before reuse.
            let mut idx = 0;
            while idx < entries.len() {
                let entry = &entries[idx];
                if !entry.in_use && entry.target == target && !entry.healthy() {
                    let removed = entries.remove(idx);
                    self.inner.destroyed.fetch_add(1, Ordering::Relaxed);
                    drop(removed);
                } else {
                    idx += 1;
                }
            }

            if let Some(entry) = entries
                .iter_mut()
                .find(|e| !e.in_use && e.target == target && e.healthy())
            {
                entry.in_use = true;
                entry.last_used = Instant::now();
                entry.use_count += 1;
                self.inner.total_reused.fetch_add(1, Ordering::Relaxed);
                let transport = entry.transport.clone().expect("healthy entry has transport");
                return Ok(PooledConnection::new(
                    Arc::clone(&self.inner),
                    entry.id,
                    transport,
                    target.to_string(),
                ));
            }

            if entries.len() >= self.inner.config.max_conns {
                return Err(TransportError::new(
                    ErrorKind::PoolExhausted,
                    format!(
                        "pool limit of {} connections reached",
                        self.inner.config.max_conns
                    ),
                ));
            }

            // Reserve the slot before connecting so the bound stays strict
            // while the handshake runs outside the lock.
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            entries.push(Entry {
                id,
                transport: None,
                target: target.to_string(),
                in_use: true,
                created: now,
                last_used: now,
                use_count: 1,
            });
            id
        };

        let transport = (self.inner.factory)();
        match transport.connect(target).await {
            Ok(()) => {
                let mut entries = self.inner.entries.lock().expect("pool entries poisoned");
                if let Some(entry) = entries.iter_mut().find(|e| e.id == reserved_id) {
                    entry.transport = Some(Arc::clone(&transport));
                }
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection::new(
                    Arc::clone(&self.inner),
                    reserved_id,
                    transport,
                    target.to_string(),
                ))
            }
            Err(err) => {
                let mut entries = self.inner.entries.lock().expect("pool entries poisoned");
                entries.retain(|e| e.id != reserved_id);
                Err(err)
            }
        }
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        let entries = self.inner.entries.lock().expect("pool entries poisoned");
        PoolMetricsSnapshot {
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            active: entries.iter().filter(|e| e.in_use).count(),
            idle: entries.iter().filter(|e| !e.in_use).count(),
            total_reused: self.inner.total_reused.load(Ordering::Relaxed),
        }
    }

    /// Destroy every tracked connection and refuse further `get`s.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        let drained: Vec<Entry> = {
            let mut entries = self.inner.entries.lock().expect("pool entries poisoned");
            entries.drain(..).collect()
        };
        for entry in drained {
            self.inner.destroyed.fetch_add(1, Ordering::Relaxed);
            if let Some(transport) = entry.transport {
                let _ = transport.disconnect().await;
            }
        }
    }
}

/// A leased connection. All operations delegate to the underlying
/// transport; `disconnect` returns the connection to the pool.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    id: u64,
    transport: Arc<dyn Transport>,
    target: String,
    released: AtomicBool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("released", &self.released)
            .finish()
    }
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, id: u64, transport: Arc<dyn Transport>, target: String) -> Self {
        Self {
            pool,
            id,
            transport,
            target,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = self.pool.release(self.id);
        for transport in dropped {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = transport.disconnect().await;
                    });
                }
                Err(_) => drop(transport),
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Transport for PooledConnection {
    async fn connect(&self, target: &str) -> Result<(), TransportError> {
        if target == self.target {
            return Ok(());
        }
        Err(TransportError::new(
            ErrorKind::InvalidTarget,
            "pooled connection is bound to its original target",
        ))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn execute(&self, command: &Command) -> Result<ExecResult, TransportError> {
        self.transport.execute(command).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.transport.upload(local, remote).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.transport.download(remote, local).await
    }

    fn info(&self) -> TransportInfo {
        self.transport.info()
    }
}
