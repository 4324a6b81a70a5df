//! Connection Pool
//!
//! Keeps idle connections per [`ConnectionKey`] and hands them back out.
//!
//! ## Idle lists
//!
//! Each key has its own idle list, ordered oldest-first by the time the
//! connection was returned:
//!
//! ```text
//!   front (oldest)                                   back (newest)
//!   ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐
//!   │ conn 7 │ │ conn 3 │ │ conn 9 │ │ conn 4 │ ◄── release() pushes here
//!   └────────┘ └────────┘ └────────┘ └────────┘ ──► acquire() pops here
//!       ▲
//!       └── sweeper evicts from here, stops at the first fresh entry
//! ```
//!
//! ## Destruction
//!
//! A connection that is not reusable, that arrives after `dispose()`, or
//! that does not fit in its idle list is destroyed: a `QUIT` is attempted
//! with a bounded wait, then the socket is closed. Failures along the way
//! are logged and never reach the caller of `release`.

use crate::buffer::BufferPool;
use crate::connection::{Connection, ConnectionConfig, ConnectionKey, ConnectionState};
use crate::error::{Error, Result};
use crate::pool::sweeper::IdleSweeper;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default number of idle connections kept per key
pub const DEFAULT_MAX_IDLE_PER_KEY: usize = 16;

/// Default idle time after which a connection is evicted (60 seconds)
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between eviction sweeps (1 second)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on the graceful `QUIT` during destruction (2 seconds)
pub const DEFAULT_DESTROY_TIMEOUT: Duration = Duration::from_secs(2);

type ReusablePredicate = dyn Fn(&Connection) -> bool + Send + Sync;
type ExpiredPredicate = dyn Fn(&Connection, Duration, Duration) -> bool + Send + Sync;

/// A connection the pool refused, with the reason.
type Refused = (Connection, &'static str);

/// Decisions the pool delegates to the embedding application.
#[derive(Clone)]
pub struct PoolPolicy {
    /// Whether a released connection may go back to the idle list.
    /// Default: [`Connection::is_reusable`].
    pub reusable: Arc<ReusablePredicate>,

    /// Whether an idle connection should be evicted, given how long it has
    /// been idle and the configured inactivity timeout.
    /// Default: idle time at or past the timeout.
    pub expired: Arc<ExpiredPredicate>,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            reusable: Arc::new(Connection::is_reusable),
            expired: Arc::new(|_: &Connection, idle_for: Duration, timeout: Duration| {
                idle_for >= timeout
            }),
        }
    }
}

impl fmt::Debug for PoolPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolPolicy").finish_non_exhaustive()
    }
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per key (default: 16)
    pub max_idle_per_key: usize,

    /// Idle time before eviction (default: 60s)
    pub inactivity_timeout: Duration,

    /// Interval between eviction sweeps (default: 1s)
    pub sweep_interval: Duration,

    /// Bound on the graceful close during destruction (default: 2s)
    pub destroy_timeout: Duration,

    /// Settings for connections the pool creates
    pub connection: ConnectionConfig,

    pub policy: PoolPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: DEFAULT_MAX_IDLE_PER_KEY,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            destroy_timeout: DEFAULT_DESTROY_TIMEOUT,
            connection: ConnectionConfig::default(),
            policy: PoolPolicy::default(),
        }
    }
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Connections opened by `acquire`
    pub created: AtomicU64,
    /// `acquire` calls served from an idle list
    pub reused: AtomicU64,
    /// Connections destroyed for any reason
    pub destroyed: AtomicU64,
    /// Connections evicted by the sweeper
    pub evicted: AtomicU64,
}

struct IdleEntry {
    connection: Connection,
    since: Instant,
}

type IdleList = Mutex<VecDeque<IdleEntry>>;

fn lock(list: &IdleList) -> MutexGuard<'_, VecDeque<IdleEntry>> {
    list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    buffers: BufferPool,
    idle: RwLock<HashMap<ConnectionKey, IdleList>>,
    disposed: AtomicBool,
    stats: PoolStats,
    sweeper: Mutex<Option<IdleSweeper>>,
}

impl PoolInner {
    /// Evicts expired idle connections across every key. Returns how many
    /// were evicted.
    pub(crate) fn evict_expired(this: &Arc<Self>) -> usize {
        let now = Instant::now();
        let timeout = this.config.inactivity_timeout;
        let mut expired = Vec::new();

        {
            let idle = this.idle.read().unwrap_or_else(|p| p.into_inner());
            for list in idle.values() {
                let mut list = lock(list);
                while let Some(front) = list.front() {
                    let idle_for = now.saturating_duration_since(front.since);
                    if !(this.config.policy.expired)(&front.connection, idle_for, timeout) {
                        break;
                    }
                    if let Some(entry) = list.pop_front() {
                        expired.push(entry.connection);
                    }
                }
            }
        }

        let count = expired.len();
        this.stats.evicted.fetch_add(count as u64, Ordering::Relaxed);
        for connection in expired {
            Self::destroy_later(this, connection);
        }
        count
    }

    pub(crate) fn total_idle(&self) -> usize {
        let idle = self.idle.read().unwrap_or_else(|p| p.into_inner());
        idle.values().map(|list| lock(list).len()).sum()
    }

    fn pop_idle(&self, key: &ConnectionKey) -> Option<Connection> {
        let idle = self.idle.read().unwrap_or_else(|p| p.into_inner());
        let list = idle.get(key)?;
        let entry = lock(list).pop_back();
        entry.map(|entry| entry.connection)
    }

    /// Pushes `connection` onto its idle list, or hands it back if the list
    /// is full or the pool has been disposed.
    fn push_idle(&self, connection: Connection) -> std::result::Result<(), Refused> {
        let key = connection.key().clone();

        let idle = self.idle.read().unwrap_or_else(|p| p.into_inner());
        if let Some(list) = idle.get(&key) {
            return self.push_into(list, connection);
        }
        drop(idle);

        let mut idle = self.idle.write().unwrap_or_else(|p| p.into_inner());
        // dispose() has already drained the map; don't leave a new list behind.
        if self.disposed.load(Ordering::SeqCst) {
            return Err((connection, "pool disposed"));
        }
        let list = idle.entry(key).or_default();
        self.push_into(list, connection)
    }

    fn push_into(&self, list: &IdleList, connection: Connection) -> std::result::Result<(), Refused> {
        let mut list = lock(list);
        // Checked under the list lock so dispose() cannot miss this entry.
        if self.disposed.load(Ordering::SeqCst) {
            return Err((connection, "pool disposed"));
        }
        if list.len() >= self.config.max_idle_per_key {
            return Err((connection, "idle list full"));
        }
        list.push_back(IdleEntry {
            connection,
            since: Instant::now(),
        });
        Ok(())
    }

    /// Destroys `connection` on a background task. Outside a runtime the
    /// connection is simply dropped, which closes the socket.
    fn destroy_later(this: &Arc<Self>, connection: Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(this);
                handle.spawn(async move { inner.destroy(connection).await });
            }
            Err(_) => {
                this.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                drop(connection);
            }
        }
    }

    async fn destroy(&self, connection: Connection) {
        let state = connection.state();
        if matches!(
            state,
            ConnectionState::Connected | ConnectionState::Ready | ConnectionState::Subscribed
        ) {
            match tokio::time::timeout(self.config.destroy_timeout, connection.quit()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(
                    endpoint = %connection.key(),
                    conn = connection.id(),
                    error = %e,
                    "Graceful close failed"
                ),
                Err(_) => warn!(
                    endpoint = %connection.key(),
                    conn = connection.id(),
                    timeout_ms = self.config.destroy_timeout.as_millis() as u64,
                    "Graceful close timed out"
                ),
            }
        }
        connection.disconnect().await;
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint = %connection.key(), conn = connection.id(), "Connection destroyed");
    }
}

/// A pool of connections keyed by [`ConnectionKey`].
///
/// Cloning is cheap; clones share the same idle lists.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.total_idle())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates a pool with its own buffer pool and starts the idle sweeper.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_buffers(config, BufferPool::default())
    }

    /// Creates a pool whose connections lease read buffers from `buffers`.
    pub fn with_buffers(config: PoolConfig, buffers: BufferPool) -> Self {
        let sweep_interval = config.sweep_interval;
        let inner = Arc::new(PoolInner {
            config,
            buffers,
            idle: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            stats: PoolStats::default(),
            sweeper: Mutex::new(None),
        });

        let sweeper = IdleSweeper::start(Arc::downgrade(&inner), sweep_interval);
        *inner.sweeper.lock().unwrap_or_else(|p| p.into_inner()) = Some(sweeper);

        Self { inner }
    }

    /// Returns an idle connection for `key`, or opens and prepares a new one.
    pub async fn acquire(&self, key: &ConnectionKey) -> Result<Connection> {
        if self.is_disposed() {
            return Err(Error::PoolDisposed);
        }

        while let Some(connection) = self.inner.pop_idle(key) {
            if connection.is_reusable() {
                self.inner.stats.reused.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %key, conn = connection.id(), "Reusing idle connection");
                return Ok(connection);
            }
            // Went bad while idle.
            PoolInner::destroy_later(&self.inner, connection);
        }

        let mut connection = Connection::new(
            key.clone(),
            self.inner.config.connection.clone(),
            self.inner.buffers.clone(),
        );
        connection.connect().await?;
        if let Err(e) = connection.prepare().await {
            connection.disconnect().await;
            return Err(e);
        }
        self.inner.stats.created.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint = %key, conn = connection.id(), "Created connection");

        if self.is_disposed() {
            PoolInner::destroy_later(&self.inner, connection);
            return Err(Error::PoolDisposed);
        }
        Ok(connection)
    }

    /// Returns a connection to the pool.
    ///
    /// Never fails: connections that cannot be pooled are destroyed in the
    /// background.
    pub fn release(&self, connection: Connection) {
        if !(self.inner.config.policy.reusable)(&connection) {
            debug!(
                endpoint = %connection.key(),
                conn = connection.id(),
                state = %connection.state(),
                "Released connection is not reusable"
            );
            PoolInner::destroy_later(&self.inner, connection);
            return;
        }

        if let Err((connection, reason)) = self.inner.push_idle(connection) {
            debug!(
                endpoint = %connection.key(),
                conn = connection.id(),
                reason,
                "Not pooling released connection"
            );
            PoolInner::destroy_later(&self.inner, connection);
        }
    }

    /// Evicts expired idle connections now, without waiting for the
    /// sweeper. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        PoolInner::evict_expired(&self.inner)
    }

    /// Shuts the pool down: stops the sweeper, destroys every idle
    /// connection and makes later `acquire` calls fail with
    /// [`Error::PoolDisposed`]. Waits for the destruction to finish.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sweeper) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            sweeper.stop();
        }

        let lists = {
            let mut idle = self.inner.idle.write().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *idle)
        };

        let mut tasks = tokio::task::JoinSet::new();
        for (_, list) in lists {
            let list = list.into_inner().unwrap_or_else(|p| p.into_inner());
            for entry in list {
                let inner = Arc::clone(&self.inner);
                tasks.spawn(async move { inner.destroy(entry.connection).await });
            }
        }
        let count = tasks.len();
        while tasks.join_next().await.is_some() {}

        info!(destroyed = count, "Connection pool disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Idle connections currently held for `key`.
    pub fn idle_count(&self, key: &ConnectionKey) -> usize {
        let idle = self.inner.idle.read().unwrap_or_else(|p| p.into_inner());
        idle.get(key).map(|list| lock(list).len()).unwrap_or(0)
    }

    /// Idle connections across all keys.
    pub fn total_idle(&self) -> usize {
        self.inner.total_idle()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}
