//! Fixed-size receive buffer pool.
//!
//! Frame readers lease one buffer each while they have unread socket data.
//! The pool allocates lazily up to `max_buffers`; past that, `acquire()`
//! parks the caller in a FIFO queue and the next released buffer is handed
//! straight to the oldest waiter.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::trace;

/// Default size of a single receive buffer (16 KB)
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default cap on the number of buffers the pool will allocate
pub const DEFAULT_MAX_BUFFERS: usize = 1024;

struct PoolState {
    free: Vec<Box<[u8]>>,
    allocated: usize,
    waiters: VecDeque<oneshot::Sender<Box<[u8]>>>,
}

struct PoolInner {
    buffer_size: usize,
    max_buffers: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, mut buf: Box<[u8]>) {
        let mut state = self.state();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(buf) {
                Ok(()) => return,
                // The waiter gave up; try the next one.
                Err(returned) => buf = returned,
            }
        }
        state.free.push(buf);
    }
}

/// A parked `acquire()`. If the acquiring task is cancelled after a buffer
/// was already handed over, the buffer goes back to the pool.
struct Waiter<'a> {
    rx: oneshot::Receiver<Box<[u8]>>,
    pool: &'a PoolInner,
    done: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.rx.close();
            if let Ok(buf) = self.rx.try_recv() {
                self.pool.release(buf);
            }
        }
    }
}

/// A shared pool of fixed-size byte buffers.
///
/// Cloning is cheap; all clones refer to the same pool. The pool is passed
/// explicitly to every connection that reads from it and lives as long as
/// its last clone or outstanding lease.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("max_buffers", &self.inner.max_buffers)
            .field("allocated", &state.allocated)
            .field("available", &state.free.len())
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_BUFFERS)
    }
}

impl BufferPool {
    /// Creates a new buffer pool.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` or `max_buffers` is 0.
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be positive");
        assert!(max_buffers > 0, "max_buffers must be positive");
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_buffers,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    allocated: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Leases a buffer, waiting for one to be released if the pool is
    /// exhausted. Waiters are served in arrival order.
    pub async fn acquire(&self) -> BufferLease {
        let rx = {
            let mut state = self.inner.state();
            if let Some(buf) = state.free.pop() {
                return self.lease(buf);
            }
            if state.allocated < self.inner.max_buffers {
                state.allocated += 1;
                return self.lease(vec![0u8; self.inner.buffer_size].into_boxed_slice());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            trace!(waiting = state.waiters.len(), "Buffer pool exhausted, queueing");
            rx
        };

        let mut wait = Waiter {
            rx,
            pool: &self.inner,
            done: false,
        };
        let received = (&mut wait.rx).await;
        wait.done = true;

        match received {
            Ok(buf) => self.lease(buf),
            // Only reachable if the sender was dropped without a send, which
            // release() never does. Allocate rather than hang.
            Err(_) => {
                self.inner.state().allocated += 1;
                self.lease(vec![0u8; self.inner.buffer_size].into_boxed_slice())
            }
        }
    }

    fn lease(&self, buf: Box<[u8]>) -> BufferLease {
        BufferLease {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Size in bytes of every buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of idle buffers ready to be leased without allocating.
    pub fn available(&self) -> usize {
        self.inner.state().free.len()
    }

    /// Number of buffers allocated so far (leased or idle).
    pub fn allocated(&self) -> usize {
        self.inner.state().allocated
    }

    /// Number of callers parked waiting for a buffer.
    pub fn waiting(&self) -> usize {
        self.inner.state().waiters.len()
    }
}

/// Exclusive lease on one pooled buffer.
///
/// Dropping the lease takes the buffer out of the holder before returning
/// it, so a buffer is never reachable through two leases.
pub struct BufferLease {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
