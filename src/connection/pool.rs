use crate::core::{RepoError, Result};
use crate::source::{CnxSet, Source};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Connections set pool
///
/// A fixed number of storage handles opened once at startup. Connections
/// borrow one for the duration of a transaction and must give it back;
/// handles are moved in and out, never shared.
pub struct ConnectionSetPool {
    /// Idle handles
    available: Mutex<VecDeque<Box<dyn CnxSet>>>,
    /// Signalled whenever a handle is released
    released: Condvar,
    size: usize,
    outstanding: AtomicUsize,
    closed: AtomicBool,
    /// Default wait used by `acquire`
    timeout: Duration,
}

impl ConnectionSetPool {
    /// Open `size` handles on `source`.
    pub fn new(source: &dyn Source, size: usize, timeout: Duration) -> Result<Self> {
        if size == 0 {
            return Err(RepoError::Programming(
                "connections set pool size must be > 0".into(),
            ));
        }

        let mut available = VecDeque::with_capacity(size);
        for _ in 0..size {
            available.push_back(source.open_cnxset()?);
        }
        debug!(size, uri = source.uri(), "connections set pool ready");

        Ok(Self {
            available: Mutex::new(available),
            released: Condvar::new(),
            size,
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            timeout,
        })
    }

    /// Take a free handle, waiting up to the configured timeout.
    pub fn acquire(&self) -> Result<Box<dyn CnxSet>> {
        self.acquire_timeout(self.timeout)
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Box<dyn CnxSet>> {
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock()?;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RepoError::Programming(
                    "connections set pool is closed".into(),
                ));
            }

            if let Some(cnxset) = available.pop_front() {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                return Ok(cnxset);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(size = self.size, ?timeout, "connections set pool exhausted");
                return Err(RepoError::PoolExhausted {
                    size: self.size,
                    timeout,
                });
            }

            let (guard, _) = self.released.wait_timeout(available, deadline - now)?;
            available = guard;
        }
    }

    /// Give a handle back. Never fails: a poisoned lock is still usable
    /// since the queue itself cannot be left half-modified.
    pub fn release(&self, mut cnxset: Box<dyn CnxSet>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            cnxset.close();
            return;
        }
        self.available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(cnxset);
        self.released.notify_one();
    }

    /// Close every idle handle. Handles still out are closed when released.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for mut cnxset in available.drain(..) {
            cnxset.close();
        }
        self.released.notify_all();
        debug!("connections set pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> PoolStats {
        let available = self
            .available
            .lock()
            .map(|queue| queue.len())
            .unwrap_or(0);
        PoolStats {
            size: self.size,
            available,
            outstanding: self.outstanding.load(Ordering::SeqCst),
        }
    }
}

/// Connections set pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub outstanding: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} in use, {} available",
            self.outstanding, self.size, self.available
        )
    }
}
