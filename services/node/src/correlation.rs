//! Request/response correlation.
//!
//! A [`CorrelationTable`] matches asynchronous replies to the calls that
//! are waiting for them.
//!
//! ```text
//!   next_key() ──> register(key) ──> send request ──> wait(pending, timeout, cancel)
//!                                                        │
//!   try_reply(key, value) ───────────────────────────────┤ first one wins,
//!   try_fail(key, reason) ───────────────────────────────┤ the entry is removed
//!   timeout / cancellation / shutdown ───────────────────┘
//! ```
//!
//! A key is only unique while its entry is pending; [`CorrelationTable::next_key`]
//! skips keys that are still outstanding after the counter wraps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use shoal_id::{KeySequence, RequestKey};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors delivered to a waiting caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No reply arrived in time.
    #[error("request {key} timed out after {elapsed:?}")]
    Timeout { key: RequestKey, elapsed: Duration },

    /// The request failed before a reply arrived (for example the send failed).
    #[error("request {key} failed: {reason}")]
    Failed { key: RequestKey, reason: String },

    /// The wait was cancelled or the table shut down.
    #[error("request {key} cancelled")]
    Cancelled { key: RequestKey },

    /// The key is already pending.
    #[error("request key {key} is already pending")]
    DuplicateKey { key: RequestKey },
}

impl RequestError {
    /// The correlation key the error belongs to.
    pub fn key(&self) -> RequestKey {
        match self {
            RequestError::Timeout { key, .. }
            | RequestError::Failed { key, .. }
            | RequestError::Cancelled { key }
            | RequestError::DuplicateKey { key } => *key,
        }
    }
}

/// Point-in-time counters of a [`CorrelationTable`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationStats {
    pub total: u64,
    pub succeeded: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pending: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

struct Pending<T> {
    tx: oneshot::Sender<Result<T, RequestError>>,
    started_at: Instant,
}

/// A registered entry awaiting resolution.
///
/// Pass it to [`CorrelationTable::wait`].
#[derive(Debug)]
pub struct PendingReply<T> {
    key: RequestKey,
    rx: oneshot::Receiver<Result<T, RequestError>>,
}

impl<T> PendingReply<T> {
    /// Key of the pending entry.
    pub fn key(&self) -> RequestKey {
        self.key
    }
}

/// Generic matcher of replies to pending requests.
pub struct CorrelationTable<T> {
    keys: KeySequence,
    pending: DashMap<RequestKey, Pending<T>>,
    counters: Counters,
    closed: AtomicBool,
}

impl<T: Send + 'static> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CorrelationTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            keys: KeySequence::new(),
            pending: DashMap::new(),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Next free correlation key. Never zero, never a pending key.
    pub fn next_key(&self) -> RequestKey {
        loop {
            let key = self.keys.next_key();
            if !self.pending.contains_key(&key) {
                return key;
            }
        }
    }

    /// Registers a pending entry for `key`.
    ///
    /// Register before sending, so a fast reply cannot arrive unmatched.
    pub fn register(&self, key: RequestKey) -> Result<PendingReply<T>, RequestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RequestError::Cancelled { key });
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(key) {
            Entry::Occupied(_) => Err(RequestError::DuplicateKey { key }),
            Entry::Vacant(slot) => {
                slot.insert(Pending {
                    tx,
                    started_at: Instant::now(),
                });
                self.counters.total.fetch_add(1, Ordering::Relaxed);
                Ok(PendingReply { key, rx })
            }
        }
    }

    /// Waits for `pending` to resolve, time out or be cancelled.
    ///
    /// On timeout or cancellation the entry is removed before returning.
    pub async fn wait(
        &self,
        mut pending: PendingReply<T>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, RequestError> {
        let key = pending.key;
        let started = Instant::now();

        tokio::select! {
            resolved = &mut pending.rx => {
                resolved.unwrap_or(Err(RequestError::Cancelled { key }))
            }
            _ = tokio::time::sleep(timeout) => {
                if self.pending.remove(&key).is_some() {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    let elapsed = started.elapsed();
                    warn!(request_key = %key, elapsed_ms = elapsed.as_millis() as u64, "Request timed out");
                    Err(RequestError::Timeout { key, elapsed })
                } else {
                    // Resolved concurrently with the deadline; the value is in flight.
                    pending.rx.await.unwrap_or(Err(RequestError::Cancelled { key }))
                }
            }
            _ = cancel.cancelled() => {
                if self.pending.remove(&key).is_some() {
                    self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    debug!(request_key = %key, "Request cancelled by caller");
                    Err(RequestError::Cancelled { key })
                } else {
                    pending.rx.await.unwrap_or(Err(RequestError::Cancelled { key }))
                }
            }
        }
    }

    /// Registers `key` and waits for it.
    pub async fn await_reply(
        &self,
        key: RequestKey,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, RequestError> {
        let pending = self.register(key)?;
        self.wait(pending, timeout, cancel).await
    }

    /// Resolves `key` with a value.
    ///
    /// Returns false if no entry is pending (already resolved, timed out or
    /// never registered); that case is logged and otherwise ignored.
    pub fn try_reply(&self, key: RequestKey, value: T) -> bool {
        match self.pending.remove(&key) {
            Some((_, entry)) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    request_key = %key,
                    elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
                    "Request resolved"
                );
                let _ = entry.tx.send(Ok(value));
                true
            }
            None => {
                debug!(request_key = %key, "Reply for unknown or expired request");
                false
            }
        }
    }

    /// Fails `key` with a reason.
    ///
    /// Returns false if no entry is pending.
    pub fn try_fail(&self, key: RequestKey, reason: impl Into<String>) -> bool {
        match self.pending.remove(&key) {
            Some((_, entry)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let reason = reason.into();
                warn!(request_key = %key, reason = %reason, "Request failed");
                let _ = entry.tx.send(Err(RequestError::Failed { key, reason }));
                true
            }
            None => {
                debug!(request_key = %key, "Failure for unknown or expired request");
                false
            }
        }
    }

    /// Returns true if `key` is pending.
    pub fn is_pending(&self, key: RequestKey) -> bool {
        self.pending.contains_key(&key)
    }

    /// Fails every pending entry with a cancellation error and rejects new
    /// registrations. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let keys: Vec<RequestKey> = self.pending.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0u64;
        for key in keys {
            if let Some((_, entry)) = self.pending.remove(&key) {
                let _ = entry.tx.send(Err(RequestError::Cancelled { key }));
                cancelled += 1;
            }
        }
        self.counters.cancelled.fetch_add(cancelled, Ordering::Relaxed);

        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending requests on shutdown");
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            total: self.counters.total.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            pending: self.pending.len() as u64,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
