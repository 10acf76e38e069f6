//! Membership reconciliation primitives.
//!
//! Every node periodically compares the registry's live-node set with the
//! set it already knows about. This library holds the pure parts of that
//! loop so they can be tested without sockets or a registry:
//!
//! - **Membership diff**: which peers died and which are new.
//! - **Dial tie-break**: for a new peer, which side opens the connection.
//! - **Retry helpers**: exponential backoff and bounded per-peer retries.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - For any pair of distinct ids exactly one side dials
//! - The local id never appears in `dead` or `dial`

use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};

use rand::Rng;

// =============================================================================
// Dial Tie-break
// =============================================================================

/// What the local node should do about a newly observed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialRole {
    /// Local id is larger: open the connection.
    Initiate,

    /// Local id is smaller: wait for the peer's inbound handshake.
    Await,

    /// Peer reports the local id. Either it is us or an id collision; the
    /// two are indistinguishable here.
    SameId,
}

/// Decides who dials: the numerically larger id initiates.
pub fn dial_role<Id: Ord>(local: &Id, remote: &Id) -> DialRole {
    match local.cmp(remote) {
        std::cmp::Ordering::Greater => DialRole::Initiate,
        std::cmp::Ordering::Less => DialRole::Await,
        std::cmp::Ordering::Equal => DialRole::SameId,
    }
}

// =============================================================================
// Membership Diff
// =============================================================================

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipPlan<Id> {
    /// False when the local id is missing from the live set.
    pub self_present: bool,

    /// Known peers that are no longer live.
    pub dead: Vec<Id>,

    /// New peers the local node must dial.
    pub dial: Vec<Id>,

    /// New peers expected to dial the local node.
    pub await_inbound: Vec<Id>,
}

impl<Id> MembershipPlan<Id> {
    /// Returns true if nothing changed.
    pub fn is_noop(&self) -> bool {
        self.self_present
            && self.dead.is_empty()
            && self.dial.is_empty()
            && self.await_inbound.is_empty()
    }
}

/// Diffs the previously known set against the current live set.
///
/// `dead = previous - current`, `new = current - previous`, both excluding
/// `local`. Output vectors are sorted so passes are reproducible.
pub fn plan_membership<Id>(local: Id, previous: &HashSet<Id>, current: &HashSet<Id>) -> MembershipPlan<Id>
where
    Id: Ord + Hash + Copy,
{
    let mut dead: Vec<Id> = previous
        .difference(current)
        .copied()
        .filter(|id| *id != local)
        .collect();
    dead.sort_unstable();

    let mut dial = Vec::new();
    let mut await_inbound = Vec::new();
    for id in current.difference(previous) {
        match dial_role(&local, id) {
            DialRole::Initiate => dial.push(*id),
            DialRole::Await => await_inbound.push(*id),
            DialRole::SameId => {}
        }
    }
    dial.sort_unstable();
    await_inbound.sort_unstable();

    MembershipPlan {
        self_present: current.contains(&local),
        dead,
        dial,
        await_inbound,
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Backoff without jitter: exactly `base * 2^attempt`, capped at `max`.
    pub fn exact(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        if self.jitter <= 0.0 {
            return Duration::from_millis(delay as u64);
        }

        let jitter_range = delay * self.jitter.min(1.0);
        let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Retry Tracker
// =============================================================================

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker<K: Ord> {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: &K) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count >= self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, key: &K) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count >= self.max_retries
    }

    /// Clear failure tracking for a resource (on success or departure).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }

    /// Number of tracked resources.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default dial attempts per peer before giving up until it re-registers.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
