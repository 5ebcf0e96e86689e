//! Per-client admission budget using a fixed-window counter.
//!
//! Each identity gets `limit` admissions per window. The counter resets when
//! the window has elapsed; windows are not smoothed, so a burst straddling a
//! boundary can see up to `2 * limit` admissions across two adjacent windows.
//!
//! State is process-local. Several gateway processes each enforce their own
//! budget; there is no global coordination.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::schema::RateLimitConfig;
use crate::observability::metrics;
use crate::security::identity::ClientIdentity;

/// Reason attached to a rejected admission.
pub const RATE_LIMIT_EXCEEDED: &str = "rate limit exceeded";

/// Window counter for one client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
    pub window_start: Instant,
    pub count: u32,
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitState {
    pub fn new(now: Instant, limit: u32, window: Duration) -> Self {
        Self {
            window_start: now,
            count: 0,
            limit,
            window,
        }
    }

    /// True once `now - window_start >= window`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }

    fn reset_in(&self, now: Instant) -> Duration {
        self.window
            .saturating_sub(now.saturating_duration_since(self.window_start))
    }
}

/// Outcome of one admission check. Always produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_in_ms: u64,
    pub reason: Option<String>,
}

impl RateLimitResult {
    /// Whole seconds until the window resets, never zero for a rejection.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_in_ms.div_ceil(1000);
        if self.allowed {
            secs
        } else {
            secs.max(1)
        }
    }
}

/// Storage for per-identity window state.
///
/// Implementations must run `apply` with exclusive access to the state of
/// `identity`, so that concurrent checks for one identity serialize their
/// read-check-increment. Checks for different identities should not block
/// each other.
pub trait RateLimitStore: Send + Sync {
    /// Run `apply` against the state for `identity`, inserting `fresh` first if absent.
    fn update(
        &self,
        identity: &ClientIdentity,
        now: Instant,
        fresh: RateLimitState,
        apply: &mut dyn FnMut(&mut RateLimitState) -> RateLimitResult,
    ) -> RateLimitResult;

    /// Drop every entry whose window has elapsed. Returns how many were removed.
    fn evict_expired(&self, now: Instant) -> usize;

    /// Number of identities currently tracked.
    fn len(&self) -> usize;

    /// Copy of every tracked entry, in no particular order.
    fn snapshot(&self) -> Vec<(ClientIdentity, RateLimitState)>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store on a sharded concurrent map.
///
/// `max_entries` is a soft cap: inserting a new identity at capacity first
/// evicts expired windows, then the identity whose window started earliest.
/// Concurrent first-time inserts may overshoot the cap briefly.
#[derive(Debug)]
pub struct InMemoryRateLimitStore {
    entries: DashMap<ClientIdentity, RateLimitState>,
    max_entries: usize,
}

impl InMemoryRateLimitStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    fn make_room(&self, now: Instant) {
        if self.evict_expired(now) > 0 && self.entries.len() < self.max_entries {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().window_start)
            .map(|entry| entry.key().clone());

        if let Some(identity) = oldest {
            self.entries.remove(&identity);
            tracing::debug!(
                client = %identity,
                max_entries = self.max_entries,
                "Rate limit store full, evicted oldest window"
            );
        }
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn update(
        &self,
        identity: &ClientIdentity,
        now: Instant,
        fresh: RateLimitState,
        apply: &mut dyn FnMut(&mut RateLimitState) -> RateLimitResult,
    ) -> RateLimitResult {
        if let Some(mut state) = self.entries.get_mut(identity) {
            return apply(&mut *state);
        }

        if self.entries.len() >= self.max_entries {
            self.make_room(now);
        }

        let mut state = self.entries.entry(identity.clone()).or_insert(fresh);
        apply(&mut *state)
    }

    fn evict_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, state| {
            let keep = !state.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn snapshot(&self) -> Vec<(ClientIdentity, RateLimitState)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Fixed-window admission control keyed by [`ClientIdentity`].
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    limit: u32,
    window: Duration,
    enabled: bool,
}

impl RateLimiter {
    /// Build a limiter with an in-memory store and the system clock.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            Arc::new(InMemoryRateLimitStore::new(config.max_tracked_clients)),
            Arc::new(SystemClock),
            config.limit,
            config.window(),
        )
        .enabled(config.enabled)
    }

    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        limit: u32,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limit,
            window,
            enabled: true,
        }
    }

    /// Turn admission checks on or off. A disabled limiter admits everything
    /// and never touches the store.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Admit or reject one request for `identity`, charging the budget on admission.
    pub fn check(&self, identity: &ClientIdentity) -> RateLimitResult {
        if !self.enabled {
            return RateLimitResult {
                allowed: true,
                remaining: self.limit,
                reset_in_ms: 0,
                reason: None,
            };
        }

        let now = self.clock.now();
        let fresh = RateLimitState::new(now, self.limit, self.window);
        self.store
            .update(identity, now, fresh, &mut |state: &mut RateLimitState| admit(state, now))
    }

    /// Evict expired windows. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.store.evict_expired(self.clock.now())
    }

    pub fn tracked_clients(&self) -> usize {
        self.store.len()
    }

    /// Current usage of every tracked client with a live window, busiest first.
    pub fn usage(&self) -> Vec<ClientUsage> {
        let now = self.clock.now();
        let mut usage: Vec<_> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|(_, state)| !state.is_expired(now))
            .map(|(identity, state)| ClientUsage {
                identity: identity.to_string(),
                count: state.count,
                remaining: state.limit.saturating_sub(state.count),
                reset_in_ms: ceil_millis(state.reset_in(now)),
            })
            .collect();
        usage.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.identity.cmp(&b.identity)));
        usage
    }
}

/// Per-client view exposed by the admin API.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ClientUsage {
    pub identity: String,
    pub count: u32,
    pub remaining: u32,
    pub reset_in_ms: u64,
}

fn admit(state: &mut RateLimitState, now: Instant) -> RateLimitResult {
    if state.is_expired(now) {
        state.count = 0;
        state.window_start = now;
    }

    let reset_in_ms = ceil_millis(state.reset_in(now));
    if state.count < state.limit {
        state.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: state.limit - state.count,
            reset_in_ms,
            reason: None,
        }
    } else {
        RateLimitResult {
            allowed: false,
            remaining: 0,
            reset_in_ms,
            reason: Some(RATE_LIMIT_EXCEEDED.to_string()),
        }
    }
}

fn ceil_millis(d: Duration) -> u64 {
    let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    if d > Duration::from_millis(ms) {
        ms.saturating_add(1)
    } else {
        ms
    }
}

/// Periodically evict expired windows until shutdown.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = limiter.sweep();
                    let tracked = limiter.tracked_clients();
                    metrics::record_tracked_clients(tracked);
                    if evicted > 0 {
                        tracing::debug!(evicted, tracked, "Swept expired rate limit windows");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Rate limit sweeper stopping");
                    break;
                }
            }
        }
    })
}
