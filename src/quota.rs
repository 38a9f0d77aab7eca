//! Per-caller request quotas over a fixed time window.
//!
//! The [`QuotaLedger`] maps each `(tier, identifier)` pair to a
//! [`UsageRecord`] holding a request count and the instant its window
//! opened. Admission is a fixed-window counter: O(1) time and memory per
//! caller, at the cost of allowing up to twice the limit in a burst that
//! straddles a window boundary.
//!
//! Records live in a [`DashMap`], whose entry guard locks only the shard
//! holding the key. The read-check-increment sequence of
//! [`QuotaLedger::check_and_consume`] therefore runs atomically per key
//! without serializing unrelated callers. The guard is released before
//! the method returns, so no ledger lock is ever held across an upstream
//! call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::clock::{Clock, SystemClock};
use crate::config::{DEFAULT_ANONYMOUS_LIMIT, DEFAULT_AUTHENTICATED_LIMIT, DEFAULT_QUOTA_WINDOW};

/// A class of caller with its own request limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Callers the identity collaborator has not vouched for.
    Anonymous,
    /// Logged-in callers carrying a user id.
    Authenticated,
}

impl Tier {
    /// Returns the lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticated => "authenticated",
        }
    }
}

/// Limits for each tier and the window they apply over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    /// Requests allowed per window for [`Tier::Anonymous`].
    pub anonymous_limit: u32,
    /// Requests allowed per window for [`Tier::Authenticated`].
    pub authenticated_limit: u32,
    /// Length of a quota window.
    pub window: Duration,
}

impl QuotaPolicy {
    /// Returns the request limit for `tier`.
    pub fn limit(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Anonymous => self.anonymous_limit,
            Tier::Authenticated => self.authenticated_limit,
        }
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            anonymous_limit: DEFAULT_ANONYMOUS_LIMIT,
            authenticated_limit: DEFAULT_AUTHENTICATED_LIMIT,
            window: DEFAULT_QUOTA_WINDOW,
        }
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the caller's current window after this one.
    pub remaining: u32,
}

impl Admission {
    fn allowed(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
        }
    }

    fn denied() -> Self {
        Self {
            allowed: false,
            remaining: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct UsageRecord {
    count: u32,
    window_start: Instant,
}

impl UsageRecord {
    fn opened_at(now: Instant) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) > window
    }
}

type LedgerKey = (Tier, String);

/// Process-wide record of how much quota each caller has used.
///
/// Cheap to clone; clones share the same records. Construct one at startup
/// and hand it to the request handler.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    records: Arc<DashMap<LedgerKey, UsageRecord>>,
    policy: QuotaPolicy,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    /// Creates an empty ledger driven by the system clock.
    pub fn new(policy: QuotaPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Creates an empty ledger driven by the given clock.
    pub fn with_clock(policy: QuotaPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            policy,
            clock,
        }
    }

    /// Returns the policy this ledger enforces.
    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Admits one request for `identifier` under `tier` if its window still
    /// has room, consuming one unit of quota.
    ///
    /// A missing or expired record opens a fresh window with this request
    /// counted. An exhausted record is left untouched and the request is
    /// denied with zero remaining.
    pub fn check_and_consume(&self, identifier: &str, tier: Tier) -> Admission {
        let limit = self.policy.limit(tier);
        let now = self.clock.now();

        match self.records.entry((tier, identifier.to_owned())) {
            Entry::Vacant(vacant) => {
                vacant.insert(UsageRecord::opened_at(now));
                Admission::allowed(limit.saturating_sub(1))
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired(now, self.policy.window) {
                    *record = UsageRecord::opened_at(now);
                    return Admission::allowed(limit.saturating_sub(1));
                }
                if record.count >= limit {
                    return Admission::denied();
                }
                record.count += 1;
                Admission::allowed(limit - record.count)
            }
        }
    }

    /// Returns how many requests `identifier` could still make under `tier`
    /// without consuming anything.
    pub fn remaining(&self, identifier: &str, tier: Tier) -> u32 {
        let limit = self.policy.limit(tier);
        let now = self.clock.now();

        self.records
            .get(&(tier, identifier.to_owned()))
            .filter(|record| !record.is_expired(now, self.policy.window))
            .map_or(limit, |record| limit.saturating_sub(record.count))
    }

    /// Returns the number of `(tier, identifier)` pairs currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }

    /// Drops every record whose window has elapsed and returns how many
    /// were removed.
    ///
    /// A dropped record behaves exactly like an expired one: the caller's
    /// next request opens a fresh window.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let window = self.policy.window;
        let before = self.records.len();
        self.records
            .retain(|_, record| !record.is_expired(now, window));
        before.saturating_sub(self.records.len())
    }
}
