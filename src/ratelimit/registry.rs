//! Per-client bucket registry.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::bucket::TokenBucket;
use super::policy::RateLimitPolicy;

/// A registered client: its bucket and when it was last seen.
#[derive(Debug)]
pub struct RegistryEntry {
    client_key: String,
    bucket: Mutex<TokenBucket>,
    /// Nanoseconds since the registry epoch. Atomic so lookups under the
    /// shared lock can refresh it.
    last_seen: AtomicU64,
}

impl RegistryEntry {
    fn new(client_key: &str, policy: &RateLimitPolicy, now: Instant, seen_at: u64) -> Self {
        Self {
            client_key: client_key.to_string(),
            bucket: Mutex::new(TokenBucket::from_policy(policy, now)),
            last_seen: AtomicU64::new(seen_at),
        }
    }

    /// Try to take one token from this client's bucket.
    pub fn allow(&self, now: Instant) -> bool {
        self.bucket.lock().allow(now)
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// Current token level of the bucket.
    pub fn tokens(&self) -> f64 {
        self.bucket.lock().tokens()
    }

    /// Time until the bucket can admit again, if ever.
    pub fn time_until_available(&self) -> Option<Duration> {
        self.bucket.lock().time_until_available()
    }

    fn touch(&self, seen_at: u64) {
        self.last_seen.fetch_max(seen_at, Ordering::AcqRel);
    }

    fn last_seen_nanos(&self) -> u64 {
        self.last_seen.load(Ordering::Acquire)
    }
}

/// Maps client keys to their token buckets.
///
/// Lookups of known clients take the shared lock; creating and sweeping
/// entries take the exclusive lock. Each bucket has its own mutex, so a
/// busy client never blocks another.
#[derive(Debug)]
pub struct ClientRegistry {
    /// Entries indexed by client key
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
    /// Policy for every bucket created by this registry
    policy: RateLimitPolicy,
    /// Reference point for `last_seen` timestamps
    epoch: Instant,
    /// Set while sweeps are failing; the gate admits everything meanwhile
    fail_open: AtomicBool,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            epoch: Instant::now(),
            fail_open: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Get the entry for a client, creating it with a full bucket on first
    /// sight. Refreshes the entry's last-seen time.
    ///
    /// Creation re-checks under the exclusive lock, so concurrent first
    /// requests from one client always end up sharing a single bucket.
    pub fn get_or_create(&self, client_key: &str, now: Instant) -> Arc<RegistryEntry> {
        let seen_at = self.offset(now);

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(client_key) {
                entry.touch(seen_at);
                return Arc::clone(entry);
            }
        }

        let (entry, clients) = {
            let mut entries = self.entries.write();

            // Another caller may have inserted it between the two locks
            if let Some(entry) = entries.get(client_key) {
                entry.touch(seen_at);
                return Arc::clone(entry);
            }

            let entry = Arc::new(RegistryEntry::new(client_key, &self.policy, now, seen_at));
            entries.insert(client_key.to_string(), Arc::clone(&entry));
            (entry, entries.len())
        };

        debug!(
            client = %client_key,
            rps = self.policy.requests_per_second(),
            burst = self.policy.burst(),
            clients,
            "Creating new client bucket"
        );

        entry
    }

    /// Remove every entry idle for longer than `threshold` as of `now`.
    ///
    /// The whole sweep runs under one exclusive lock acquisition, so an
    /// entry cannot be recreated and evicted within the same pass.
    /// Returns the number of evicted entries.
    pub fn sweep(&self, now: Instant, threshold: Duration) -> usize {
        let now = self.offset(now);
        let threshold = u64::try_from(threshold.as_nanos()).unwrap_or(u64::MAX);

        let mut entries = self.entries.write();
        let before = entries.len();

        entries.retain(|key, entry| {
            let idle = now.saturating_sub(entry.last_seen_nanos());
            let keep = idle <= threshold;
            if !keep {
                trace!(client = %key, idle_ms = idle / 1_000_000, "Evicting idle client");
            }
            keep
        });

        before - entries.len()
    }

    /// Get the entry for a client without creating or touching it.
    pub fn get(&self, client_key: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.read().get(client_key).cloned()
    }

    pub fn contains(&self, client_key: &str) -> bool {
        self.entries.read().contains_key(client_key)
    }

    /// Get the number of tracked clients.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Clear all entries.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Whether the gate should currently admit everything.
    pub fn is_fail_open(&self) -> bool {
        self.fail_open.load(Ordering::Acquire)
    }

    pub fn set_fail_open(&self, fail_open: bool) {
        self.fail_open.store(fail_open, Ordering::Release);
    }

    fn offset(&self, now: Instant) -> u64 {
        let nanos = now.saturating_duration_since(self.epoch).as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}
