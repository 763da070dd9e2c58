//! Geo-diverse peer pool: candidates, active slots, backoff and strikes.
//!
//! One lock guards all bookkeeping maps and is only ever held for
//! constant-time work; sessions never reach into the pool while blocked on
//! the network.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use chainwatch_storage::GeoInfo;

/// A discovered node with its geolocation attributes.
///
/// Created by discovery; the owning session later attaches the remote's
/// version fields to the stored peer row, not to this struct.
#[derive(Debug, Clone, Default)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
    pub version: i64,
    pub user_agent: String,
    pub city: String,
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub asn: String,
    pub org_name: String,
}

impl PeerEndpoint {
    /// `host:port` key used across the pool and the store.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Geo record for the store, tagged with the pool region.
    pub fn geo_info(&self, region: &str) -> GeoInfo {
        GeoInfo {
            country_code: self.country_code.clone(),
            city: self.city.clone(),
            region: region.to_string(),
            latitude: self.latitude,
            longitude: self.longitude,
            asn: self.asn.clone(),
            org_name: self.org_name.clone(),
        }
    }
}

/// Pool policy knobs with production defaults.
#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
    /// Concurrent sessions per region.
    pub peers_per_region: usize,
    /// How long a failed endpoint is ineligible.
    pub failure_backoff: Duration,
    /// Window within which repeated disconnects earn strikes.
    pub disconnect_window: Duration,
    /// Strikes that move an endpoint to the blacklist.
    pub max_strikes: u32,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        PoolPolicy {
            peers_per_region: 1,
            failure_backoff: Duration::from_secs(5 * 60),
            disconnect_window: Duration::from_secs(2 * 60),
            max_strikes: 2,
        }
    }
}

#[derive(Default)]
struct PoolInner {
    /// Region -> candidate endpoints, in discovery order.
    candidates: HashMap<String, Vec<Arc<PeerEndpoint>>>,
    /// Region -> currently connected endpoint addrs.
    active: HashMap<String, HashSet<String>>,
    last_failure: HashMap<String, Instant>,
    last_disconnect: HashMap<String, Instant>,
    strikes: HashMap<String, u32>,
    /// Permanent for the process lifetime.
    blacklist: HashSet<String>,
}

/// Tracks candidates and live sessions per region.
pub struct PeerPool {
    policy: PoolPolicy,
    inner: Mutex<PoolInner>,
}

impl PeerPool {
    pub fn new(policy: PoolPolicy) -> Self {
        PeerPool {
            policy,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Replaces the candidate list for a region.
    pub fn set_candidates(&self, region: &str, endpoints: Vec<Arc<PeerEndpoint>>) {
        self.inner
            .lock()
            .candidates
            .insert(region.to_string(), endpoints);
    }

    /// First candidate that is not blacklisted, not active and out of its
    /// failure backoff. `None` leaves the region under-provisioned until
    /// the next poll.
    pub fn next_for_region(&self, region: &str) -> Option<Arc<PeerEndpoint>> {
        self.next_for_region_at(region, Instant::now())
    }

    fn next_for_region_at(&self, region: &str, now: Instant) -> Option<Arc<PeerEndpoint>> {
        let inner = self.inner.lock();
        let candidates = inner.candidates.get(region)?;
        let active = inner.active.get(region);

        candidates
            .iter()
            .find(|endpoint| {
                let addr = endpoint.addr();
                if inner.blacklist.contains(&addr) {
                    return false;
                }
                if active.is_some_and(|set| set.contains(&addr)) {
                    return false;
                }
                match inner.last_failure.get(&addr) {
                    Some(failed_at) => {
                        now.saturating_duration_since(*failed_at) >= self.policy.failure_backoff
                    }
                    None => true,
                }
            })
            .cloned()
    }

    /// Marks a dial or handshake failure.
    pub fn mark_failed(&self, addr: &str) {
        self.mark_failed_at(addr, Instant::now());
    }

    pub(crate) fn mark_failed_at(&self, addr: &str, when: Instant) {
        self.inner
            .lock()
            .last_failure
            .insert(addr.to_string(), when);
    }

    /// Tracks a short-lived disconnect. Two inside the disconnect window
    /// blacklist the endpoint for the rest of the process.
    pub fn mark_disconnect(&self, addr: &str) {
        self.mark_disconnect_at(addr, Instant::now());
    }

    pub(crate) fn mark_disconnect_at(&self, addr: &str, now: Instant) {
        let mut inner = self.inner.lock();

        let rapid = inner
            .last_disconnect
            .get(addr)
            .is_some_and(|last| now.saturating_duration_since(*last) < self.policy.disconnect_window);

        if rapid {
            let strikes = inner.strikes.entry(addr.to_string()).or_insert(0);
            *strikes += 1;
            if *strikes >= self.policy.max_strikes {
                inner.blacklist.insert(addr.to_string());
                warn!(peer = addr, "blacklisted peer (repeated rapid disconnections)");
            }
        } else {
            inner.strikes.insert(addr.to_string(), 1);
        }

        inner.last_disconnect.insert(addr.to_string(), now);
        inner.last_failure.insert(addr.to_string(), now);
    }

    pub fn is_blacklisted(&self, addr: &str) -> bool {
        self.inner.lock().blacklist.contains(addr)
    }

    pub fn set_active(&self, region: &str, addr: &str) {
        self.inner
            .lock()
            .active
            .entry(region.to_string())
            .or_default()
            .insert(addr.to_string());
    }

    pub fn remove_active(&self, region: &str, addr: &str) {
        if let Some(set) = self.inner.lock().active.get_mut(region) {
            set.remove(addr);
        }
    }

    pub fn active_count(&self, region: &str) -> usize {
        self.inner
            .lock()
            .active
            .get(region)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub fn total_active(&self) -> usize {
        self.inner.lock().active.values().map(|set| set.len()).sum()
    }

    /// Sorted comma-joined list of regions with at least one live session,
    /// for the periodic status line.
    pub fn status_line(&self) -> String {
        let inner = self.inner.lock();
        let mut regions: Vec<&str> = inner
            .active
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(region, _)| region.as_str())
            .collect();
        regions.sort_unstable();
        regions.join(",")
    }
}

impl Default for PeerPool {
    fn default() -> Self {
        PeerPool::new(PoolPolicy::default())
    }
}
