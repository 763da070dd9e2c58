//! Node discovery: directory snapshot plus batch geolocation.
//!
//! A periodic task fetches the public node directory, keeps the IPv4
//! entries, geolocates them in batches and hands per-country candidate
//! lists to the pool. Failures leave the pool untouched; the next cycle
//! retries.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ObserverConfig;
use crate::pool::{PeerEndpoint, PeerPool};

/// Directory fetch attempts before giving up on a rate-limited cycle.
const MAX_DIRECTORY_ATTEMPTS: u32 = 3;

/// Pause between geolocation batches.
const GEO_BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Discovery failures; all of them abort the cycle without touching the
/// pool.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("directory returned status {0}")]
    UnexpectedStatus(u16),

    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
}

#[derive(Debug, Deserialize)]
struct DirectorySnapshot {
    /// `host:port` -> `[version, user-agent, ...]`.
    nodes: HashMap<String, Vec<serde_json::Value>>,
}

/// One entry of the batch geolocation response.
#[derive(Debug, Clone, Deserialize)]
struct GeoResult {
    #[serde(default)]
    status: String,
    #[serde(default)]
    query: String,
    #[serde(default, rename = "countryCode")]
    country_code: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
    #[serde(default)]
    org: String,
    #[serde(default, rename = "as")]
    asn: String,
}

/// Fetches candidates and keeps the pool's per-region lists fresh.
pub struct Discovery {
    cfg: ObserverConfig,
    http: reqwest::Client,
    targets: HashSet<String>,
}

impl Discovery {
    pub fn new(cfg: ObserverConfig) -> Self {
        let targets = cfg.target_countries.iter().cloned().collect();
        Discovery {
            cfg,
            http: reqwest::Client::new(),
            targets,
        }
    }

    pub fn is_target_country(&self, code: &str) -> bool {
        self.targets.contains(code)
    }

    /// One full discovery cycle; errors are logged and the pool is left
    /// unchanged.
    pub async fn refresh(&self, pool: &PeerPool) {
        match self.fetch_nodes().await {
            Ok(by_country) => {
                for (country, endpoints) in by_country {
                    info!(country, count = endpoints.len(), "found nodes");
                    pool.set_candidates(&country, endpoints);
                }
            }
            Err(err) => error!(error = %err, "failed to fetch nodes"),
        }
    }

    /// Fetches the directory and geolocates candidates, grouped by target
    /// country.
    pub async fn fetch_nodes(
        &self,
    ) -> Result<HashMap<String, Vec<Arc<PeerEndpoint>>>, DiscoveryError> {
        info!(url = %self.cfg.directory_url, "fetching node directory");
        let snapshot = self.fetch_directory().await?;
        info!(count = snapshot.nodes.len(), "retrieved directory snapshot");

        let mut by_ip: HashMap<String, PeerEndpoint> = HashMap::new();
        let mut ips: Vec<String> = Vec::new();
        for (addr_port, fields) in &snapshot.nodes {
            let Some(endpoint) = ipv4_candidate(addr_port, fields) else {
                continue;
            };
            ips.push(endpoint.host.clone());
            by_ip.insert(endpoint.host.clone(), endpoint);
        }
        info!(count = ips.len(), "geolocating IPv4 nodes");

        let mut by_country: HashMap<String, Vec<Arc<PeerEndpoint>>> = HashMap::new();
        let capped = &ips[..ips.len().min(self.cfg.geo_max_ips)];
        for batch in capped.chunks(self.cfg.geo_batch_size.max(1)) {
            match self.lookup_geo_batch(batch).await {
                Ok(geo_map) => {
                    for (ip, geo) in geo_map {
                        let Some(mut endpoint) = by_ip.get(&ip).cloned() else {
                            continue;
                        };
                        endpoint.country_code = geo.country_code;
                        endpoint.city = geo.city;
                        endpoint.latitude = geo.lat;
                        endpoint.longitude = geo.lon;
                        endpoint.asn = geo.asn;
                        endpoint.org_name = geo.org;
                        admit_candidate(
                            &mut by_country,
                            endpoint,
                            &self.targets,
                            self.cfg.candidates_per_country,
                        );
                    }
                }
                Err(err) => warn!(error = %err, "geolocation batch failed"),
            }

            // Rate limit between batches.
            tokio::time::sleep(GEO_BATCH_PAUSE).await;
        }

        Ok(by_country)
    }

    async fn fetch_directory(&self) -> Result<DirectorySnapshot, DiscoveryError> {
        for attempt in 1..=MAX_DIRECTORY_ATTEMPTS {
            let response = self.http.get(&self.cfg.directory_url).send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response.json().await?);
            }
            if status.as_u16() != 429 {
                return Err(DiscoveryError::UnexpectedStatus(status.as_u16()));
            }
            if attempt < MAX_DIRECTORY_ATTEMPTS {
                let backoff = backoff_delay(attempt);
                warn!(attempt, backoff_secs = backoff.as_secs(), "rate limited by directory, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
        Err(DiscoveryError::RateLimited {
            attempts: MAX_DIRECTORY_ATTEMPTS,
        })
    }

    /// Geolocates up to one batch of IPs; only successful entries come
    /// back, keyed by the queried IP.
    async fn lookup_geo_batch(
        &self,
        ips: &[String],
    ) -> Result<HashMap<String, GeoResult>, DiscoveryError> {
        let results: Vec<GeoResult> = self
            .http
            .post(&self.cfg.geo_api_url)
            .json(&ips)
            .send()
            .await?
            .json()
            .await?;

        Ok(results
            .into_iter()
            .filter(|result| result.status == "success")
            .map(|result| (result.query.clone(), result))
            .collect())
    }
}

/// Linear backoff for directory rate limiting: 30 s × attempt.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(30 * u64::from(attempt))
}

/// Parses one directory entry into a candidate, or `None` for anything
/// that is not a plain IPv4 `host:port` (IPv6, onion, malformed, short
/// field arrays).
pub(crate) fn ipv4_candidate(
    addr_port: &str,
    fields: &[serde_json::Value],
) -> Option<PeerEndpoint> {
    if fields.len() < 5 {
        return None;
    }
    if addr_port.starts_with('[') {
        return None; // bracketed IPv6
    }

    let mut parts = addr_port.split(':');
    let host = parts.next()?;
    let port = parts.next()?;
    if parts.next().is_some() {
        return None; // bare IPv6
    }
    if host.ends_with(".onion") {
        return None;
    }
    host.parse::<Ipv4Addr>().ok()?;
    let port: u16 = port.parse().ok()?;

    Some(PeerEndpoint {
        host: host.to_string(),
        port,
        version: fields[0].as_i64().unwrap_or(0),
        user_agent: fields[1].as_str().unwrap_or_default().to_string(),
        ..PeerEndpoint::default()
    })
}

/// Adds the endpoint under its country when the country is targeted and
/// still below the retention cap. Returns whether it was kept.
pub(crate) fn admit_candidate(
    by_country: &mut HashMap<String, Vec<Arc<PeerEndpoint>>>,
    endpoint: PeerEndpoint,
    targets: &HashSet<String>,
    cap: usize,
) -> bool {
    if !targets.contains(&endpoint.country_code) {
        return false;
    }
    let list = by_country.entry(endpoint.country_code.clone()).or_default();
    if list.len() >= cap {
        return false;
    }
    list.push(Arc::new(endpoint));
    true
}

/// Periodic discovery until cancellation. The startup cycle is run by the
/// supervisor before this loop starts.
pub fn spawn_refresh_loop(
    discovery: Arc<Discovery>,
    pool: Arc<PeerPool>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = discovery.cfg.discovery_interval();
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => discovery.refresh(&pool).await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(version: i64, agent: &str) -> Vec<serde_json::Value> {
        vec![
            json!(version),
            json!(agent),
            json!(0),
            json!(0),
            json!(0),
        ]
    }

    #[test]
    fn backoff_is_linear_in_attempts() {
        assert_eq!(backoff_delay(1), Duration::from_secs(30));
        assert_eq!(backoff_delay(2), Duration::from_secs(60));
        assert_eq!(backoff_delay(3), Duration::from_secs(90));
    }

    #[test]
    fn candidate_parsing_keeps_plain_ipv4_only() {
        let ok = ipv4_candidate("93.184.216.34:8333", &fields(70016, "/Satoshi:27.0/")).unwrap();
        assert_eq!(ok.host, "93.184.216.34");
        assert_eq!(ok.port, 8333);
        assert_eq!(ok.version, 70016);
        assert_eq!(ok.user_agent, "/Satoshi:27.0/");

        assert!(ipv4_candidate("[2001:db8::1]:8333", &fields(0, "")).is_none());
        assert!(ipv4_candidate("2001:db8::1:8333", &fields(0, "")).is_none());
        assert!(ipv4_candidate("abcdefgh.onion:8333", &fields(0, "")).is_none());
        assert!(ipv4_candidate("not-an-ip:8333", &fields(0, "")).is_none());
        assert!(ipv4_candidate("93.184.216.34:notaport", &fields(0, "")).is_none());
        // Entries with short field arrays are skipped outright.
        assert!(ipv4_candidate("93.184.216.34:8333", &[json!(1)]).is_none());
    }

    #[test]
    fn admission_respects_target_set_and_cap() {
        let targets: HashSet<String> = ["DE".to_string()].into_iter().collect();
        let mut by_country = HashMap::new();

        let make = |host: &str, country: &str| PeerEndpoint {
            host: host.to_string(),
            port: 8333,
            country_code: country.to_string(),
            ..PeerEndpoint::default()
        };

        assert!(admit_candidate(&mut by_country, make("a", "DE"), &targets, 2));
        assert!(admit_candidate(&mut by_country, make("b", "DE"), &targets, 2));
        // Cap reached.
        assert!(!admit_candidate(&mut by_country, make("c", "DE"), &targets, 2));
        // Untargeted country.
        assert!(!admit_candidate(&mut by_country, make("d", "FR"), &targets, 2));

        assert_eq!(by_country["DE"].len(), 2);
        assert!(!by_country.contains_key("FR"));
    }

    #[test]
    fn geo_results_deserialize_from_service_shape() {
        let body = json!([
            {"status": "success", "query": "1.2.3.4", "countryCode": "JP",
             "city": "Tokyo", "lat": 35.68, "lon": 139.69,
             "org": "Example K.K.", "as": "AS64500 Example"},
            {"status": "fail", "query": "10.0.0.1"}
        ]);
        let results: Vec<GeoResult> = serde_json::from_value(body).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].country_code, "JP");
        assert_eq!(results[0].asn, "AS64500 Example");
        assert_eq!(results[1].status, "fail");
    }

    #[test]
    fn directory_snapshot_shape() {
        let body = json!({
            "nodes": {
                "93.184.216.34:8333": [70016, "/Satoshi:27.0/", 1, 2, 3],
                "[2001:db8::1]:8333": [70016, "/Satoshi:27.0/", 1, 2, 3]
            }
        });
        let snapshot: DirectorySnapshot = serde_json::from_value(body).unwrap();
        assert_eq!(snapshot.nodes.len(), 2);
    }
}
