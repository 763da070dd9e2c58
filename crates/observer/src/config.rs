//! Observer configuration and its defaults.

use std::time::Duration;

use serde::Deserialize;

/// Well-known public node directory.
const DEFAULT_DIRECTORY_URL: &str = "https://bitnodes.io/api/v1/snapshots/latest/";

/// Batch IP geolocation endpoint.
const DEFAULT_GEO_API_URL: &str =
    "http://ip-api.com/batch?fields=status,query,country,countryCode,city,lat,lon,isp,org,as";

/// Countries the observer keeps a connection in, spanning six
/// macro-regions.
pub const DEFAULT_TARGET_COUNTRIES: &[&str] = &[
    // South America
    "BR", "AR", // Africa
    "ZA", "NG", "KE", // North America
    "US", "CA", // Europe
    "DE", "NL", "RU", // Asia
    "JP", "SG", "IN", "AE", "MY", "TH", // Oceania
    "AU", "NZ",
];

/// Tunables for discovery and the peer pool. All fields have sensible
/// defaults and can be overridden from the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Country codes the pool maintains slots for.
    pub target_countries: Vec<String>,
    /// Concurrent sessions per country.
    pub peers_per_country: usize,
    /// Candidate endpoints retained per country for failover.
    pub candidates_per_country: usize,
    /// Seconds between discovery cycles.
    pub discovery_interval_secs: u64,
    /// IPs per geolocation batch request.
    pub geo_batch_size: usize,
    /// Cap on IPs geolocated per discovery cycle.
    pub geo_max_ips: usize,
    pub directory_url: String,
    pub geo_api_url: String,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            target_countries: DEFAULT_TARGET_COUNTRIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            peers_per_country: 1,
            candidates_per_country: 10,
            discovery_interval_secs: 30 * 60,
            geo_batch_size: 100,
            geo_max_ips: 1000,
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            geo_api_url: DEFAULT_GEO_API_URL.to_string(),
        }
    }
}

impl ObserverConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_six_macro_regions() {
        let cfg = ObserverConfig::default();
        assert_eq!(cfg.target_countries.len(), 18);
        assert_eq!(cfg.peers_per_country, 1);
        assert_eq!(cfg.candidates_per_country, 10);
        assert_eq!(cfg.discovery_interval(), Duration::from_secs(1800));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ObserverConfig =
            serde_json::from_str(r#"{"target_countries": ["DE", "JP"], "peers_per_country": 2}"#)
                .unwrap();
        assert_eq!(cfg.target_countries, vec!["DE", "JP"]);
        assert_eq!(cfg.peers_per_country, 2);
        assert_eq!(cfg.geo_batch_size, 100);
    }
}
