//! Alert enrichment: IP reputation and geolocation lookups, attached to an
//! alert after a rule fires. Both providers cache results and skip private
//! addresses entirely rather than spend a request on them.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::IdsConfig;
use crate::types::Enrichment;
use crate::utils::is_private_ip;

/// Looks up abuse reputation for a source IP. A `None` result means "no
/// opinion" (disabled, private IP, or a failed query) - it never blocks the
/// alert.
pub trait ReputationProvider: Send + Sync {
    fn check_ip(&self, ip: IpAddr) -> anyhow::Result<Option<ReputationResult>>;
}

#[derive(Debug, Clone)]
pub struct ReputationResult {
    pub abuse_score: u8,
    pub is_known_threat: bool,
    pub total_reports: u32,
    pub threat_categories: Vec<String>,
}

/// Looks up coarse geolocation for an IP.
pub trait GeoProvider: Send + Sync {
    fn locate(&self, ip: IpAddr) -> anyhow::Result<Option<GeoResult>>;
}

#[derive(Debug, Clone)]
pub struct GeoResult {
    pub country: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
}

struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
}

/// `is_known_threat := abuse_score >= confidence_threshold`, per spec - a
/// free function so the configured-threshold behavior is unit-testable
/// without a live API response.
fn classify_known_threat(abuse_score: u8, confidence_threshold: u8) -> bool {
    abuse_score >= confidence_threshold
}

fn abuseipdb_category_name(id: u32) -> Option<&'static str> {
    match id {
        3 => Some("Fraud"),
        4 => Some("DDoS Attack"),
        5 => Some("FTP Brute-Force"),
        9 => Some("Website Spam"),
        10 => Some("Email Spam"),
        11 => Some("Blog Spam"),
        14 => Some("Port Scan"),
        15 => Some("Hacking"),
        18 => Some("Brute-Force"),
        19 => Some("Bad Web Bot"),
        20 => Some("Exploited Host"),
        21 => Some("Web App Attack"),
        22 => Some("SSH Brute-Force"),
        23 => Some("IoT Targeted"),
        _ => None,
    }
}

#[derive(Deserialize)]
struct AbuseIpDbResponse {
    data: AbuseIpDbData,
}

#[derive(Deserialize)]
struct AbuseIpDbData {
    #[serde(rename = "abuseConfidenceScore")]
    abuse_confidence_score: u8,
    #[serde(rename = "totalReports")]
    total_reports: u32,
    #[serde(default)]
    reports: Vec<AbuseIpDbReport>,
}

#[derive(Deserialize)]
struct AbuseIpDbReport {
    #[serde(default)]
    categories: Vec<u32>,
}

/// Minimum spacing between outbound AbuseIPDB requests, per 4.D's rate limit.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

/// Reputation lookup against AbuseIPDB's `check` endpoint, cached for
/// `cache_ttl_secs` per config.
pub struct AbuseIpDbProvider {
    client: reqwest::blocking::Client,
    api_key: String,
    cache_ttl: Duration,
    confidence_threshold: u8,
    cache: DashMap<IpAddr, CacheEntry<ReputationResult>>,
    last_request: std::sync::Mutex<Option<Instant>>,
}

impl AbuseIpDbProvider {
    const API_URL: &'static str = "https://api.abuseipdb.com/api/v2/check";

    pub fn new(config: &IdsConfig) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            api_key: config.threat_intelligence.abuseipdb.api_key.clone(),
            cache_ttl: config.abuseipdb_cache_ttl(),
            confidence_threshold: config.threat_intelligence.abuseipdb.confidence_threshold,
            cache: DashMap::new(),
            last_request: std::sync::Mutex::new(None),
        }
    }

    /// Blocks the calling thread until at least [`MIN_REQUEST_INTERVAL`] has
    /// passed since the previous outbound request.
    fn throttle(&self) {
        let mut last = self.last_request.lock().unwrap();
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                std::thread::sleep(MIN_REQUEST_INTERVAL - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

impl ReputationProvider for AbuseIpDbProvider {
    fn check_ip(&self, ip: IpAddr) -> anyhow::Result<Option<ReputationResult>> {
        if self.api_key.is_empty() {
            return Ok(None);
        }
        if is_private_ip(ip) {
            return Ok(Some(ReputationResult {
                abuse_score: 0,
                is_known_threat: false,
                total_reports: 0,
                threat_categories: Vec::new(),
            }));
        }

        if let Some(entry) = self.cache.get(&ip) {
            if entry.inserted_at.elapsed() < self.cache_ttl {
                debug!(%ip, "using cached abuse reputation");
                return Ok(Some(entry.value.clone()));
            }
        }
        self.cache.remove(&ip);
        self.throttle();

        let response = self
            .client
            .get(Self::API_URL)
            .header("Accept", "application/json")
            .header("Key", &self.api_key)
            .query(&[
                ("ipAddress", ip.to_string()),
                ("maxAgeInDays", "90".to_string()),
                ("verbose", String::new()),
            ])
            .timeout(Duration::from_secs(5))
            .send();

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(%ip, error = %e, "abuseipdb query failed");
                return Ok(None);
            }
        };

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("abuseipdb rate limit reached");
            return Ok(None);
        }
        if !response.status().is_success() {
            warn!(status = %response.status(), "abuseipdb api error");
            return Ok(None);
        }

        let body: AbuseIpDbResponse = response.json()?;
        let mut categories = Vec::new();
        for report in body.data.reports.iter().take(5) {
            for cat_id in &report.categories {
                if let Some(name) = abuseipdb_category_name(*cat_id) {
                    if !categories.iter().any(|c: &String| c == name) {
                        categories.push(name.to_string());
                    }
                }
            }
        }

        let result = ReputationResult {
            abuse_score: body.data.abuse_confidence_score,
            is_known_threat: classify_known_threat(
                body.data.abuse_confidence_score,
                self.confidence_threshold,
            ),
            total_reports: body.data.total_reports,
            threat_categories: categories,
        };
        self.cache.insert(
            ip,
            CacheEntry {
                value: result.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(Some(result))
    }
}

#[derive(Deserialize)]
struct IpApiResponse {
    status: String,
    country: Option<String>,
    city: Option<String>,
    isp: Option<String>,
}

/// Geolocation lookup against ip-api.com's free endpoint (45 req/min),
/// cached indefinitely up to `cache_size` entries with FIFO eviction - a
/// plain bounded cache rather than a full LRU, matching the upstream's own
/// "simple FIFO for this demo" tradeoff.
pub struct IpApiProvider {
    client: reqwest::blocking::Client,
    enabled: bool,
    cache_size: usize,
    cache: DashMap<IpAddr, GeoResult>,
    insertion_order: parking_lot::Mutex<std::collections::VecDeque<IpAddr>>,
}

impl IpApiProvider {
    pub fn new(config: &IdsConfig) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            enabled: config.geolocation.enabled,
            cache_size: config.geolocation.cache_size,
            cache: DashMap::new(),
            insertion_order: parking_lot::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    fn insert_cache(&self, ip: IpAddr, result: GeoResult) {
        if self.cache.len() >= self.cache_size {
            let mut order = self.insertion_order.lock();
            if let Some(oldest) = order.pop_front() {
                self.cache.remove(&oldest);
            }
        }
        self.cache.insert(ip, result);
        self.insertion_order.lock().push_back(ip);
    }
}

impl GeoProvider for IpApiProvider {
    fn locate(&self, ip: IpAddr) -> anyhow::Result<Option<GeoResult>> {
        if !self.enabled {
            return Ok(None);
        }
        if let Some(cached) = self.cache.get(&ip) {
            return Ok(Some(cached.clone()));
        }
        if is_private_ip(ip) {
            return Ok(Some(GeoResult {
                country: Some("Local Network".to_string()),
                city: Some("Internal".to_string()),
                isp: Some("Private Network".to_string()),
            }));
        }

        let url = format!("http://ip-api.com/json/{}", ip);
        let response = match self.client.get(&url).timeout(Duration::from_secs(2)).send() {
            Ok(r) => r,
            Err(e) => {
                warn!(%ip, error = %e, "geolocation query failed");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            return Ok(None);
        }

        let body: IpApiResponse = response.json()?;
        if body.status != "success" {
            return Ok(None);
        }

        let result = GeoResult {
            country: body.country,
            city: body.city,
            isp: body.isp,
        };
        self.insert_cache(ip, result.clone());
        Ok(Some(result))
    }
}

/// Combines reputation and geo lookups into the `Enrichment` attached to an
/// alert. Either provider failing or returning `None` just leaves that part
/// of the enrichment empty.
pub fn enrich(
    reputation: Option<&dyn ReputationProvider>,
    geo: Option<&dyn GeoProvider>,
    ip: IpAddr,
) -> Enrichment {
    let mut enrichment = Enrichment::default();

    if let Some(provider) = reputation {
        match provider.check_ip(ip) {
            Ok(Some(result)) => {
                enrichment.abuse_score = Some(result.abuse_score);
                enrichment.is_known_threat = Some(result.is_known_threat);
                enrichment.total_reports = Some(result.total_reports);
                enrichment.threat_categories = result.threat_categories;
            }
            Ok(None) => {}
            Err(e) => warn!(%ip, error = %e, "reputation provider failed"),
        }
    }

    if let Some(provider) = geo {
        match provider.locate(ip) {
            Ok(Some(result)) => {
                enrichment.country = result.country;
                enrichment.city = result.city;
                enrichment.isp = result.isp;
            }
            Ok(None) => {}
            Err(e) => warn!(%ip, error = %e, "geo provider failed"),
        }
    }

    enrichment
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysThreat;
    impl ReputationProvider for AlwaysThreat {
        fn check_ip(&self, _ip: IpAddr) -> anyhow::Result<Option<ReputationResult>> {
            Ok(Some(ReputationResult {
                abuse_score: 90,
                is_known_threat: true,
                total_reports: 12,
                threat_categories: vec!["Hacking".to_string()],
            }))
        }
    }

    struct AlwaysGeo;
    impl GeoProvider for AlwaysGeo {
        fn locate(&self, _ip: IpAddr) -> anyhow::Result<Option<GeoResult>> {
            Ok(Some(GeoResult {
                country: Some("Narnia".to_string()),
                city: Some("Cair Paravel".to_string()),
                isp: Some("Talking Animals Net".to_string()),
            }))
        }
    }

    #[test]
    fn enrich_combines_both_providers() {
        let result = enrich(Some(&AlwaysThreat), Some(&AlwaysGeo), "8.8.8.8".parse().unwrap());
        assert_eq!(result.abuse_score, Some(90));
        assert_eq!(result.is_known_threat, Some(true));
        assert_eq!(result.country.as_deref(), Some("Narnia"));
    }

    #[test]
    fn enrich_with_no_providers_yields_empty_enrichment() {
        let result = enrich(None, None, "8.8.8.8".parse().unwrap());
        assert_eq!(result.abuse_score, None);
        assert!(result.threat_categories.is_empty());
    }

    #[test]
    fn abuseipdb_skips_private_ips_without_a_network_call() {
        let mut cfg = IdsConfig::default();
        cfg.threat_intelligence.abuseipdb.api_key = "test-key".to_string();
        let provider = AbuseIpDbProvider::new(&cfg);
        let result = provider.check_ip("192.168.1.5".parse().unwrap()).unwrap().unwrap();
        assert_eq!(result.abuse_score, 0);
    }

    #[test]
    fn abuseipdb_disabled_without_api_key_returns_none() {
        let cfg = IdsConfig::default();
        let provider = AbuseIpDbProvider::new(&cfg);
        assert!(provider.check_ip("8.8.8.8".parse().unwrap()).unwrap().is_none());
    }

    #[test]
    fn known_threat_classification_respects_configured_threshold() {
        assert!(classify_known_threat(80, 75));
        assert!(!classify_known_threat(80, 90));
        assert!(classify_known_threat(50, 50));
    }
}
