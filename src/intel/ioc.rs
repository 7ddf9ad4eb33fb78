//! Indicator-of-compromise matching
//!
//! Three indicator classes checked in order of confidence: exact IPs (100),
//! CIDR containment (85), regex patterns over the printed address (70). The
//! first match wins. Feeds can be swapped wholesale while readers keep
//! matching against the previous set.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::intel::bloom::BloomFilter;

/// Result of an indicator lookup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IocMatch {
    pub matched: bool,
    pub category: String,
    pub description: String,
    /// 0-100
    pub confidence: u8,
}

impl IocMatch {
    fn none() -> Self {
        Self::default()
    }
}

struct IndicatorSet {
    exact: HashSet<IpAddr>,
    cidrs: Vec<IpNetwork>,
    patterns: Vec<(String, Regex)>,
    /// Positive pre-check over the exact set. A miss skips the hash lookup;
    /// a hit only means "do the real check".
    prefilter: BloomFilter,
}

impl IndicatorSet {
    fn new(expected_elements: usize, fp_rate: f64) -> Self {
        Self {
            exact: HashSet::new(),
            cidrs: Vec::new(),
            patterns: Vec::new(),
            prefilter: BloomFilter::new(expected_elements, fp_rate),
        }
    }
}

/// Indicator matcher shared between the capture path and feed refresh
pub struct IocMatcher {
    inner: RwLock<IndicatorSet>,
    bloom_expected: usize,
    bloom_fp_rate: f64,
}

impl IocMatcher {
    pub fn new() -> Self {
        Self::with_bloom_params(10_000, 0.01)
    }

    /// Size the exact-set pre-filter for the expected feed size
    pub fn with_bloom_params(expected_elements: usize, fp_rate: f64) -> Self {
        Self {
            inner: RwLock::new(IndicatorSet::new(expected_elements, fp_rate)),
            bloom_expected: expected_elements,
            bloom_fp_rate: fp_rate,
        }
    }

    /// Check an address against all indicator classes
    pub fn check_ip(&self, ip: &IpAddr) -> IocMatch {
        let set = self.inner.read();
        let printed = ip.to_string();

        if set.prefilter.might_contain(&printed) && set.exact.contains(ip) {
            return IocMatch {
                matched: true,
                category: "Known Malicious IP".to_string(),
                description: "IP found in indicator feed".to_string(),
                confidence: 100,
            };
        }

        for cidr in &set.cidrs {
            if cidr.contains(*ip) {
                return IocMatch {
                    matched: true,
                    category: "Suspicious Range".to_string(),
                    description: "IP in known malicious CIDR range".to_string(),
                    confidence: 85,
                };
            }
        }

        for (category, pattern) in &set.patterns {
            if pattern.is_match(&printed) {
                return IocMatch {
                    matched: true,
                    category: category.clone(),
                    description: "IP matches suspicious pattern".to_string(),
                    confidence: 70,
                };
            }
        }

        IocMatch::none()
    }

    pub fn add_ip(&self, ip: IpAddr) {
        let mut set = self.inner.write();
        set.prefilter.add(&ip.to_string());
        set.exact.insert(ip);
    }

    /// The pre-filter cannot forget; removed entries cost one extra hash
    /// lookup until the next feed replacement rebuilds it.
    pub fn remove_ip(&self, ip: &IpAddr) {
        self.inner.write().exact.remove(ip);
    }

    pub fn add_cidr(&self, network: IpNetwork) {
        self.inner.write().cidrs.push(network);
    }

    /// Register a regex pattern matched against the printed address
    pub fn add_pattern(&self, category: &str, pattern: &str) -> Result<(), regex::Error> {
        let compiled = Regex::new(pattern)?;
        self.inner
            .write()
            .patterns
            .push((category.to_string(), compiled));
        Ok(())
    }

    /// Replace the exact-IP and CIDR sets in one step (feed refresh).
    /// Lines that parse as neither are counted and skipped.
    pub fn replace_feed<'a, I>(&self, entries: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut exact = HashSet::new();
        let mut cidrs = Vec::new();
        let mut skipped = 0usize;

        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            if let Ok(ip) = entry.parse::<IpAddr>() {
                exact.insert(ip);
            } else if let Ok(net) = entry.parse::<IpNetwork>() {
                cidrs.push(net);
            } else {
                skipped += 1;
            }
        }

        if skipped > 0 {
            warn!("Skipped {} unparseable feed entries", skipped);
        }

        let mut prefilter = BloomFilter::new(
            self.bloom_expected.max(exact.len()),
            self.bloom_fp_rate,
        );
        for ip in &exact {
            prefilter.add(&ip.to_string());
        }

        let mut set = self.inner.write();
        info!(
            "Indicator feed replaced: {} exact IPs, {} CIDR ranges",
            exact.len(),
            cidrs.len()
        );
        set.exact = exact;
        set.cidrs = cidrs;
        set.prefilter = prefilter;
    }

    pub fn indicator_count(&self) -> usize {
        let set = self.inner.read();
        set.exact.len() + set.cidrs.len() + set.patterns.len()
    }
}

impl Default for IocMatcher {
    fn default() -> Self {
        Self::new()
    }
}
