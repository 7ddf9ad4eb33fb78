//! IP reputation lookups
//!
//! The provider trait abstracts whatever OSINT backend is wired in; the
//! service wraps it with a private-address short-circuit, a TTL cache and a
//! per-lookup timeout. Lookups degrade to a zero score instead of erroring:
//! a reputation failure must never take a verdict path down with it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Reputation verdict for one address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationReport {
    pub ip: IpAddr,
    /// 0-100
    pub score: u8,
    pub message: String,
    pub country: Option<String>,
    pub isp: Option<String>,
}

impl ReputationReport {
    fn clean(ip: IpAddr, message: impl Into<String>) -> Self {
        Self {
            ip,
            score: 0,
            message: message.into(),
            country: None,
            isp: None,
        }
    }
}

/// Backend that can score an address
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    async fn check_ip(&self, ip: IpAddr, domain: Option<&str>) -> anyhow::Result<ReputationReport>;
}

/// Fixed-score provider for tests and offline operation
pub struct StaticProvider {
    scores: HashMap<IpAddr, u8>,
}

impl StaticProvider {
    pub fn new(scores: HashMap<IpAddr, u8>) -> Self {
        Self { scores }
    }

    pub fn empty() -> Self {
        Self {
            scores: HashMap::new(),
        }
    }
}

#[async_trait]
impl ReputationProvider for StaticProvider {
    async fn check_ip(&self, ip: IpAddr, _domain: Option<&str>) -> anyhow::Result<ReputationReport> {
        let score = self.scores.get(&ip).copied().unwrap_or(0);
        Ok(ReputationReport {
            ip,
            score,
            message: format!("Reputation score {}", score),
            country: None,
            isp: None,
        })
    }
}

struct CachedReport {
    report: ReputationReport,
    cached_at: i64,
}

/// Reputation lookup layer used by the detection engine
pub struct ReputationService {
    provider: Arc<dyn ReputationProvider>,
    cache: RwLock<HashMap<IpAddr, CachedReport>>,
    ttl_ms: i64,
    timeout: Duration,
}

impl ReputationService {
    pub fn new(provider: Arc<dyn ReputationProvider>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
            ttl_ms: ttl.as_millis() as i64,
            timeout,
        }
    }

    /// Score an address. Private addresses short-circuit to zero; provider
    /// failures and timeouts degrade to zero and are not cached.
    pub async fn check(&self, ip: IpAddr, domain: Option<&str>) -> ReputationReport {
        if is_private_ip(&ip) {
            return ReputationReport::clean(ip, "Private IP address");
        }

        let now = Utc::now().timestamp_millis();
        if let Some(cached) = self.cache.read().get(&ip) {
            if now - cached.cached_at <= self.ttl_ms {
                return cached.report.clone();
            }
        }

        match tokio::time::timeout(self.timeout, self.provider.check_ip(ip, domain)).await {
            Ok(Ok(report)) => {
                self.cache.write().insert(
                    ip,
                    CachedReport {
                        report: report.clone(),
                        cached_at: now,
                    },
                );
                report
            }
            Ok(Err(e)) => {
                warn!("Reputation lookup failed for {}: {}", ip, e);
                ReputationReport::clean(ip, "Unable to check reputation")
            }
            Err(_) => {
                warn!("Reputation lookup timed out for {}", ip);
                ReputationReport::clean(ip, "Unable to check reputation")
            }
        }
    }

    pub fn evict_expired(&self) {
        let now = Utc::now().timestamp_millis();
        self.cache
            .write()
            .retain(|_, c| now - c.cached_at <= self.ttl_ms);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }
}

/// RFC1918 ranges plus loopback
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            match octets[0] {
                10 | 127 => true,
                172 => (16..=31).contains(&octets[1]),
                192 => octets[1] == 168,
                _ => false,
            }
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}
