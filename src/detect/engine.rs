//! Detection engine
//!
//! Stateless orchestration per evaluation. Connection checks run in a fixed
//! order: allow-list, block-list, indicator match, then the scored path
//! (reputation, port heuristics, DGA). Flow checks fuse the behavioral
//! heuristics with reputation. Any internal failure degrades to an UNKNOWN
//! verdict rather than surfacing an error into the capture path.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::DetectionConfig;
use crate::core::packet::IpProtocol;
use crate::detect::explain::{explain_threat, ExplainInput, ThreatExplanation};
use crate::detect::{DetectionMethod, ThreatAnalysis, ThreatLevel};
use crate::error::Result;
use crate::events::{AlertRecord, MonitorEvent};
use crate::flow::Flow;
use crate::heuristics::{
    analyze_domain, beaconing, dns_tunnel, exfiltration, fast_flux, mining, port_scan,
    HeuristicResult, PortAttempt,
};
use crate::intel::{IocMatcher, ListStore, ReputationService};
use crate::intel::lists::EntryType;

const RAT_PORTS: [u16; 4] = [1337, 31337, 12345, 27374];
const PROXY_PORTS: [u16; 3] = [9050, 9051, 1080];
const IRC_PORTS: std::ops::RangeInclusive<u16> = 6660..=6669;
const MINER_PORTS: [u16; 4] = [3333, 4444, 5555, 14433];
const MALWARE_PORTS: [u16; 9] = [1337, 31337, 12345, 27374, 4444, 5555, 6666, 7777, 8888];

const AUTO_BLOCK_SCORE: u8 = 70;

/// Heuristic fusion weights for flow analysis
const WEIGHT_BEACONING: f64 = 30.0;
const WEIGHT_DNS_TUNNEL: f64 = 40.0;
const WEIGHT_FAST_FLUX: f64 = 25.0;
const WEIGHT_PORT_SCAN: f64 = 20.0;
const WEIGHT_EXFILTRATION: f64 = 35.0;
const WEIGHT_MINING: f64 = 30.0;

/// What the engine needs to know about one connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    /// IP protocol number, not restricted to the parsed set
    pub protocol: u8,
    pub domain: Option<String>,
}

/// Side data for flow analysis that does not live on the flow itself
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    /// Addresses the flow's domain previously resolved to
    pub ip_history: Vec<IpAddr>,
    /// Connection attempts toward the flow's destination host
    pub port_attempts: Vec<PortAttempt>,
}

/// Verdict plus the evidence behind it, for flows
#[derive(Debug, Clone)]
pub struct FlowAnalysis {
    pub analysis: ThreatAnalysis,
    pub heuristics: Vec<HeuristicResult>,
    pub explanation: ThreatExplanation,
}

struct PortThreat {
    score: u8,
    reason: &'static str,
}

pub struct DetectionEngine {
    config: DetectionConfig,
    ioc: Arc<IocMatcher>,
    lists: Arc<ListStore>,
    reputation: Arc<ReputationService>,
    event_tx: Option<mpsc::Sender<MonitorEvent>>,
}

impl DetectionEngine {
    pub fn new(
        config: DetectionConfig,
        ioc: Arc<IocMatcher>,
        lists: Arc<ListStore>,
        reputation: Arc<ReputationService>,
    ) -> Self {
        Self {
            config,
            ioc,
            lists,
            reputation,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<MonitorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Evaluate a single connection
    pub async fn analyze_connection(&self, conn: &ConnectionInfo) -> ThreatAnalysis {
        match self.try_analyze_connection(conn).await {
            Ok(analysis) => analysis,
            Err(e) => {
                error!("Error analyzing connection to {}: {}", conn.dst_ip, e);
                ThreatAnalysis::failed()
            }
        }
    }

    async fn try_analyze_connection(&self, conn: &ConnectionInfo) -> Result<ThreatAnalysis> {
        if self.is_allowlisted(conn) {
            return Ok(ThreatAnalysis {
                level: ThreatLevel::Safe,
                score: 0,
                reason: "Destination is allow-listed".to_string(),
                should_block: false,
                method: DetectionMethod::Allowlist,
                country: None,
                isp: None,
            });
        }

        if self.is_blocklisted(conn) {
            let analysis = ThreatAnalysis {
                level: ThreatLevel::Critical,
                score: 100,
                reason: "Destination is block-listed".to_string(),
                should_block: true,
                method: DetectionMethod::Blocklist,
                country: None,
                isp: None,
            };
            self.emit_alert(&analysis, conn);
            return Ok(analysis);
        }

        let ioc_match = self.ioc.check_ip(&conn.dst_ip);
        if ioc_match.matched {
            let analysis = ThreatAnalysis {
                level: ThreatLevel::Critical,
                score: 100,
                reason: format!("Known {}: {}", ioc_match.category, ioc_match.description),
                should_block: self.config.auto_block,
                method: DetectionMethod::Ioc,
                country: None,
                isp: None,
            };
            self.emit_alert(&analysis, conn);
            return Ok(analysis);
        }

        let port_threat = check_suspicious_port(conn.dst_port, conn.protocol);
        if let Some(ref threat) = port_threat {
            debug!("Suspicious port {} on {}: {}", conn.dst_port, conn.dst_ip, threat.reason);
        }

        let reputation = self
            .reputation
            .check(conn.dst_ip, conn.domain.as_deref())
            .await;

        let dga_score = conn
            .domain
            .as_deref()
            .map(|d| {
                let dga = analyze_domain(d);
                if dga.is_dga {
                    (dga.confidence * 50.0) as u32
                } else {
                    0
                }
            })
            .unwrap_or(0);

        let mut score = reputation.score as u32
            + port_threat.as_ref().map(|t| t.score as u32).unwrap_or(0)
            + dga_score;
        if MALWARE_PORTS.contains(&conn.dst_port) || IRC_PORTS.contains(&conn.dst_port) {
            score += 15;
        }
        if conn.protocol != IpProtocol::Tcp.number() && conn.protocol != IpProtocol::Udp.number() {
            score += 5;
        }
        let score = score.min(100) as u8;

        let reason = match port_threat {
            Some(ref threat) => format!("{}; {}", reputation.message, threat.reason),
            None => reputation.message.clone(),
        };

        let analysis = ThreatAnalysis {
            level: ThreatLevel::from_score(score),
            score,
            reason,
            should_block: self.config.auto_block && score >= AUTO_BLOCK_SCORE,
            method: DetectionMethod::Scored,
            country: reputation.country,
            isp: reputation.isp,
        };

        if score >= self.config.alert_threshold {
            self.emit_alert(&analysis, conn);
        }

        Ok(analysis)
    }

    /// Evaluate a flow by fusing the behavioral heuristics with reputation
    pub async fn analyze_flow(&self, flow: &Flow, context: &FlowContext) -> FlowAnalysis {
        let mut results = vec![
            beaconing::detect(flow),
            dns_tunnel::detect(flow),
            exfiltration::detect(flow),
            mining::detect(flow),
        ];
        results.push(fast_flux::detect(
            flow.domain.as_deref(),
            &context.ip_history,
            flow.key.dst_ip,
        ));
        if !context.port_attempts.is_empty() {
            results.push(port_scan::detect(&context.port_attempts));
        }

        let heuristic_score: f64 = results
            .iter()
            .filter(|r| r.detected)
            .map(|r| weight_for(r) * r.confidence)
            .sum();
        let heuristic_score = heuristic_score.min(100.0);

        let reputation = self
            .reputation
            .check(flow.key.dst_ip, flow.domain.as_deref())
            .await;

        let blended = (0.6 * reputation.score as f64 + 0.4 * heuristic_score)
            .clamp(0.0, 100.0) as u8;
        let level = ThreatLevel::from_score(blended);

        let detected: Vec<&HeuristicResult> = results.iter().filter(|r| r.detected).collect();
        let reason = if detected.is_empty() {
            reputation.message.clone()
        } else {
            detected
                .iter()
                .map(|r| r.reason.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };

        let analysis = ThreatAnalysis {
            level,
            score: blended,
            reason,
            should_block: self.config.auto_block && blended >= AUTO_BLOCK_SCORE,
            method: DetectionMethod::Heuristic,
            country: reputation.country.clone(),
            isp: reputation.isp.clone(),
        };

        let explanation = explain_threat(&ExplainInput {
            score: blended,
            level,
            reputation_score: reputation.score,
            port_score: 0,
            dga: flow.domain.as_deref().map(analyze_domain),
            heuristics: results.clone(),
            flow: Some(flow),
            ioc_matched: false,
            ioc_details: String::new(),
        });

        if blended >= self.config.alert_threshold {
            self.emit_alert(
                &analysis,
                &ConnectionInfo {
                    dst_ip: flow.key.dst_ip,
                    dst_port: flow.key.dst_port,
                    protocol: flow.key.protocol.number(),
                    domain: flow.domain.clone(),
                },
            );
        }

        FlowAnalysis {
            analysis,
            heuristics: results,
            explanation,
        }
    }

    fn is_allowlisted(&self, conn: &ConnectionInfo) -> bool {
        self.lists
            .is_allowed(&conn.dst_ip.to_string(), EntryType::Ip)
            || conn
                .domain
                .as_deref()
                .map(|d| self.lists.is_allowed(d, EntryType::Domain))
                .unwrap_or(false)
    }

    fn is_blocklisted(&self, conn: &ConnectionInfo) -> bool {
        self.lists
            .is_blocked(&conn.dst_ip.to_string(), EntryType::Ip)
            || conn
                .domain
                .as_deref()
                .map(|d| self.lists.is_blocked(d, EntryType::Domain))
                .unwrap_or(false)
    }

    fn emit_alert(&self, analysis: &ThreatAnalysis, conn: &ConnectionInfo) {
        if !self.config.notifications_enabled {
            return;
        }
        if self.config.critical_alerts_only && analysis.level != ThreatLevel::Critical {
            return;
        }
        if let Some(ref tx) = self.event_tx {
            let record = AlertRecord {
                level: analysis.level,
                title: AlertRecord::title_for(analysis.level).to_string(),
                message: format!("{}:{} - {}", conn.dst_ip, conn.dst_port, analysis.reason),
                ip: conn.dst_ip,
                score: analysis.score,
                timestamp: Utc::now().timestamp_millis(),
            };
            // fire and forget; a full consumer must not stall analysis
            let _ = tx.try_send(MonitorEvent::Alert(record));
        }
    }
}

fn weight_for(result: &HeuristicResult) -> f64 {
    use crate::heuristics::HeuristicKind::*;
    match result.kind {
        Beaconing => WEIGHT_BEACONING,
        DnsTunneling => WEIGHT_DNS_TUNNEL,
        FastFlux => WEIGHT_FAST_FLUX,
        PortScan => WEIGHT_PORT_SCAN,
        DataExfiltration => WEIGHT_EXFILTRATION,
        CryptoMining => WEIGHT_MINING,
    }
}

fn check_suspicious_port(port: u16, protocol: u8) -> Option<PortThreat> {
    let tcp = protocol == IpProtocol::Tcp.number();
    if RAT_PORTS.contains(&port) {
        Some(PortThreat {
            score: 30,
            reason: "Common RAT port",
        })
    } else if PROXY_PORTS.contains(&port) {
        Some(PortThreat {
            score: 15,
            reason: "Proxy/Tor port",
        })
    } else if IRC_PORTS.contains(&port) {
        Some(PortThreat {
            score: 20,
            reason: "IRC port (potential botnet)",
        })
    } else if MINER_PORTS.contains(&port) && tcp {
        Some(PortThreat {
            score: 25,
            reason: "Potential crypto miner",
        })
    } else if port > 49152 && tcp {
        Some(PortThreat {
            score: 5,
            reason: "Dynamic/private port",
        })
    } else {
        None
    }
}
