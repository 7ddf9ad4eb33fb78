//! Threat explanations
//!
//! Pure transformation from a verdict and its contributing signals into
//! ranked factors, a primary reason and a recommendation list. Safe to call
//! repeatedly on the same input.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::detect::ThreatLevel;
use crate::flow::Flow;
use crate::heuristics::{DgaAnalysis, HeuristicKind, HeuristicResult};

/// One weighted contributor to a verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Factor {
    pub name: String,
    /// 0-100
    pub score: u8,
    pub weight: f64,
    pub description: String,
    pub severity: String,
}

/// Ranked explanation of a verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatExplanation {
    pub level: ThreatLevel,
    pub overall_score: u8,
    pub primary_reason: String,
    /// Sorted by score * weight, descending
    pub factors: Vec<Factor>,
    pub recommendations: Vec<String>,
    pub technical_details: HashMap<String, serde_json::Value>,
}

/// Everything the explainer may draw on
pub struct ExplainInput<'a> {
    pub score: u8,
    pub level: ThreatLevel,
    pub reputation_score: u8,
    pub port_score: u8,
    pub dga: Option<DgaAnalysis>,
    pub heuristics: Vec<HeuristicResult>,
    pub flow: Option<&'a Flow>,
    pub ioc_matched: bool,
    pub ioc_details: String,
}

pub fn explain_threat(input: &ExplainInput<'_>) -> ThreatExplanation {
    let mut factors = Vec::new();
    let mut recommendations = Vec::new();
    let mut technical_details = HashMap::new();

    if input.ioc_matched {
        factors.push(Factor {
            name: "Known Malicious IOC".to_string(),
            score: 100,
            weight: 1.0,
            description: input.ioc_details.clone(),
            severity: "CRITICAL".to_string(),
        });
        recommendations.push("Immediate action: block this connection".to_string());
        recommendations.push("Document this incident for security review".to_string());
        recommendations.push("Investigate the application that made this connection".to_string());
    }

    if input.reputation_score > 0 {
        let severity = match input.reputation_score {
            80..=u8::MAX => "CRITICAL",
            60..=79 => "HIGH",
            40..=59 => "MEDIUM",
            _ => "LOW",
        };
        factors.push(Factor {
            name: "OSINT Threat Intelligence".to_string(),
            score: input.reputation_score,
            weight: 0.5,
            description: format!(
                "Multiple threat intelligence sources flagged this IP/domain with a score of {}",
                input.reputation_score
            ),
            severity: severity.to_string(),
        });
        technical_details.insert("osint_score".to_string(), json!(input.reputation_score));
        if input.reputation_score > 50 {
            recommendations.push("Review threat intelligence reports for this IP".to_string());
        }
    }

    if input.port_score > 0 {
        factors.push(Factor {
            name: "Suspicious Port Usage".to_string(),
            score: input.port_score,
            weight: 0.2,
            description:
                "Connection uses a port commonly associated with malware or unauthorized access"
                    .to_string(),
            severity: if input.port_score > 20 { "HIGH" } else { "MEDIUM" }.to_string(),
        });
        technical_details.insert("port_score".to_string(), json!(input.port_score));
        recommendations.push("Review why this application is using unusual ports".to_string());
    }

    if let Some(ref dga) = input.dga {
        if dga.is_dga {
            factors.push(Factor {
                name: "Domain Generation Algorithm (DGA)".to_string(),
                score: (dga.confidence * 100.0) as u8,
                weight: 0.3,
                description: format!(
                    "Domain shows characteristics of being algorithmically generated ({})",
                    dga.reason
                ),
                severity: "HIGH".to_string(),
            });
            technical_details.insert("dga_entropy".to_string(), json!(dga.entropy));
            technical_details.insert("dga_confidence".to_string(), json!(dga.confidence));
            technical_details.insert(
                "dga_characteristics".to_string(),
                json!(dga.characteristics),
            );
            recommendations.push("Possible DGA-based malware communication".to_string());
            recommendations.push(format!(
                "Domain entropy: {:.2} (normal < 3.5)",
                dga.entropy
            ));
        }
    }

    for result in input.heuristics.iter().filter(|r| r.detected) {
        let severity = match result.confidence {
            c if c >= 0.8 => "CRITICAL",
            c if c >= 0.6 => "HIGH",
            c if c >= 0.4 => "MEDIUM",
            _ => "LOW",
        };
        factors.push(Factor {
            name: result.kind.display_name().to_string(),
            score: (result.confidence * 100.0) as u8,
            weight: 0.25,
            description: result.reason.clone(),
            severity: severity.to_string(),
        });
        technical_details.insert(
            format!("{}_indicators", indicator_key(result.kind)),
            json!(result.indicators),
        );
        recommendations.extend(
            heuristic_recommendations(result.kind)
                .iter()
                .map(|s| s.to_string()),
        );
    }

    if let Some(flow) = input.flow {
        technical_details.insert(
            "flow_statistics".to_string(),
            json!({
                "duration_seconds": flow.duration_ms() as f64 / 1000.0,
                "packet_count": flow.packet_count,
                "bytes_sent": flow.bytes_sent,
                "bytes_received": flow.bytes_received,
                "packets_per_second": flow.packets_per_second(),
                "bytes_per_second": flow.bytes_per_second(),
            }),
        );
    }

    let primary_reason = if input.ioc_matched {
        format!("Known malicious infrastructure: {}", input.ioc_details)
    } else if !factors.is_empty() {
        factors
            .iter()
            .max_by(|a, b| {
                (a.score as f64 * a.weight)
                    .partial_cmp(&(b.score as f64 * b.weight))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|f| f.description.clone())
            .unwrap_or_else(|| "Multiple threat indicators detected".to_string())
    } else {
        "Threat score based on heuristic analysis".to_string()
    };

    if recommendations.is_empty() {
        match input.level {
            ThreatLevel::Critical | ThreatLevel::High => {
                recommendations.push("Block or monitor this connection closely".to_string());
                recommendations
                    .push("Review the application's permissions and behavior".to_string());
            }
            ThreatLevel::Medium => {
                recommendations
                    .push("Monitor this connection for suspicious patterns".to_string());
            }
            ThreatLevel::Low => {
                recommendations.push(
                    "Connection appears relatively safe but continue monitoring".to_string(),
                );
            }
            _ => {
                recommendations.push("No immediate action required".to_string());
            }
        }
    }

    if factors.is_empty() {
        factors.push(Factor {
            name: "Baseline Analysis".to_string(),
            score: input.score,
            weight: 1.0,
            description: "General threat assessment based on connection metadata".to_string(),
            severity: input.level.name().to_string(),
        });
    }

    factors.sort_by(|a, b| {
        (b.score as f64 * b.weight)
            .partial_cmp(&(a.score as f64 * a.weight))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    ThreatExplanation {
        level: input.level,
        overall_score: input.score,
        primary_reason,
        factors,
        recommendations,
        technical_details,
    }
}

impl ThreatExplanation {
    /// Plain-text rendering with the top three factors and recommendations
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Threat level: {} (score: {}/100)\n\n",
            self.level, self.overall_score
        ));
        out.push_str(&format!("Why this was flagged:\n{}\n\n", self.primary_reason));

        if !self.factors.is_empty() {
            out.push_str("Contributing factors:\n");
            for factor in self.factors.iter().take(3) {
                out.push_str(&format!("  - {}: {}\n", factor.name, factor.description));
            }
            out.push('\n');
        }

        if !self.recommendations.is_empty() {
            out.push_str("Recommendations:\n");
            for rec in self.recommendations.iter().take(3) {
                out.push_str(&format!("  {}\n", rec));
            }
        }
        out
    }
}

fn indicator_key(kind: HeuristicKind) -> &'static str {
    match kind {
        HeuristicKind::Beaconing => "beaconing",
        HeuristicKind::DnsTunneling => "dns_tunneling",
        HeuristicKind::FastFlux => "fast_flux",
        HeuristicKind::PortScan => "port_scan",
        HeuristicKind::DataExfiltration => "data_exfiltration",
        HeuristicKind::CryptoMining => "crypto_mining",
    }
}

fn heuristic_recommendations(kind: HeuristicKind) -> &'static [&'static str] {
    match kind {
        HeuristicKind::Beaconing => &[
            "Regular callback pattern detected, possible C2 communication",
            "Monitor this application for data exfiltration",
        ],
        HeuristicKind::DnsTunneling => &[
            "Possible data exfiltration via DNS",
            "Check DNS query patterns and sizes",
        ],
        HeuristicKind::PortScan => &[
            "Network scanning activity detected",
            "This may indicate reconnaissance for an attack",
        ],
        HeuristicKind::DataExfiltration => &[
            "Large data upload detected",
            "Verify whether this data transfer is authorized",
        ],
        HeuristicKind::CryptoMining => &[
            "Possible unauthorized cryptocurrency mining",
            "This may cause battery drain and performance issues",
        ],
        HeuristicKind::FastFlux => &[
            "Domain resolves to rapidly changing IPs",
            "Common technique used by botnets and malware",
        ],
    }
}
