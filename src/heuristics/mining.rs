//! Cryptocurrency mining detection
//!
//! Stratum pools sit on a handful of well-known ports and advertise
//! themselves in their hostnames. A mining session is also long-lived and,
//! because share submission is periodic, often beacon-like.

use serde_json::json;

use crate::flow::Flow;
use crate::heuristics::{beaconing, HeuristicKind, HeuristicResult};

const MINING_PORTS: [u16; 9] = [3333, 4444, 5555, 7777, 8888, 9999, 14433, 14444, 45560];
const MINING_DOMAIN_HINTS: [&str; 6] = ["pool.", "mining.", "stratum.", "xmr", "eth", "btc"];
const LONG_LIVED_MS: i64 = 300_000;
const DETECTION_THRESHOLD: f64 = 0.6;

pub fn detect(flow: &Flow) -> HeuristicResult {
    let mining_port = MINING_PORTS.contains(&flow.key.dst_port);
    let mining_domain = flow
        .domain
        .as_deref()
        .map(|d| {
            let lower = d.to_lowercase();
            MINING_DOMAIN_HINTS.iter().any(|hint| lower.contains(hint))
        })
        .unwrap_or(false);

    let long_lived = flow.duration_ms() > LONG_LIVED_MS;
    let regular_pattern = beaconing::detect(flow).confidence > 0.5;

    let confidence = if (mining_port || mining_domain) && long_lived && regular_pattern {
        0.9
    } else if (mining_port || mining_domain) && long_lived {
        0.7
    } else if mining_port || mining_domain {
        0.5
    } else {
        0.0
    };

    let mut result = HeuristicResult {
        kind: HeuristicKind::CryptoMining,
        detected: confidence > DETECTION_THRESHOLD,
        confidence,
        reason: if confidence > DETECTION_THRESHOLD {
            format!(
                "Cryptocurrency mining indicators detected on port {}",
                flow.key.dst_port
            )
        } else {
            "No mining activity detected".to_string()
        },
        indicators: Default::default(),
    };
    result
        .indicators
        .insert("dest_port".into(), json!(flow.key.dst_port));
    result
        .indicators
        .insert("is_mining_port".into(), json!(mining_port));
    result
        .indicators
        .insert("has_mining_domain".into(), json!(mining_domain));
    result
        .indicators
        .insert("duration_ms".into(), json!(flow.duration_ms()));
    result
        .indicators
        .insert("domain".into(), json!(flow.domain.as_deref().unwrap_or("")));
    result
}
