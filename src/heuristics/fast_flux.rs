//! Fast-flux detection
//!
//! Fast-flux infrastructure rotates a domain through many addresses in a
//! short window. Detection looks at the churn rate across the full address
//! history and at how many distinct addresses appear among the most recent
//! resolutions.

use std::net::IpAddr;

use serde_json::json;

use crate::heuristics::{HeuristicKind, HeuristicResult};

const MIN_HISTORY: usize = 3;
const RECENT_WINDOW: usize = 5;
const HIGH_CHURN: f64 = 0.5;
const MODERATE_CHURN: f64 = 0.3;
const DETECTION_THRESHOLD: f64 = 0.6;

pub fn detect(
    domain: Option<&str>,
    previous_ips: &[IpAddr],
    current_ip: IpAddr,
) -> HeuristicResult {
    let domain = match domain {
        Some(d) => d,
        None => return HeuristicResult::negative(HeuristicKind::FastFlux, "No domain associated"),
    };
    if previous_ips.len() < MIN_HISTORY {
        return HeuristicResult::negative(HeuristicKind::FastFlux, "Insufficient IP history");
    }

    let mut all: Vec<IpAddr> = previous_ips.to_vec();
    all.push(current_ip);

    let unique = {
        let mut seen = std::collections::HashSet::new();
        all.iter().filter(|ip| seen.insert(**ip)).count()
    };
    let change_rate = unique as f64 / (previous_ips.len() + 1) as f64;

    let recent: std::collections::HashSet<&IpAddr> =
        all.iter().rev().take(RECENT_WINDOW).collect();
    let recent_churn = recent.len() >= MIN_HISTORY;

    let confidence = if change_rate > HIGH_CHURN && recent_churn {
        0.7
    } else if change_rate > MODERATE_CHURN {
        0.4
    } else {
        0.0
    };

    let mut result = HeuristicResult {
        kind: HeuristicKind::FastFlux,
        detected: confidence > DETECTION_THRESHOLD,
        confidence,
        reason: format!(
            "Domain {} resolved to {} addresses (change rate {:.2})",
            domain, unique, change_rate
        ),
        indicators: Default::default(),
    };
    result.indicators.insert("unique_ips".into(), json!(unique));
    result
        .indicators
        .insert("change_rate".into(), json!(change_rate));
    result
        .indicators
        .insert("recent_distinct".into(), json!(recent.len()));
    result
}
