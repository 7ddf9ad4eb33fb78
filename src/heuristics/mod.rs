//! Behavioral heuristics
//!
//! Each detector inspects one flow (or the side data it needs) and returns a
//! confidence with human-readable reasoning. Detectors never hard-fail: a
//! flow with too little history simply comes back not-detected.

pub mod beaconing;
pub mod dga;
pub mod dns_tunnel;
pub mod exfiltration;
pub mod fast_flux;
pub mod mining;
pub mod port_scan;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use dga::{analyze_domain, shannon_entropy, DgaAnalysis};
pub use port_scan::PortAttempt;

/// Which detector produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeuristicKind {
    Beaconing,
    DnsTunneling,
    FastFlux,
    PortScan,
    DataExfiltration,
    CryptoMining,
}

impl HeuristicKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            HeuristicKind::Beaconing => "Beaconing",
            HeuristicKind::DnsTunneling => "DNS Tunneling",
            HeuristicKind::FastFlux => "Fast Flux",
            HeuristicKind::PortScan => "Port Scan",
            HeuristicKind::DataExfiltration => "Data Exfiltration",
            HeuristicKind::CryptoMining => "Cryptocurrency Mining",
        }
    }
}

impl fmt::Display for HeuristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Outcome of running one detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicResult {
    pub kind: HeuristicKind,
    pub detected: bool,
    /// 0.0-1.0
    pub confidence: f64,
    pub reason: String,
    /// Raw measurements behind the verdict, for explanations and export
    pub indicators: HashMap<String, serde_json::Value>,
}

impl HeuristicResult {
    pub fn negative(kind: HeuristicKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            detected: false,
            confidence: 0.0,
            reason: reason.into(),
            indicators: HashMap::new(),
        }
    }
}
