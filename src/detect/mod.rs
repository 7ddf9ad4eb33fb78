//! Threat verdicts
//!
//! The engine fuses list checks, indicator matches, lexical domain analysis,
//! port heuristics and reputation into a scored verdict; the explainer turns
//! that verdict into ranked factors and recommendations.

pub mod engine;
pub mod explain;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use engine::{ConnectionInfo, DetectionEngine, FlowAnalysis, FlowContext};
pub use explain::{explain_threat, ExplainInput, Factor, ThreatExplanation};

/// Severity bucket for a scored connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
    /// Analysis could not run
    Unknown,
}

impl ThreatLevel {
    /// Bucket a 0-100 score
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => ThreatLevel::Critical,
            60..=79 => ThreatLevel::High,
            40..=59 => ThreatLevel::Medium,
            20..=39 => ThreatLevel::Low,
            _ => ThreatLevel::Safe,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ThreatLevel::Safe => "SAFE",
            ThreatLevel::Low => "LOW",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
            ThreatLevel::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which stage of the pipeline produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Allow-list short-circuit
    Allowlist,
    /// Block-list short-circuit
    Blocklist,
    /// Exact indicator match
    Ioc,
    /// Summed reputation, port and DGA scores
    Scored,
    /// Behavioral heuristic fusion over a flow
    Heuristic,
    /// Analysis could not run
    Unknown,
}

/// Final verdict for one connection or flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAnalysis {
    pub level: ThreatLevel,
    /// 0-100
    pub score: u8,
    pub reason: String,
    pub should_block: bool,
    pub method: DetectionMethod,
    pub country: Option<String>,
    pub isp: Option<String>,
}

impl ThreatAnalysis {
    pub fn failed() -> Self {
        Self {
            level: ThreatLevel::Unknown,
            score: 0,
            reason: "Analysis failed".to_string(),
            should_block: false,
            method: DetectionMethod::Unknown,
            country: None,
            isp: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(ThreatLevel::from_score(0), ThreatLevel::Safe);
        assert_eq!(ThreatLevel::from_score(19), ThreatLevel::Safe);
        assert_eq!(ThreatLevel::from_score(20), ThreatLevel::Low);
        assert_eq!(ThreatLevel::from_score(40), ThreatLevel::Medium);
        assert_eq!(ThreatLevel::from_score(60), ThreatLevel::High);
        assert_eq!(ThreatLevel::from_score(79), ThreatLevel::High);
        assert_eq!(ThreatLevel::from_score(80), ThreatLevel::Critical);
        assert_eq!(ThreatLevel::from_score(100), ThreatLevel::Critical);
    }

    #[test]
    fn test_level_ordering() {
        assert!(ThreatLevel::Critical > ThreatLevel::High);
        assert!(ThreatLevel::High > ThreatLevel::Medium);
        assert!(ThreatLevel::Safe < ThreatLevel::Low);
    }
}
