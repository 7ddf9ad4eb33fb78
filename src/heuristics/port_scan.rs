//! Port scan detection
//!
//! Fed from connection attempts to one destination address. Looks for rapid
//! attempts, sequential port walks, and hits on the services scanners always
//! probe first.

use serde_json::json;

use crate::heuristics::{HeuristicKind, HeuristicResult};

const MIN_ATTEMPTS: usize = 5;
const COMMON_PORTS: [u16; 10] = [21, 22, 23, 25, 53, 80, 443, 445, 3389, 8080];
const DETECTION_THRESHOLD: f64 = 0.6;

/// One observed connection attempt toward the scanned host
#[derive(Debug, Clone, Copy)]
pub struct PortAttempt {
    pub port: u16,
    /// Millisecond epoch
    pub timestamp: i64,
}

pub fn detect(attempts: &[PortAttempt]) -> HeuristicResult {
    if attempts.len() < MIN_ATTEMPTS {
        return HeuristicResult::negative(HeuristicKind::PortScan, "Too few attempts");
    }

    let window_ms = attempts
        .iter()
        .map(|a| a.timestamp)
        .max()
        .unwrap_or(0)
        - attempts.iter().map(|a| a.timestamp).min().unwrap_or(0);
    let window_secs = (window_ms as f64 / 1000.0).max(f64::MIN_POSITIVE);
    let attempts_per_sec = (attempts.len() as f64 / window_secs).min(100.0);

    let mut ports: Vec<u16> = attempts.iter().map(|a| a.port).collect();
    ports.sort_unstable();
    let sequential = ports
        .windows(2)
        .filter(|w| w[1].wrapping_sub(w[0]) == 1)
        .count();
    let sequential_ratio = sequential as f64 / (ports.len() - 1) as f64;

    let unique_ports = {
        let mut seen = std::collections::HashSet::new();
        ports.iter().filter(|p| seen.insert(**p)).count()
    };
    let common_hits = ports.iter().filter(|p| COMMON_PORTS.contains(p)).count();

    let confidence = if attempts_per_sec > 10.0 && sequential_ratio > 0.5 {
        0.9
    } else if attempts_per_sec > 5.0 || common_hits >= 3 {
        0.7
    } else if unique_ports > 10 {
        0.5
    } else {
        0.0
    };

    let mut result = HeuristicResult {
        kind: HeuristicKind::PortScan,
        detected: confidence > DETECTION_THRESHOLD,
        confidence,
        reason: format!(
            "{} connection attempts across {} ports ({:.1}/sec)",
            attempts.len(),
            unique_ports,
            attempts_per_sec
        ),
        indicators: Default::default(),
    };
    result
        .indicators
        .insert("attempts_per_second".into(), json!(attempts_per_sec));
    result
        .indicators
        .insert("sequential_ratio".into(), json!(sequential_ratio));
    result
        .indicators
        .insert("unique_ports".into(), json!(unique_ports));
    result
        .indicators
        .insert("common_port_hits".into(), json!(common_hits));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempts(ports: &[u16], spacing_ms: i64) -> Vec<PortAttempt> {
        ports
            .iter()
            .enumerate()
            .map(|(i, p)| PortAttempt {
                port: *p,
                timestamp: i as i64 * spacing_ms,
            })
            .collect()
    }

    #[test]
    fn test_sequential_sweep_detected() {
        let ports: Vec<u16> = (1000..1040).collect();
        let result = detect(&attempts(&ports, 20)); // 50 per second
        assert!(result.detected);
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_common_port_probe_detected() {
        let result = detect(&attempts(&[22, 80, 443, 3389, 8080], 10_000));
        assert!(result.detected);
        assert!((result.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_slow_scattered_probes_lower_tier() {
        let ports: Vec<u16> = (0..12).map(|i| 10_000 + i * 97).collect();
        let result = detect(&attempts(&ports, 10_000));
        assert!(!result.detected);
        assert!((result.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_attempts() {
        let result = detect(&attempts(&[22, 80], 100));
        assert!(!result.detected);
        assert_eq!(result.reason, "Too few attempts");
    }
}
