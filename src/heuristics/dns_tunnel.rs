//! DNS tunneling detection
//!
//! Tunnels encode payload into query names, which shows up as long labels,
//! high-entropy labels, a high unique-query ratio, and query rates no human
//! browsing produces. Evidence is additive; each signal contributes a fixed
//! weight.

use std::collections::HashSet;

use serde_json::json;

use crate::flow::Flow;
use crate::heuristics::dga::shannon_entropy;
use crate::heuristics::{HeuristicKind, HeuristicResult};

const DNS_PORT: u16 = 53;
const LONG_QUERY_AVG: f64 = 40.0;
const UNIQUE_RATIO: f64 = 0.8;
const LABEL_ENTROPY: f64 = 3.5;
const QUERY_RATE: f64 = 10.0;
const DETECTION_THRESHOLD: f64 = 0.5;

pub fn detect(flow: &Flow) -> HeuristicResult {
    if !flow.key.protocol.is_udp() || flow.key.dst_port != DNS_PORT || flow.dns_queries.is_empty() {
        return HeuristicResult::negative(HeuristicKind::DnsTunneling, "Not a DNS flow");
    }

    let queries = &flow.dns_queries;
    let mut score = 0.0;
    let mut reasons = Vec::new();

    let avg_len =
        queries.iter().map(|q| q.len()).sum::<usize>() as f64 / queries.len() as f64;
    if avg_len > LONG_QUERY_AVG {
        score += 0.3;
        reasons.push(format!("Unusually long DNS queries (avg: {:.1})", avg_len));
    }

    let unique: HashSet<&String> = queries.iter().collect();
    let unique_ratio = unique.len() as f64 / queries.len() as f64;
    if queries.len() > 1 && unique_ratio > UNIQUE_RATIO {
        score += 0.2;
        reasons.push(format!("High unique query rate: {:.2}", unique_ratio));
    }

    let avg_entropy = queries
        .iter()
        .map(|q| shannon_entropy(first_label(q)))
        .sum::<f64>()
        / queries.len() as f64;
    if avg_entropy > LABEL_ENTROPY {
        score += 0.3;
        reasons.push(format!("High entropy in queries: {:.2}", avg_entropy));
    }

    let rate = flow.packets_per_second();
    if rate > QUERY_RATE {
        score += 0.2;
        reasons.push(format!("High DNS query rate: {:.1} queries/sec", rate));
    }

    let mut result = HeuristicResult {
        kind: HeuristicKind::DnsTunneling,
        detected: score > DETECTION_THRESHOLD,
        confidence: score.min(1.0),
        reason: if reasons.is_empty() {
            "No tunneling indicators".to_string()
        } else {
            reasons.join("; ")
        },
        indicators: Default::default(),
    };
    result
        .indicators
        .insert("avg_query_length".into(), json!(avg_len));
    result
        .indicators
        .insert("unique_ratio".into(), json!(unique_ratio));
    result
        .indicators
        .insert("avg_label_entropy".into(), json!(avg_entropy));
    result
        .indicators
        .insert("queries_per_second".into(), json!(rate));
    result
}

fn first_label(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{FlowKey, IpProtocol};
    use std::net::{IpAddr, Ipv4Addr};

    fn make_dns_flow(queries: Vec<String>, span_ms: i64) -> Flow {
        let key = FlowKey {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 50000,
            dst_ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            dst_port: 53,
            protocol: IpProtocol::Udp,
        };
        let mut flow = Flow::new(key, 0, 1000);
        let n = queries.len() as i64;
        for (i, q) in queries.into_iter().enumerate() {
            flow.add_packet(i as i64 * span_ms / n.max(1), 80, true);
            flow.dns_queries.push(q);
        }
        flow
    }

    #[test]
    fn test_tunnel_traffic_detected() {
        // long high-entropy unique names arriving fast
        let queries: Vec<String> = (0..50)
            .map(|i| {
                format!(
                    "d4ta{}x9k2qpv7mzr1wj8hf5tbn3c6.tunnel.example.com",
                    i * 37
                )
            })
            .collect();
        let result = detect(&make_dns_flow(queries, 2_000));

        assert!(result.detected);
        assert!(result.confidence > 0.5);
        assert!(result.reason.contains("Unusually long DNS queries"));
    }

    #[test]
    fn test_normal_lookups_not_detected() {
        let queries = vec![
            "www.example.com".to_string(),
            "www.example.com".to_string(),
            "cdn.example.com".to_string(),
            "www.example.com".to_string(),
        ];
        let result = detect(&make_dns_flow(queries, 60_000));
        assert!(!result.detected);
    }

    #[test]
    fn test_non_dns_flow_rejected() {
        let key = FlowKey {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 50000,
            dst_ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            dst_port: 443,
            protocol: IpProtocol::Tcp,
        };
        let flow = Flow::new(key, 0, 1000);
        let result = detect(&flow);
        assert!(!result.detected);
        assert_eq!(result.reason, "Not a DNS flow");
    }
}
