//! Data exfiltration detection
//!
//! Large, mostly-outbound transfers, worse when sustained over time or when
//! they leave on a port no ordinary web upload uses.

use serde_json::json;

use crate::flow::Flow;
use crate::heuristics::{HeuristicKind, HeuristicResult};

const HIGH_OUTBOUND_RATIO: f64 = 0.8;
const LARGE_TRANSFER_BYTES: u64 = 1_000_000;
const SUSTAINED_SECS: f64 = 30.0;
const SUSTAINED_RATE: f64 = 50_000.0;
const WEB_PORTS: [u16; 4] = [80, 443, 8080, 8443];
const DETECTION_THRESHOLD: f64 = 0.6;

pub fn detect(flow: &Flow) -> HeuristicResult {
    let total = flow.bytes_sent + flow.bytes_received;
    let outbound_ratio = flow.bytes_sent as f64 / total.max(1) as f64;

    let high_outbound =
        outbound_ratio > HIGH_OUTBOUND_RATIO && flow.bytes_sent > LARGE_TRANSFER_BYTES;
    let duration_secs = flow.duration_ms() as f64 / 1000.0;
    let upload_rate = flow.bytes_sent as f64 / duration_secs.max(1.0);
    let sustained = duration_secs > SUSTAINED_SECS && upload_rate > SUSTAINED_RATE;
    let unusual_port = !WEB_PORTS.contains(&flow.key.dst_port);

    let confidence = if high_outbound && sustained && unusual_port {
        0.8
    } else if high_outbound && (sustained || unusual_port) {
        0.6
    } else if high_outbound || sustained {
        0.4
    } else {
        0.0
    };

    let mut result = HeuristicResult {
        kind: HeuristicKind::DataExfiltration,
        detected: confidence >= DETECTION_THRESHOLD,
        confidence,
        reason: if confidence >= DETECTION_THRESHOLD {
            format!(
                "Suspicious data upload: {:.2}MB uploaded in {:.1}s",
                flow.bytes_sent as f64 / 1_048_576.0,
                duration_secs
            )
        } else {
            "Normal data transfer".to_string()
        },
        indicators: Default::default(),
    };
    result
        .indicators
        .insert("bytes_sent".into(), json!(flow.bytes_sent));
    result
        .indicators
        .insert("bytes_received".into(), json!(flow.bytes_received));
    result
        .indicators
        .insert("upload_ratio".into(), json!(outbound_ratio));
    result
        .indicators
        .insert("duration_seconds".into(), json!(duration_secs));
    result
        .indicators
        .insert("upload_rate_bytes_per_sec".into(), json!(upload_rate));
    result
        .indicators
        .insert("dest_port".into(), json!(flow.key.dst_port));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{FlowKey, IpProtocol};
    use std::net::{IpAddr, Ipv4Addr};

    fn make_flow(dst_port: u16, sent: u64, received: u64, duration_ms: i64) -> Flow {
        let key = FlowKey {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 45000,
            dst_ip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 20)),
            dst_port,
            protocol: IpProtocol::Tcp,
        };
        let mut flow = Flow::new(key, 0, 1000);
        // two packets carrying the totals, pinning the duration
        flow.add_packet(0, (sent / 2) as u32, true);
        flow.add_packet(duration_ms, (sent - sent / 2) as u32, true);
        flow.bytes_received = received;
        flow
    }

    #[test]
    fn test_bulk_upload_on_odd_port_detected() {
        let flow = make_flow(51000, 5_000_000, 10_000, 120_000);
        let result = detect(&flow);
        assert!(result.detected);
        assert!(result.confidence >= 0.6, "confidence {}", result.confidence);
    }

    #[test]
    fn test_fast_sustained_upload_on_odd_port_high_tier() {
        // 10MB in 60s is well past the sustained-rate bar
        let flow = make_flow(51000, 10_000_000, 10_000, 60_000);
        let result = detect(&flow);
        assert!(result.detected);
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_sustained_upload_on_https_mid_tier() {
        let flow = make_flow(443, 10_000_000, 10_000, 60_000);
        let result = detect(&flow);
        assert!(result.detected);
        assert!((result.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_download_heavy_flow_not_detected() {
        let flow = make_flow(443, 50_000, 20_000_000, 120_000);
        let result = detect(&flow);
        assert!(!result.detected);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.reason, "Normal data transfer");
    }

    #[test]
    fn test_short_burst_on_https_only_partial() {
        // big and outbound but over in five seconds on a web port
        let flow = make_flow(443, 5_000_000, 0, 5_000);
        let result = detect(&flow);
        assert!(!result.detected);
        assert!((result.confidence - 0.4).abs() < 1e-9);
    }
}
