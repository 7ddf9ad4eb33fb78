//! Flow aggregation
//!
//! Packets are aggregated into directional flows keyed by the 5-tuple. Flows
//! carry the per-packet history the heuristics need (timestamps, sizes, DNS
//! query names) plus the resolved domain when DNS or SNI gave one up.

pub mod tracker;

pub use tracker::{FlowTracker, SharedFlowTracker};

use serde::{Deserialize, Serialize};

use crate::core::packet::FlowKey;

/// One directional flow
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: FlowKey,
    /// Millisecond epoch of the first packet
    pub start_time: i64,
    /// Millisecond epoch of the most recent packet; never decreases
    pub end_time: i64,
    pub packet_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Outbound packet timestamps, capped at the history limit
    pub packet_timestamps: Vec<i64>,
    /// Outbound packet sizes, capped at the history limit
    pub packet_sizes: Vec<u32>,
    /// DNS query names captured on this flow
    pub dns_queries: Vec<String>,
    /// Resolved domain (DNS answer cache or TLS SNI)
    pub domain: Option<String>,
    history_limit: usize,
}

impl Flow {
    pub fn new(key: FlowKey, timestamp: i64, history_limit: usize) -> Self {
        Self {
            key,
            start_time: timestamp,
            end_time: timestamp,
            packet_count: 0,
            bytes_sent: 0,
            bytes_received: 0,
            packet_timestamps: Vec::new(),
            packet_sizes: Vec::new(),
            dns_queries: Vec::new(),
            domain: None,
            history_limit,
        }
    }

    /// Record a packet. History stops growing at the cap but the counters and
    /// the end timestamp keep advancing.
    pub fn add_packet(&mut self, timestamp: i64, size: u32, outgoing: bool) {
        self.packet_count += 1;
        if self.packet_timestamps.len() < self.history_limit {
            self.packet_timestamps.push(timestamp);
            self.packet_sizes.push(size);
        }
        if timestamp > self.end_time {
            self.end_time = timestamp;
        }

        if outgoing {
            self.bytes_sent += size as u64;
        } else {
            self.bytes_received += size as u64;
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_time - self.start_time
    }

    pub fn average_packet_size(&self) -> f64 {
        if self.packet_count > 0 {
            self.bytes_sent as f64 / self.packet_count as f64
        } else {
            0.0
        }
    }

    pub fn packets_per_second(&self) -> f64 {
        let duration_secs = self.duration_ms() as f64 / 1000.0;
        if duration_secs > 0.0 {
            self.packet_count as f64 / duration_secs
        } else {
            0.0
        }
    }

    pub fn bytes_per_second(&self) -> f64 {
        let duration_secs = self.duration_ms() as f64 / 1000.0;
        if duration_secs > 0.0 {
            self.bytes_sent as f64 / duration_secs
        } else {
            0.0
        }
    }

    pub fn is_active(&self, now: i64, timeout_ms: i64) -> bool {
        now - self.end_time < timeout_ms
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            key: self.key,
            start_time: self.start_time,
            end_time: self.end_time,
            packet_count: self.packet_count,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            domain: self.domain.clone(),
        }
    }
}

/// Serializable flow snapshot for events and export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub key: FlowKey,
    pub start_time: i64,
    pub end_time: i64,
    pub packet_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub domain: Option<String>,
}

/// Aggregate statistics over live and completed flows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowStatistics {
    pub total_flows: usize,
    pub active_flows: usize,
    pub completed_flows: usize,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub average_flow_duration_ms: i64,
    pub average_packets_per_flow: u64,
}
