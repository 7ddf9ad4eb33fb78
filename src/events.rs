//! Events emitted by the monitor
//!
//! Flow completion, session lifecycle, connection records and alerts are all
//! published over one mpsc channel. Consumers (persistence, notification UIs)
//! subscribe to the receiver and process events fire-and-forget; a slow or
//! absent consumer never stalls the capture path.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::core::packet::IpProtocol;
use crate::detect::ThreatLevel;
use crate::flow::FlowSummary;

/// Events published by the capture/analysis pipeline
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A flow went inactive and was moved to the completed ring
    FlowCompleted(FlowSummary),
    /// A forwarding session was opened
    SessionOpened(SessionRecord),
    /// A forwarding session was closed (idle timeout, FIN/RST or error)
    SessionClosed(SessionRecord),
    /// A new connection was observed
    Connection(ConnectionRecord),
    /// A threat alert fired
    Alert(AlertRecord),
}

/// Snapshot of a forwarding session at open/close time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: IpProtocol,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub domain: Option<String>,
    /// Millisecond epoch
    pub timestamp: i64,
}

/// Record of a newly observed connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: IpProtocol,
    pub domain: Option<String>,
    pub first_seen: i64,
    pub threat_score: u8,
}

/// A threat alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub level: ThreatLevel,
    pub title: String,
    pub message: String,
    pub ip: IpAddr,
    pub score: u8,
    pub timestamp: i64,
}

impl AlertRecord {
    /// Alert title for a threat level
    pub fn title_for(level: ThreatLevel) -> &'static str {
        match level {
            ThreatLevel::Critical => "Critical threat detected",
            ThreatLevel::High => "High risk connection",
            ThreatLevel::Medium => "Suspicious activity",
            ThreatLevel::Low => "Low risk detected",
            _ => "Unknown threat",
        }
    }
}
