//! Flow tracker
//!
//! Get-or-create plus packet append happen under one lock, so two packets of
//! the same new flow can never race into two entries. Inactive flows move to
//! a bounded completed ring and emit exactly one completion event.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::FlowConfig;
use crate::core::packet::FlowKey;
use crate::events::MonitorEvent;

use super::{Flow, FlowStatistics};

/// Flow tracking engine
pub struct FlowTracker {
    config: FlowConfig,
    active: HashMap<FlowKey, Flow>,
    completed: VecDeque<Flow>,
    event_tx: Option<mpsc::Sender<MonitorEvent>>,
}

impl FlowTracker {
    pub fn new(config: FlowConfig) -> Self {
        info!(
            "Initializing flow tracker (timeout={}s, completed_capacity={})",
            config.inactivity_timeout_secs, config.completed_capacity
        );
        Self {
            active: HashMap::new(),
            completed: VecDeque::with_capacity(config.completed_capacity),
            config,
            event_tx: None,
        }
    }

    /// Attach the event channel used for flow completion events
    pub fn with_events(mut self, tx: mpsc::Sender<MonitorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Record an outbound packet, creating the flow if needed.
    /// Returns the flow's packet count after the append.
    pub fn process(&mut self, key: FlowKey, timestamp: i64, size: u32) -> u64 {
        let history_limit = self.config.history_limit;
        let flow = self
            .active
            .entry(key)
            .or_insert_with(|| Flow::new(key, timestamp, history_limit));
        flow.add_packet(timestamp, size, true);
        flow.packet_count
    }

    /// Record bytes flowing back toward the device on an existing flow
    pub fn record_inbound(&mut self, key: &FlowKey, timestamp: i64, size: u32) {
        if let Some(flow) = self.active.get_mut(key) {
            flow.bytes_received += size as u64;
            if timestamp > flow.end_time {
                flow.end_time = timestamp;
            }
        }
    }

    /// Append a captured DNS query name to a flow
    pub fn add_dns_query(&mut self, key: &FlowKey, name: &str) {
        if let Some(flow) = self.active.get_mut(key) {
            flow.dns_queries.push(name.to_string());
        }
    }

    /// Set the resolved domain on a flow
    pub fn set_domain(&mut self, key: &FlowKey, domain: &str) {
        if let Some(flow) = self.active.get_mut(key) {
            flow.domain = Some(domain.to_string());
        }
    }

    /// Back-fill the domain on every active flow headed to `ip` that has none
    pub fn set_domain_for_dst_ip(&mut self, ip: IpAddr, domain: &str) {
        for flow in self.active.values_mut() {
            if flow.key.dst_ip == ip && flow.domain.is_none() {
                flow.domain = Some(domain.to_string());
            }
        }
    }

    /// Clone a flow for out-of-lock analysis
    pub fn snapshot(&self, key: &FlowKey) -> Option<Flow> {
        self.active.get(key).cloned()
    }

    /// Destination ports attempted toward one host, with first-seen times.
    /// Covers live and recently completed flows.
    pub fn port_attempts(&self, dst_ip: IpAddr) -> Vec<(u16, i64)> {
        self.active
            .values()
            .chain(self.completed.iter())
            .filter(|flow| flow.key.dst_ip == dst_ip)
            .map(|flow| (flow.key.dst_port, flow.start_time))
            .collect()
    }

    /// Move flows idle past the inactivity timeout into the completed ring.
    /// Emits one completion event per flow. Returns how many were swept.
    pub fn sweep_inactive(&mut self, now: i64) -> usize {
        let timeout_ms = self.config.inactivity_timeout_secs as i64 * 1000;
        let expired: Vec<FlowKey> = self
            .active
            .iter()
            .filter(|(_, flow)| !flow.is_active(now, timeout_ms))
            .map(|(key, _)| *key)
            .collect();

        let count = expired.len();
        for key in expired {
            if let Some(flow) = self.active.remove(&key) {
                if let Some(tx) = &self.event_tx {
                    let _ = tx.try_send(MonitorEvent::FlowCompleted(flow.summary()));
                }
                if self.completed.len() >= self.config.completed_capacity {
                    self.completed.pop_front();
                }
                self.completed.push_back(flow);
            }
        }

        if count > 0 {
            debug!("Swept {} inactive flows", count);
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Aggregate statistics across live and completed flows
    pub fn statistics(&self) -> FlowStatistics {
        let all = self.active.values().chain(self.completed.iter());
        let mut total = 0usize;
        let mut packets = 0u64;
        let mut bytes = 0u64;
        let mut duration_sum = 0i64;

        for flow in all {
            total += 1;
            packets += flow.packet_count;
            bytes += flow.bytes_sent + flow.bytes_received;
            duration_sum += flow.duration_ms();
        }

        FlowStatistics {
            total_flows: total,
            active_flows: self.active.len(),
            completed_flows: self.completed.len(),
            total_packets: packets,
            total_bytes: bytes,
            average_flow_duration_ms: if total > 0 {
                duration_sum / total as i64
            } else {
                0
            },
            average_packets_per_flow: if total > 0 { packets / total as u64 } else { 0 },
        }
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.completed.clear();
    }
}

/// Thread-safe flow tracker handle shared between the capture loop, the
/// sweeper and the analysis tasks
#[derive(Clone)]
pub struct SharedFlowTracker {
    inner: Arc<Mutex<FlowTracker>>,
}

impl SharedFlowTracker {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FlowTracker::new(config))),
        }
    }

    pub fn with_events(config: FlowConfig, tx: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FlowTracker::new(config).with_events(tx))),
        }
    }

    pub fn process(&self, key: FlowKey, timestamp: i64, size: u32) -> u64 {
        self.inner.lock().process(key, timestamp, size)
    }

    pub fn record_inbound(&self, key: &FlowKey, timestamp: i64, size: u32) {
        self.inner.lock().record_inbound(key, timestamp, size)
    }

    pub fn add_dns_query(&self, key: &FlowKey, name: &str) {
        self.inner.lock().add_dns_query(key, name)
    }

    pub fn set_domain(&self, key: &FlowKey, domain: &str) {
        self.inner.lock().set_domain(key, domain)
    }

    pub fn set_domain_for_dst_ip(&self, ip: IpAddr, domain: &str) {
        self.inner.lock().set_domain_for_dst_ip(ip, domain)
    }

    pub fn snapshot(&self, key: &FlowKey) -> Option<Flow> {
        self.inner.lock().snapshot(key)
    }

    pub fn port_attempts(&self, dst_ip: IpAddr) -> Vec<(u16, i64)> {
        self.inner.lock().port_attempts(dst_ip)
    }

    pub fn sweep_inactive(&self, now: i64) -> usize {
        self.inner.lock().sweep_inactive(now)
    }

    pub fn statistics(&self) -> FlowStatistics {
        self.inner.lock().statistics()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active_count()
    }
}
