//! Capture and session-forwarding bridge
//!
//! Owns the main loop: read a frame from the device, account it to a flow,
//! dissect DNS and TLS payloads for domain metadata, forward it through a
//! real socket, and kick off threat analysis on a budget. A sweeper task
//! retires idle flows and sessions; a single writer task drains response
//! frames back to the device.

pub mod device;
pub mod forwarder;
pub mod session;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::core::packet::{FlowKey, Packet};
use crate::detect::{ConnectionInfo, DetectionEngine, FlowContext};
use crate::dissect::{dns, tls};
use crate::error::{MonitorError, Result};
use crate::events::{ConnectionRecord, MonitorEvent};
use crate::flow::SharedFlowTracker;
use crate::heuristics::PortAttempt;

pub use device::{ChannelDevice, TunDevice};
pub use session::SessionTable;

const DNS_PORT: u16 = 53;
const TLS_PORT: u16 = 443;

/// The traffic monitor: capture loop plus its supporting tasks
pub struct Monitor {
    config: Config,
    device: Arc<dyn TunDevice>,
    tracker: SharedFlowTracker,
    sessions: Arc<SessionTable>,
    engine: Arc<DetectionEngine>,
    /// Resolved-address cache, IP to domain
    dns_cache: Arc<Mutex<HashMap<IpAddr, String>>>,
    /// Addresses each domain has resolved to, for fast-flux analysis
    resolution_history: Arc<Mutex<HashMap<String, Vec<IpAddr>>>>,
    /// Last analysis timestamp per flow
    last_analysis: Arc<Mutex<HashMap<FlowKey, i64>>>,
    event_tx: Option<mpsc::Sender<MonitorEvent>>,
    frame_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl Monitor {
    pub fn new(config: Config, device: Arc<dyn TunDevice>, engine: Arc<DetectionEngine>) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(256);
        let tracker = SharedFlowTracker::new(config.flow.clone());
        let dns_cache = Arc::new(Mutex::new(HashMap::new()));
        let sessions = Arc::new(
            SessionTable::new(config.session.clone(), frame_tx)
                .with_domains(Arc::clone(&dns_cache)),
        );
        Self {
            config,
            device,
            tracker,
            sessions,
            engine,
            dns_cache,
            resolution_history: Arc::new(Mutex::new(HashMap::new())),
            last_analysis: Arc::new(Mutex::new(HashMap::new())),
            event_tx: None,
            frame_rx: Some(frame_rx),
        }
    }

    /// Attach the event channel for connection, session and flow events
    pub fn with_events(mut self, tx: mpsc::Sender<MonitorEvent>) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(256);
        self.tracker = SharedFlowTracker::with_events(self.config.flow.clone(), tx.clone());
        self.sessions = Arc::new(
            SessionTable::new(self.config.session.clone(), frame_tx)
                .with_events(tx.clone())
                .with_domains(Arc::clone(&self.dns_cache)),
        );
        self.frame_rx = Some(frame_rx);
        self.event_tx = Some(tx);
        self
    }

    pub fn tracker(&self) -> &SharedFlowTracker {
        &self.tracker
    }

    /// Run the capture loop until shutdown is signalled or the device closes
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let frame_rx = self
            .frame_rx
            .take()
            .ok_or_else(|| MonitorError::Setup("monitor already running".to_string()))?;

        let writer = tokio::spawn(forwarder::run_writer(
            Arc::clone(&self.device),
            frame_rx,
            self.tracker.clone(),
        ));
        let sweeper = self.spawn_sweeper();

        info!("Monitor started (mtu={})", self.config.capture.mtu);
        let mut buf = vec![0u8; self.config.capture.mtu];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown requested");
                    break;
                }
                result = self.device.read_frame(&mut buf) => {
                    match result {
                        Ok(0) => {
                            info!("Device closed");
                            break;
                        }
                        Ok(n) => self.handle_frame(&buf[..n]).await,
                        Err(e) => {
                            warn!("Device read error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        sweeper.abort();
        writer.abort();
        self.sessions.close_all().await;
        info!("Monitor stopped");
        Ok(())
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let packet = match Packet::parse(frame) {
            Some(packet) => packet,
            None => {
                trace!("Unparseable frame of {} bytes", frame.len());
                return;
            }
        };

        // traffic to or from the host itself is not interesting
        if packet.src_ip.is_loopback() || packet.dst_ip.is_loopback() {
            return;
        }

        let key = packet.flow_key();
        let now = Utc::now().timestamp_millis();
        let packet_count = self.tracker.process(key, now, packet.total_len as u32);

        if packet_count == 1 {
            if let Some(domain) = self.dns_cache.lock().get(&key.dst_ip).cloned() {
                self.tracker.set_domain(&key, &domain);
            }
            self.emit_connection(&key, now);
        }

        if packet.is_udp() && (packet.dst_port == DNS_PORT || packet.src_port == DNS_PORT) {
            self.handle_dns(&packet, &key);
        }

        if packet.is_tcp() && packet.dst_port == TLS_PORT && packet.payload_len > 0 {
            self.handle_tls(&packet, &key);
        }

        if let Err(e) = self.sessions.process_packet(&packet).await {
            debug!("Forwarding error for {}: {}", key, e);
        }

        if self.should_analyze(&key, packet_count, now) {
            self.spawn_analysis(key, packet_count == 1);
        }
    }

    /// Learn domains from DNS traffic. Queries are recorded on the flow for
    /// the tunneling heuristic; answers feed the IP-to-domain cache and
    /// back-fill any flow already headed to the answered address.
    fn handle_dns(&self, packet: &Packet<'_>, key: &FlowKey) {
        let message = match dns::parse(packet.payload()) {
            Some(message) => message,
            None => return,
        };

        if message.is_query {
            for name in message.query_names() {
                debug!("DNS query: {}", name);
                self.tracker.add_dns_query(key, name);
            }
            return;
        }

        let domain = match message.questions.first() {
            Some(question) if !question.name.is_empty() => question.name.clone(),
            _ => return,
        };
        for answer in &message.answers {
            if answer.rtype != dns::TYPE_A && answer.rtype != dns::TYPE_AAAA {
                continue;
            }
            if let Ok(ip) = answer.data.parse::<IpAddr>() {
                debug!("DNS: {} -> {}", domain, ip);
                self.dns_cache.lock().insert(ip, domain.clone());
                self.resolution_history
                    .lock()
                    .entry(domain.clone())
                    .or_default()
                    .push(ip);
                self.tracker.set_domain_for_dst_ip(ip, &domain);
            }
        }
    }

    fn handle_tls(&self, packet: &Packet<'_>, key: &FlowKey) {
        if let Some(sni) = tls::extract_sni(packet.payload()) {
            debug!("TLS SNI: {} ({})", sni, key.dst_ip);
            self.dns_cache.lock().insert(key.dst_ip, sni.clone());
            self.tracker.set_domain(key, &sni);
        }
    }

    /// Analysis runs on the first packet, then every N packets or T seconds,
    /// whichever comes first
    fn should_analyze(&self, key: &FlowKey, packet_count: u64, now: i64) -> bool {
        if packet_count == 1 {
            self.last_analysis.lock().insert(*key, now);
            return true;
        }
        let packet_due = packet_count % self.config.capture.analysis_packet_interval as u64 == 0;
        let time_due = {
            let last = self.last_analysis.lock();
            last.get(key)
                .map(|t| now - t >= self.config.capture.analysis_time_interval_secs as i64 * 1000)
                .unwrap_or(true)
        };
        if packet_due || time_due {
            self.last_analysis.lock().insert(*key, now);
            true
        } else {
            false
        }
    }

    fn spawn_analysis(&self, key: FlowKey, first_packet: bool) {
        let engine = Arc::clone(&self.engine);
        let tracker = self.tracker.clone();
        let history = Arc::clone(&self.resolution_history);

        tokio::spawn(async move {
            let flow = match tracker.snapshot(&key) {
                Some(flow) => flow,
                None => return,
            };

            if first_packet {
                let info = ConnectionInfo {
                    dst_ip: key.dst_ip,
                    dst_port: key.dst_port,
                    protocol: key.protocol.number(),
                    domain: flow.domain.clone(),
                };
                let analysis = engine.analyze_connection(&info).await;
                debug!(
                    "Connection {} scored {} ({})",
                    key, analysis.score, analysis.level
                );
            } else {
                let ip_history = flow
                    .domain
                    .as_deref()
                    .and_then(|d| history.lock().get(d).cloned())
                    .unwrap_or_default();
                let port_attempts = tracker
                    .port_attempts(key.dst_ip)
                    .into_iter()
                    .map(|(port, timestamp)| PortAttempt { port, timestamp })
                    .collect();
                let context = FlowContext {
                    ip_history,
                    port_attempts,
                };
                let result = engine.analyze_flow(&flow, &context).await;
                debug!(
                    "Flow {} scored {} ({})",
                    key, result.analysis.score, result.analysis.level
                );
            }
        });
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let tracker = self.tracker.clone();
        let sessions = Arc::clone(&self.sessions);
        let interval = Duration::from_secs(self.config.session.sweep_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let now = Utc::now().timestamp_millis();
                tracker.sweep_inactive(now);
                sessions.sweep_idle(now).await;
            }
        })
    }

    fn emit_connection(&self, key: &FlowKey, now: i64) {
        if let Some(ref tx) = self.event_tx {
            let record = ConnectionRecord {
                src_ip: key.src_ip,
                src_port: key.src_port,
                dst_ip: key.dst_ip,
                dst_port: key.dst_port,
                protocol: key.protocol,
                domain: self.dns_cache.lock().get(&key.dst_ip).cloned(),
                first_seen: now,
                threat_score: 0,
            };
            let _ = tx.try_send(MonitorEvent::Connection(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::{IocMatcher, ListStore, ReputationService, StaticProvider};
    use std::net::Ipv4Addr;

    fn make_engine() -> Arc<DetectionEngine> {
        let config = Config::default();
        let reputation = Arc::new(ReputationService::new(
            Arc::new(StaticProvider::empty()),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        ));
        Arc::new(DetectionEngine::new(
            config.detection,
            Arc::new(IocMatcher::new()),
            Arc::new(ListStore::new()),
            reputation,
        ))
    }

    fn make_monitor() -> (Monitor, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (device, in_tx, out_rx) = ChannelDevice::new(32);
        let monitor = Monitor::new(Config::default(), Arc::new(device), make_engine());
        (monitor, in_tx, out_rx)
    }

    fn make_udp_frame(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let total = 28 + payload.len();
        let mut frame = vec![0u8; 28];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        frame[8] = 64;
        frame[9] = 17;
        frame[12..16].copy_from_slice(&src.octets());
        frame[16..20].copy_from_slice(&dst.octets());
        frame[20..22].copy_from_slice(&src_port.to_be_bytes());
        frame[22..24].copy_from_slice(&dst_port.to_be_bytes());
        frame[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// DNS response: example.com A 10.99.0.5
    fn dns_response_payload() -> Vec<u8> {
        let mut p = vec![
            0x12, 0x34, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        p.extend_from_slice(b"\x07example\x03com\x00");
        p.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        // answer with a name pointer to offset 12
        p.extend_from_slice(&[0xc0, 0x0c]);
        p.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        p.extend_from_slice(&[0x00, 0x00, 0x0e, 0x10]); // TTL
        p.extend_from_slice(&[0x00, 0x04, 10, 99, 0, 5]);
        p
    }

    #[tokio::test]
    async fn test_loopback_frames_skipped() {
        let (monitor, _in_tx, _out_rx) = make_monitor();
        let frame = make_udp_frame(
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 1),
            5000,
            5001,
            b"x",
        );
        monitor.handle_frame(&frame).await;
        assert_eq!(monitor.tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_dns_response_populates_cache_and_backfills() {
        let (monitor, _in_tx, _out_rx) = make_monitor();
        let client = Ipv4Addr::new(10, 0, 0, 2);
        let server_ip = Ipv4Addr::new(10, 99, 0, 5);

        // flow to the soon-to-be-resolved address exists first
        let https = make_udp_frame(client, server_ip, 47000, 4000, b"hi");
        monitor.handle_frame(&https).await;

        // response arrives from the resolver
        let response = make_udp_frame(
            Ipv4Addr::new(10, 0, 0, 53),
            client,
            53,
            33000,
            &dns_response_payload(),
        );
        monitor.handle_frame(&response).await;

        assert_eq!(
            monitor
                .dns_cache
                .lock()
                .get(&IpAddr::V4(server_ip))
                .map(String::as_str),
            Some("example.com")
        );
        assert_eq!(
            monitor.resolution_history.lock().get("example.com"),
            Some(&vec![IpAddr::V4(server_ip)])
        );

        let key = FlowKey {
            src_ip: IpAddr::V4(client),
            src_port: 47000,
            dst_ip: IpAddr::V4(server_ip),
            dst_port: 4000,
            protocol: crate::core::packet::IpProtocol::Udp,
        };
        let flow = monitor.tracker.snapshot(&key).unwrap();
        assert_eq!(flow.domain.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn test_queries_recorded_on_flow() {
        let (monitor, _in_tx, _out_rx) = make_monitor();
        let client = Ipv4Addr::new(10, 0, 0, 2);
        let resolver = Ipv4Addr::new(10, 0, 0, 53);

        let mut query = vec![
            0xab, 0xcd, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        query.extend_from_slice(b"\x07example\x03com\x00");
        query.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        let frame = make_udp_frame(client, resolver, 34000, 53, &query);
        monitor.handle_frame(&frame).await;

        let key = FlowKey {
            src_ip: IpAddr::V4(client),
            src_port: 34000,
            dst_ip: IpAddr::V4(resolver),
            dst_port: 53,
            protocol: crate::core::packet::IpProtocol::Udp,
        };
        let flow = monitor.tracker.snapshot(&key).unwrap();
        assert_eq!(flow.dns_queries, vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (mut monitor, _in_tx, _out_rx) = make_monitor();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { monitor.run(shutdown_rx).await });
        shutdown_tx.send(()).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor should stop")
            .expect("task should not panic");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_stops_when_device_closes() {
        let (mut monitor, in_tx, _out_rx) = make_monitor();
        let (_shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move { monitor.run(shutdown_rx).await });
        drop(in_tx);
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor should stop")
            .expect("task should not panic");
        assert!(result.is_ok());
    }
}
