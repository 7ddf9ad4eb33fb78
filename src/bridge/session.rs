//! Forwarding sessions
//!
//! Each flow the device originates gets a real socket toward the remote
//! host. A per-session reader task pumps responses into the shared frame
//! channel; the table tracks liveness and reaps idle or half-closed
//! sessions on a timer.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::forwarder::build_response_frame;
use crate::config::SessionConfig;
use crate::core::packet::{FlowKey, IpProtocol, Packet};
use crate::error::{MonitorError, Result};
use crate::events::{MonitorEvent, SessionRecord};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER: usize = 65535;

/// Counters shared between a session and its reader task
struct SessionStats {
    last_activity: AtomicI64,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    /// Reader saw EOF or a socket error; reaped on the next sweep
    closed: AtomicBool,
}

impl SessionStats {
    fn new(now: i64) -> Self {
        Self {
            last_activity: AtomicI64::new(now),
            bytes_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn touch(&self, now: i64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }
}

/// Protocol-specific half of a session
enum SessionTransport {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

struct Session {
    key: FlowKey,
    stats: Arc<SessionStats>,
    transport: SessionTransport,
    reader: JoinHandle<()>,
    /// Resolved destination domain, looked up once at open time
    domain: Option<String>,
}

impl Session {
    fn record(&self) -> SessionRecord {
        SessionRecord {
            src_ip: self.key.src_ip,
            src_port: self.key.src_port,
            dst_ip: self.key.dst_ip,
            dst_port: self.key.dst_port,
            protocol: self.key.protocol,
            bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            domain: self.domain.clone(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn close(self) {
        self.reader.abort();
    }
}

/// Table of live forwarding sessions
pub struct SessionTable {
    config: SessionConfig,
    sessions: Mutex<HashMap<FlowKey, Session>>,
    /// Response frames headed back to the device
    frame_tx: mpsc::Sender<Vec<u8>>,
    event_tx: Option<mpsc::Sender<MonitorEvent>>,
    /// IP-to-domain cache shared with the capture loop
    domains: Option<Arc<SyncMutex<HashMap<IpAddr, String>>>>,
}

impl SessionTable {
    pub fn new(config: SessionConfig, frame_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            frame_tx,
            event_tx: None,
            domains: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<MonitorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Attach the resolved-address cache so session records carry the domain
    pub fn with_domains(mut self, domains: Arc<SyncMutex<HashMap<IpAddr, String>>>) -> Self {
        self.domains = Some(domains);
        self
    }

    /// Forward one outbound packet, creating the session when the protocol's
    /// opening condition is met (TCP SYN, first UDP packet).
    pub async fn process_packet(&self, packet: &Packet<'_>) -> Result<()> {
        match packet.protocol {
            IpProtocol::Tcp => self.process_tcp(packet).await,
            IpProtocol::Udp => self.process_udp(packet).await,
            IpProtocol::Icmp => Ok(()),
        }
    }

    async fn process_tcp(&self, packet: &Packet<'_>) -> Result<()> {
        let key = packet.flow_key();
        let mut sessions = self.sessions.lock().await;

        if packet.tcp_flags.is_syn_only() && !sessions.contains_key(&key) {
            match self.open_tcp(key).await {
                Ok(session) => {
                    debug!("New TCP session: {}", key);
                    self.emit(MonitorEvent::SessionOpened(session.record()));
                    sessions.insert(key, session);
                }
                Err(e) => warn!("Failed to open TCP session {}: {}", key, e),
            }
            return Ok(());
        }

        if packet.tcp_flags.fin || packet.tcp_flags.rst {
            if let Some(session) = sessions.remove(&key) {
                debug!("TCP session closed: {}", key);
                self.emit(MonitorEvent::SessionClosed(session.record()));
                session.close();
            }
            return Ok(());
        }

        let mut write_err = None;
        if let Some(session) = sessions.get_mut(&key) {
            let payload = packet.payload();
            if !payload.is_empty() {
                if let SessionTransport::Tcp(ref mut writer) = session.transport {
                    match writer.write_all(payload).await {
                        Ok(()) => {
                            session
                                .stats
                                .bytes_out
                                .fetch_add(payload.len() as u64, Ordering::Relaxed);
                            session.stats.touch(Utc::now().timestamp_millis());
                        }
                        Err(e) => write_err = Some(e),
                    }
                }
            }
        }

        if let Some(e) = write_err {
            // a dead socket never recovers; evict so the next SYN reopens
            self.evict(&mut sessions, &key);
            return Err(MonitorError::Forwarding(format!(
                "TCP write to {}: {}",
                key, e
            )));
        }
        Ok(())
    }

    async fn process_udp(&self, packet: &Packet<'_>) -> Result<()> {
        let key = packet.flow_key();
        let mut sessions = self.sessions.lock().await;

        if !sessions.contains_key(&key) {
            match self.open_udp(key).await {
                Ok(session) => {
                    debug!("New UDP session: {}", key);
                    self.emit(MonitorEvent::SessionOpened(session.record()));
                    sessions.insert(key, session);
                }
                Err(e) => {
                    warn!("Failed to open UDP session {}: {}", key, e);
                    return Ok(());
                }
            }
        }

        let mut send_err = None;
        if let Some(session) = sessions.get_mut(&key) {
            let payload = packet.payload();
            if !payload.is_empty() {
                if let SessionTransport::Udp(ref socket) = session.transport {
                    match socket.send(payload).await {
                        Ok(_) => {
                            session
                                .stats
                                .bytes_out
                                .fetch_add(payload.len() as u64, Ordering::Relaxed);
                            session.stats.touch(Utc::now().timestamp_millis());
                        }
                        Err(e) => send_err = Some(e),
                    }
                }
            }
        }

        if let Some(e) = send_err {
            self.evict(&mut sessions, &key);
            return Err(MonitorError::Forwarding(format!(
                "UDP send to {}: {}",
                key, e
            )));
        }
        Ok(())
    }

    /// Remove a session whose socket failed, with the table lock held
    fn evict(&self, sessions: &mut HashMap<FlowKey, Session>, key: &FlowKey) {
        if let Some(session) = sessions.remove(key) {
            debug!("Evicting failed session: {}", key);
            self.emit(MonitorEvent::SessionClosed(session.record()));
            session.close();
        }
    }

    async fn open_tcp(&self, key: FlowKey) -> Result<Session> {
        let remote = SocketAddr::new(key.dst_ip, key.dst_port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(remote))
            .await
            .map_err(|_| MonitorError::Forwarding(format!("connect to {} timed out", remote)))?
            .map_err(|e| MonitorError::Forwarding(format!("connect to {}: {}", remote, e)))?;

        let (mut read_half, write_half) = stream.into_split();
        let now = Utc::now().timestamp_millis();
        let stats = Arc::new(SessionStats::new(now));

        let reader_stats = Arc::clone(&stats);
        let frame_tx = self.frame_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        reader_stats
                            .bytes_in
                            .fetch_add(n as u64, Ordering::Relaxed);
                        reader_stats.touch(Utc::now().timestamp_millis());
                        if let Some(frame) = build_response_frame(&key, &buf[..n]) {
                            if frame_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("TCP read error on {}: {}", key, e);
                        break;
                    }
                }
            }
            reader_stats.closed.store(true, Ordering::Relaxed);
        });

        Ok(Session {
            key,
            stats,
            transport: SessionTransport::Tcp(write_half),
            reader,
            domain: self.domain_for(&key.dst_ip),
        })
    }

    async fn open_udp(&self, key: FlowKey) -> Result<Session> {
        let bind_addr: SocketAddr = if key.dst_ip.is_ipv4() {
            SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| MonitorError::Forwarding(format!("UDP bind: {}", e)))?;
        socket
            .connect(SocketAddr::new(key.dst_ip, key.dst_port))
            .await
            .map_err(|e| MonitorError::Forwarding(format!("UDP connect {}: {}", key, e)))?;
        let socket = Arc::new(socket);

        let now = Utc::now().timestamp_millis();
        let stats = Arc::new(SessionStats::new(now));

        let reader_socket = Arc::clone(&socket);
        let reader_stats = Arc::clone(&stats);
        let frame_tx = self.frame_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER];
            loop {
                match reader_socket.recv(&mut buf).await {
                    Ok(n) if n > 0 => {
                        reader_stats
                            .bytes_in
                            .fetch_add(n as u64, Ordering::Relaxed);
                        reader_stats.touch(Utc::now().timestamp_millis());
                        if let Some(frame) = build_response_frame(&key, &buf[..n]) {
                            if frame_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("UDP recv error on {}: {}", key, e);
                        break;
                    }
                }
            }
            reader_stats.closed.store(true, Ordering::Relaxed);
        });

        Ok(Session {
            key,
            stats,
            transport: SessionTransport::Udp(socket),
            reader,
            domain: self.domain_for(&key.dst_ip),
        })
    }

    /// Reap sessions idle past their protocol timeout or whose reader has
    /// already seen the socket close
    pub async fn sweep_idle(&self, now: i64) -> usize {
        let tcp_timeout = self.config.tcp_timeout_secs as i64 * 1000;
        let udp_timeout = self.config.udp_timeout_secs as i64 * 1000;

        let mut sessions = self.sessions.lock().await;
        let stale: Vec<FlowKey> = sessions
            .iter()
            .filter(|(key, session)| {
                let timeout = match key.protocol {
                    IpProtocol::Tcp => tcp_timeout,
                    _ => udp_timeout,
                };
                session.stats.closed.load(Ordering::Relaxed)
                    || now - session.stats.last_activity.load(Ordering::Relaxed) > timeout
            })
            .map(|(key, _)| *key)
            .collect();

        let count = stale.len();
        for key in stale {
            if let Some(session) = sessions.remove(&key) {
                self.emit(MonitorEvent::SessionClosed(session.record()));
                session.close();
            }
        }
        if count > 0 {
            debug!("Reaped {} stale sessions", count);
        }
        count
    }

    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            self.emit(MonitorEvent::SessionClosed(session.record()));
            session.close();
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn emit(&self, event: MonitorEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.try_send(event);
        }
    }

    fn domain_for(&self, ip: &IpAddr) -> Option<String> {
        self.domains.as_ref().and_then(|d| d.lock().get(ip).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn make_tcp_frame(
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let total = 40 + payload.len();
        let mut frame = vec![0u8; 40];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        frame[8] = 64;
        frame[9] = 6;
        frame[12..16].copy_from_slice(&[10, 0, 0, 2]);
        frame[16..20].copy_from_slice(&dst.octets());
        frame[20..22].copy_from_slice(&src_port.to_be_bytes());
        frame[22..24].copy_from_slice(&dst_port.to_be_bytes());
        frame[32] = 0x50; // data offset 5
        frame[33] = flags;
        frame.extend_from_slice(payload);
        frame
    }

    fn make_udp_frame(dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let total = 28 + payload.len();
        let mut frame = vec![0u8; 28];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        frame[8] = 64;
        frame[9] = 17;
        frame[12..16].copy_from_slice(&[10, 0, 0, 2]);
        frame[16..20].copy_from_slice(&dst.octets());
        frame[20..22].copy_from_slice(&src_port.to_be_bytes());
        frame[22..24].copy_from_slice(&dst_port.to_be_bytes());
        frame[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn test_tcp_session_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            stream.write_all(b"pong").await.unwrap();
            // keep the connection open until the client side is done
            let _ = stream.read(&mut buf).await;
        });

        let (frame_tx, mut frame_rx) = mpsc::channel(16);
        let table = SessionTable::new(SessionConfig::default(), frame_tx);
        let dst = Ipv4Addr::new(127, 0, 0, 1);

        // SYN opens the session
        let syn = make_tcp_frame(dst, 40000, port, 0x02, b"");
        let packet = Packet::parse(&syn).unwrap();
        table.process_packet(&packet).await.unwrap();
        assert_eq!(table.session_count().await, 1);

        // payload is forwarded
        let data = make_tcp_frame(dst, 40000, port, 0x18, b"ping");
        let packet = Packet::parse(&data).unwrap();
        table.process_packet(&packet).await.unwrap();

        // response comes back as a frame with swapped endpoints
        let frame = frame_rx.recv().await.unwrap();
        let response = Packet::parse(&frame).unwrap();
        assert_eq!(response.src_port, port);
        assert_eq!(response.dst_port, 40000);
        assert_eq!(response.payload(), b"pong");

        // FIN tears it down
        let fin = make_tcp_frame(dst, 40000, port, 0x11, b"");
        let packet = Packet::parse(&fin).unwrap();
        table.process_packet(&packet).await.unwrap();
        assert_eq!(table.session_count().await, 0);

        server.abort();
    }

    #[tokio::test]
    async fn test_udp_session_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"query");
            server.send_to(b"answer", peer).await.unwrap();
        });

        let (frame_tx, mut frame_rx) = mpsc::channel(16);
        let table = SessionTable::new(SessionConfig::default(), frame_tx);
        let dst = Ipv4Addr::new(127, 0, 0, 1);

        let datagram = make_udp_frame(dst, 41000, port, b"query");
        let packet = Packet::parse(&datagram).unwrap();
        table.process_packet(&packet).await.unwrap();
        assert_eq!(table.session_count().await, 1);

        let frame = frame_rx.recv().await.unwrap();
        let response = Packet::parse(&frame).unwrap();
        assert_eq!(response.payload(), b"answer");
    }

    #[tokio::test]
    async fn test_session_events_emitted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let (frame_tx, _frame_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let table = SessionTable::new(SessionConfig::default(), frame_tx).with_events(event_tx);
        let dst = Ipv4Addr::new(127, 0, 0, 1);

        let syn = make_tcp_frame(dst, 40001, port, 0x02, b"");
        table
            .process_packet(&Packet::parse(&syn).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            event_rx.try_recv(),
            Ok(MonitorEvent::SessionOpened(_))
        ));

        let rst = make_tcp_frame(dst, 40001, port, 0x04, b"");
        table
            .process_packet(&Packet::parse(&rst).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            event_rx.try_recv(),
            Ok(MonitorEvent::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_write_error_evicts_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // linger zero turns the close into an immediate RST
            stream.set_linger(Some(Duration::from_secs(0))).unwrap();
            drop(stream);
        });

        let (frame_tx, _frame_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let table = SessionTable::new(SessionConfig::default(), frame_tx).with_events(event_tx);
        let dst = Ipv4Addr::new(127, 0, 0, 1);

        let syn = make_tcp_frame(dst, 40002, port, 0x02, b"");
        table
            .process_packet(&Packet::parse(&syn).unwrap())
            .await
            .unwrap();
        assert_eq!(table.session_count().await, 1);
        assert!(matches!(
            event_rx.try_recv(),
            Ok(MonitorEvent::SessionOpened(_))
        ));

        // keep writing until the dead socket surfaces as an error
        let data = make_tcp_frame(dst, 40002, port, 0x18, b"payload");
        let mut failed = false;
        for _ in 0..50 {
            if table
                .process_packet(&Packet::parse(&data).unwrap())
                .await
                .is_err()
            {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(failed, "write to a reset socket should fail");

        // failed session is gone, so the next SYN could re-establish it
        assert_eq!(table.session_count().await, 0);
        assert!(matches!(
            event_rx.try_recv(),
            Ok(MonitorEvent::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_session_record_carries_domain() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let dst = Ipv4Addr::new(127, 0, 0, 1);

        let domains = Arc::new(SyncMutex::new(HashMap::new()));
        domains
            .lock()
            .insert(IpAddr::V4(dst), "example.com".to_string());

        let (frame_tx, _frame_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let table = SessionTable::new(SessionConfig::default(), frame_tx)
            .with_events(event_tx)
            .with_domains(domains);

        let datagram = make_udp_frame(dst, 41002, port, b"x");
        table
            .process_packet(&Packet::parse(&datagram).unwrap())
            .await
            .unwrap();

        match event_rx.try_recv() {
            Ok(MonitorEvent::SessionOpened(record)) => {
                assert_eq!(record.domain.as_deref(), Some("example.com"));
            }
            other => panic!("expected session opened event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sweep_reaps_idle_udp() {
        let (frame_tx, _frame_rx) = mpsc::channel(16);
        let table = SessionTable::new(SessionConfig::default(), frame_tx);
        let dst = Ipv4Addr::new(127, 0, 0, 1);

        // destination is a throwaway bound socket so connect succeeds
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();

        let datagram = make_udp_frame(dst, 41001, port, b"x");
        table
            .process_packet(&Packet::parse(&datagram).unwrap())
            .await
            .unwrap();
        assert_eq!(table.session_count().await, 1);

        // far future, both timeouts exceeded
        let far_future = Utc::now().timestamp_millis() + 10_000_000;
        let reaped = table.sweep_idle(far_future).await;
        assert_eq!(reaped, 1);
        assert_eq!(table.session_count().await, 0);
    }
}
