//! Response frame reconstruction and the device writer loop
//!
//! Data read back from a forwarding socket has to be re-wrapped in an IP
//! frame before it can go to the device. Headers are minimal: checksums are
//! left at zero for the device layer to fill, TCP sequence numbers are not
//! tracked. IPv4 only; sessions to IPv6 destinations produce no frame.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bridge::device::TunDevice;
use crate::core::packet::{FlowKey, IpProtocol, Packet};
use crate::flow::SharedFlowTracker;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Build the inbound frame for payload arriving on a session's socket.
/// The flow key is the outbound direction, so source and destination swap.
pub fn build_response_frame(key: &FlowKey, payload: &[u8]) -> Option<Vec<u8>> {
    let (src, dst) = match (key.dst_ip, key.src_ip) {
        (IpAddr::V4(remote), IpAddr::V4(local)) => (remote, local),
        _ => return None,
    };

    let transport_len = match key.protocol {
        IpProtocol::Tcp => TCP_HEADER_LEN,
        IpProtocol::Udp => UDP_HEADER_LEN,
        IpProtocol::Icmp => return None,
    };
    let total_len = IPV4_HEADER_LEN + transport_len + payload.len();
    if total_len > u16::MAX as usize {
        return None;
    }

    let mut frame = Vec::with_capacity(total_len);
    frame.push(0x45); // version 4, IHL 5
    frame.push(0); // TOS
    frame.extend_from_slice(&(total_len as u16).to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // identification
    frame.extend_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    frame.push(64); // TTL
    frame.push(key.protocol.number());
    frame.extend_from_slice(&0u16.to_be_bytes()); // header checksum
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&dst.octets());

    match key.protocol {
        IpProtocol::Tcp => {
            frame.extend_from_slice(&key.dst_port.to_be_bytes());
            frame.extend_from_slice(&key.src_port.to_be_bytes());
            frame.extend_from_slice(&0u32.to_be_bytes()); // sequence
            frame.extend_from_slice(&0u32.to_be_bytes()); // ack number
            frame.extend_from_slice(&0x5010u16.to_be_bytes()); // data offset 5, ACK
            frame.extend_from_slice(&65535u16.to_be_bytes()); // window
            frame.extend_from_slice(&0u16.to_be_bytes()); // checksum
            frame.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
        }
        IpProtocol::Udp => {
            frame.extend_from_slice(&key.dst_port.to_be_bytes());
            frame.extend_from_slice(&key.src_port.to_be_bytes());
            frame.extend_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
            frame.extend_from_slice(&0u16.to_be_bytes()); // checksum
        }
        IpProtocol::Icmp => unreachable!(),
    }

    frame.extend_from_slice(payload);
    Some(frame)
}

/// Drain response frames onto the device. One writer task serializes all
/// session readers so frame writes never interleave. Each frame is also
/// accounted as inbound bytes on its outbound flow.
pub async fn run_writer(
    device: Arc<dyn TunDevice>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    tracker: SharedFlowTracker,
) {
    while let Some(frame) = rx.recv().await {
        account_inbound(&tracker, &frame);
        if let Err(e) = device.write_frame(&frame).await {
            warn!("Failed to write frame to device: {}", e);
        }
    }
    debug!("Device writer loop finished");
}

/// Response frames run remote-to-local, so the owning flow is the reverse key
fn account_inbound(tracker: &SharedFlowTracker, frame: &[u8]) {
    if let Some(packet) = Packet::parse(frame) {
        let key = FlowKey {
            src_ip: packet.dst_ip,
            src_port: packet.dst_port,
            dst_ip: packet.src_ip,
            dst_port: packet.src_port,
            protocol: packet.protocol,
        };
        tracker.record_inbound(&key, Utc::now().timestamp_millis(), packet.total_len as u32);
    }
}
