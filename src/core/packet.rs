//! Raw IP frame parsing
//!
//! Stateless view over a single raw IP frame as read from the tunnel device
//! (no link layer). Anything malformed or unsupported parses to `None` and is
//! dropped by the capture loop; nothing here panics on hostile input.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// IP protocol numbers the monitor understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
}

impl IpProtocol {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(IpProtocol::Icmp),
            6 => Some(IpProtocol::Tcp),
            17 => Some(IpProtocol::Udp),
            _ => None,
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, IpProtocol::Tcp)
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, IpProtocol::Udp)
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
        }
    }
}

/// TCP flags (low six bits of the flag byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
        }
    }

    pub fn is_syn_only(&self) -> bool {
        self.syn && !self.ack
    }
}

/// Directional flow identity
///
/// Deliberately not normalized: the two directions of one conversation are two
/// distinct keys, matching how the capture side only ever sees outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: IpProtocol,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.protocol
        )
    }
}

/// Parsed view over a raw IP frame
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    data: &'a [u8],
    pub version: u8,
    pub protocol: IpProtocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IP header length in bytes
    pub header_len: usize,
    /// Total packet length per the IP header
    pub total_len: usize,
    pub transport_header_len: usize,
    pub payload_offset: usize,
    pub payload_len: usize,
    pub tcp_flags: TcpFlags,
}

impl<'a> Packet<'a> {
    /// Parse a raw IP frame.
    ///
    /// Returns `None` for short buffers, unsupported IP versions, unknown
    /// transport protocols and truncated transport headers.
    pub fn parse(data: &'a [u8]) -> Option<Packet<'a>> {
        if data.len() < 20 {
            return None;
        }

        let version = data[0] >> 4;
        match version {
            4 => Self::parse_v4(data),
            6 => Self::parse_v6(data),
            _ => None,
        }
    }

    fn parse_v4(data: &'a [u8]) -> Option<Packet<'a>> {
        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < 20 || data.len() < header_len {
            return None;
        }

        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let protocol = IpProtocol::from_u8(data[9])?;

        let src_ip = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
        let dst_ip = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));

        Self::parse_transport(data, 4, protocol, src_ip, dst_ip, header_len, total_len)
    }

    fn parse_v6(data: &'a [u8]) -> Option<Packet<'a>> {
        if data.len() < 40 {
            return None;
        }

        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        let protocol = IpProtocol::from_u8(data[6])?;

        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        dst.copy_from_slice(&data[24..40]);
        let src_ip = IpAddr::V6(Ipv6Addr::from(src));
        let dst_ip = IpAddr::V6(Ipv6Addr::from(dst));

        Self::parse_transport(data, 6, protocol, src_ip, dst_ip, 40, 40 + payload_len)
    }

    fn parse_transport(
        data: &'a [u8],
        version: u8,
        protocol: IpProtocol,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        header_len: usize,
        total_len: usize,
    ) -> Option<Packet<'a>> {
        let transport = &data[header_len.min(data.len())..];

        let mut src_port = 0u16;
        let mut dst_port = 0u16;
        let mut tcp_flags = TcpFlags::default();
        let transport_header_len;

        match protocol {
            IpProtocol::Tcp => {
                if transport.len() < 20 {
                    return None;
                }
                src_port = u16::from_be_bytes([transport[0], transport[1]]);
                dst_port = u16::from_be_bytes([transport[2], transport[3]]);
                let offset_and_flags = u16::from_be_bytes([transport[12], transport[13]]);
                transport_header_len = (((offset_and_flags >> 12) & 0x0f) as usize) * 4;
                tcp_flags = TcpFlags::from_u8((offset_and_flags & 0x3f) as u8);
            }
            IpProtocol::Udp => {
                if transport.len() < 8 {
                    return None;
                }
                src_port = u16::from_be_bytes([transport[0], transport[1]]);
                dst_port = u16::from_be_bytes([transport[2], transport[3]]);
                transport_header_len = 8;
            }
            IpProtocol::Icmp => {
                transport_header_len = 8;
            }
        }

        let payload_offset = header_len + transport_header_len;
        let payload_len = total_len.saturating_sub(payload_offset);

        Some(Packet {
            data,
            version,
            protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            header_len,
            total_len,
            transport_header_len,
            payload_offset,
            payload_len,
            tcp_flags,
        })
    }

    /// Transport payload bytes, empty if the declared payload runs past the buffer
    pub fn payload(&self) -> &'a [u8] {
        if self.payload_len > 0 && self.payload_offset + self.payload_len <= self.data.len() {
            &self.data[self.payload_offset..self.payload_offset + self.payload_len]
        } else {
            &[]
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == IpProtocol::Tcp
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == IpProtocol::Udp
    }

    pub fn is_icmp(&self) -> bool {
        self.protocol == IpProtocol::Icmp
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            src_ip: self.src_ip,
            src_port: self.src_port,
            dst_ip: self.dst_ip,
            dst_port: self.dst_port,
            protocol: self.protocol,
        }
    }

    /// "src:port -> dst:port" display for logs
    pub fn endpoints(&self) -> String {
        format!(
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}
