//! Wire-level types shared between the capture side and the aggregation side.

use std::{borrow::Cow, fmt, net::Ipv4Addr};

use chrono::{DateTime, Utc};

pub const ICMP_PROTOCOL: u8 = 0x01;
pub const TCP_PROTOCOL: u8 = 0x06;
pub const UDP_PROTOCOL: u8 = 0x11;

/// Display name of an IP protocol number, e.g. `"TCP"`.
pub fn l3_protocol(protocol: u8) -> Cow<'static, str> {
    match protocol {
        ICMP_PROTOCOL => Cow::Borrowed("ICMP"),
        UDP_PROTOCOL => Cow::Borrowed("UDP"),
        TCP_PROTOCOL => Cow::Borrowed("TCP"),
        _ => Cow::Owned(format!("{:#04x}", protocol)),
    }
}

/// A decoded IPv4 packet carrying a transport header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub timestamp: DateTime<Utc>,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub l3_protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    /// Length of the whole captured frame.
    pub byte_length: usize,
}

/// Identity of a tracked flow.
///
/// The source port is the one seen at first observation, so the forward and
/// reverse legs of a conversation land on different keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: Cow<'static, str>,
    pub src_port: u16,
}

impl FlowKey {
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            src: packet.src,
            dst: packet.dst,
            protocol: l3_protocol(packet.l3_protocol),
            src_port: packet.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {} proto:{}",
            self.src, self.src_port, self.dst, self.protocol
        )
    }
}

/// Which endpoint of a flow belongs to an attributed workload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The source endpoint resolved.
    Outbound,
    /// Only the destination endpoint resolved.
    Inbound,
    #[default]
    Unknown,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
            Direction::Unknown => "",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
