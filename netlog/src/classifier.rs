use std::net::Ipv4Addr;

use netlog_common::{FlowKey, Packet};

/// Whether an address is routable outside the local site.
///
/// Loopback, link-local unicast (169.254/16), link-local multicast
/// (224.0.0/24) and the RFC 1918 private blocks are not public.
pub fn is_public(addr: Ipv4Addr) -> bool {
    if addr.is_loopback() || addr.is_link_local() || is_link_local_multicast(addr) {
        return false;
    }
    !addr.is_private()
}

fn is_link_local_multicast(addr: Ipv4Addr) -> bool {
    let [a, b, c, _] = addr.octets();
    a == 224 && b == 0 && c == 0
}

/// Derives the flow key for a packet, or `None` when neither endpoint is
/// public and the packet is not tracked.
pub fn classify(packet: &Packet) -> Option<FlowKey> {
    if !is_public(packet.src) && !is_public(packet.dst) {
        return None;
    }
    Some(FlowKey::from_packet(packet))
}
