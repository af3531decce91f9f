use retrace_packet::icmpv4::IcmpPacket;
use retrace_packet::ipv4::Ipv4Packet;
use std::sync::Arc;

const IPV4_VERSION: u8 = 4;
const PROTOCOL_ICMP: u8 = 1;
const PROTOCOL_IPIP: u8 = 4;
const PROTOCOL_UDP: u8 = 17;
const ICMP_HEADER_LEN: usize = 8;
const UDP_HEADER_LEN: usize = 8;

/// One packet delivered by a capture handle.
///
/// The bytes start at the outer IPv4 header (the capture layer strips the
/// link-layer framing).  Cloning is cheap; a single captured packet may be
/// delivered to many listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedPacket {
    data: Arc<[u8]>,
}

impl CapturedPacket {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    /// The raw packet bytes, starting at the outer IPv4 header.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// A view over the outer IPv4 header, if this is an IPv4 packet.
    #[must_use]
    pub fn ipv4(&self) -> Option<Ipv4Packet<'_>> {
        Ipv4Packet::new_view(&self.data)
            .ok()
            .filter(|ipv4| ipv4.get_version() == IPV4_VERSION)
    }

    /// A view over the ICMP message, if the outer packet carries one.
    #[must_use]
    pub fn icmpv4(&self) -> Option<IcmpPacket<'_>> {
        let header_len = self.outer_header_len()?;
        if self.data[9] != PROTOCOL_ICMP {
            return None;
        }
        IcmpPacket::new_view(self.data.get(header_len..)?).ok()
    }

    /// The application payload, unwrapping any nested IP-in-IP headers down
    /// to the innermost UDP datagram or ICMP message.
    #[must_use]
    pub fn application_payload(&self) -> Option<&[u8]> {
        let mut offset = 0;
        loop {
            let packet = self.data.get(offset..)?;
            if packet.len() < Ipv4Packet::minimum_packet_size() || packet[0] >> 4 != IPV4_VERSION {
                return None;
            }
            let header_len = usize::from(packet[0] & 0x0f) * 4;
            match packet[9] {
                PROTOCOL_IPIP => offset += header_len,
                PROTOCOL_UDP => return packet.get(header_len..)?.get(UDP_HEADER_LEN..),
                PROTOCOL_ICMP => return packet.get(header_len..)?.get(ICMP_HEADER_LEN..),
                _ => return None,
            }
        }
    }

    fn outer_header_len(&self) -> Option<usize> {
        let ipv4 = self.ipv4()?;
        Some(usize::from(ipv4.get_header_length()) * 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build;
    use crate::path::Path;
    use crate::types::{Port, TimeToLive};
    use retrace_packet::icmpv4::IcmpType;
    use std::net::Ipv4Addr;

    #[test]
    fn test_ipv4_view() {
        let bytes = build::icmp_traceroute_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            TimeToLive(5),
            b"Hello",
        )
        .unwrap();
        let packet = CapturedPacket::new(bytes);
        let ipv4 = packet.ipv4().unwrap();
        assert_eq!(Ipv4Addr::new(10, 0, 0, 1), ipv4.get_source());
        assert_eq!(Ipv4Addr::new(10, 0, 0, 2), ipv4.get_destination());
        let icmp = packet.icmpv4().unwrap();
        assert_eq!(IcmpType::EchoRequest, icmp.get_icmp_type());
    }

    #[test]
    fn test_application_payload_unwraps_nesting() {
        let path: Path = [
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
        ]
        .into_iter()
        .collect();
        let bytes = build::round_trip_packet(&path, Port(62003), Port(62002), b"payload").unwrap();
        let packet = CapturedPacket::new(bytes);
        assert_eq!(Some(&b"payload"[..]), packet.application_payload());
    }

    #[test]
    fn test_application_payload_of_icmp() {
        let bytes = build::icmp_traceroute_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            TimeToLive(5),
            b"Hello",
        )
        .unwrap();
        let packet = CapturedPacket::new(bytes);
        assert_eq!(Some(&b"Hello"[..]), packet.application_payload());
    }

    #[test]
    fn test_not_ipv4() {
        let packet = CapturedPacket::new(vec![0x60; 40]);
        assert!(packet.ipv4().is_none());
        assert!(packet.icmpv4().is_none());
        assert!(packet.application_payload().is_none());
    }

    #[test]
    fn test_truncated() {
        let packet = CapturedPacket::new(vec![0x45; 10]);
        assert!(packet.ipv4().is_none());
        assert!(packet.application_payload().is_none());
    }
}
