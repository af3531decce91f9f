//! Probe packet construction.
//!
//! All builders emit complete IPv4 packets with the Don't Fragment bit set,
//! IHL 5 and computed checksums, ready for a raw socket with `IP_HDRINCL`.

use crate::constants::ENCAP_TTL;
use crate::error::{Error, Result};
use crate::path::Path;
use crate::payload::SIGNATURE_V4;
use crate::types::{Port, TimeToLive};
use retrace_packet::checksum::{icmp_ipv4_checksum, ipv4_header_checksum, udp_ipv4_checksum};
use retrace_packet::icmpv4::echo_request::EchoRequestPacket;
use retrace_packet::ipv4::{Ipv4Packet, DONT_FRAGMENT};
use retrace_packet::udp::UdpPacket;
use retrace_packet::IpProtocol;
use std::net::Ipv4Addr;

const IPV4_HEADER_LEN: usize = Ipv4Packet::minimum_packet_size();
const ICMP_HEADER_LEN: usize = EchoRequestPacket::minimum_packet_size();
const UDP_HEADER_LEN: usize = UdpPacket::minimum_packet_size();

/// The sequence number carried by ICMP traceroute probes.
const PROBE_SEQUENCE: u16 = 1;

struct Ipv4HeaderSpec {
    src: Ipv4Addr,
    dest: Ipv4Addr,
    protocol: IpProtocol,
    ttl: u8,
    total_length: u16,
    identification: u16,
}

/// An ICMP Echo Request traceroute probe with the given TTL.
pub fn icmp_traceroute_packet(
    src: Ipv4Addr,
    dest: Ipv4Addr,
    ttl: TimeToLive,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let total = IPV4_HEADER_LEN + ICMP_HEADER_LEN + payload.len();
    let mut bytes = vec![0_u8; total];
    write_icmp_echo_request(&mut bytes[IPV4_HEADER_LEN..], payload)?;
    write_ipv4_header(
        &mut bytes,
        &Ipv4HeaderSpec {
            src,
            dest,
            protocol: IpProtocol::Icmp,
            ttl: ttl.0,
            total_length: total as u16,
            identification: 0,
        },
    )?;
    Ok(bytes)
}

/// An IP-in-IP packet carrying an ICMP traceroute probe.
///
/// The outer header travels at full TTL; the probe TTL takes effect once the
/// remote end decapsulates and forwards the inner packet.
pub fn encap_traceroute_packet(
    outer_src: Ipv4Addr,
    outer_dest: Ipv4Addr,
    inner_src: Ipv4Addr,
    inner_dest: Ipv4Addr,
    ttl: TimeToLive,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let inner_total = IPV4_HEADER_LEN + ICMP_HEADER_LEN + payload.len();
    let total = IPV4_HEADER_LEN + inner_total;
    let mut bytes = vec![0_u8; total];
    write_icmp_echo_request(&mut bytes[2 * IPV4_HEADER_LEN..], payload)?;
    write_ipv4_header(
        &mut bytes[IPV4_HEADER_LEN..],
        &Ipv4HeaderSpec {
            src: inner_src,
            dest: inner_dest,
            protocol: IpProtocol::Icmp,
            ttl: ttl.0,
            total_length: inner_total as u16,
            identification: 0,
        },
    )?;
    write_ipv4_header(
        &mut bytes,
        &Ipv4HeaderSpec {
            src: outer_src,
            dest: outer_dest,
            protocol: IpProtocol::IpInIp,
            ttl: ENCAP_TTL,
            total_length: total as u16,
            identification: 0,
        },
    )?;
    Ok(bytes)
}

/// A UDP traceroute probe with the given TTL.
pub fn udp_traceroute_packet(
    src: Ipv4Addr,
    dest: Ipv4Addr,
    ttl: TimeToLive,
    src_port: Port,
    dest_port: Port,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let total = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut bytes = vec![0_u8; total];
    write_udp(&mut bytes[IPV4_HEADER_LEN..], src, dest, src_port, dest_port, payload)?;
    write_ipv4_header(
        &mut bytes,
        &Ipv4HeaderSpec {
            src,
            dest,
            protocol: IpProtocol::Udp,
            ttl: ttl.0,
            total_length: total as u16,
            identification: 0,
        },
    )?;
    Ok(bytes)
}

/// A packet which round trips over the hops of `path` and returns to the
/// origin.
///
/// For a path `[H0, .., Hn-1]` the packet nests `2(n-1)` IP-in-IP headers:
/// outgoing `(Hi -> Hi+1)` then, mirrored around the terminus, returning
/// `(Hi+1 -> Hi)`.  Each router on the way strips one header and forwards on
/// the next, so the packet bounces off every listed hop and lands back at
/// `H0` as a UDP datagram from `H1` carrying `payload`.  Every header's
/// total-length field covers that header through end of packet, and carries
/// the v4 probe signature in its identification field.
pub fn round_trip_packet(
    path: &Path,
    src_port: Port,
    dest_port: Port,
    payload: &[u8],
) -> Result<Vec<u8>> {
    if path.len() < 2 {
        return Err(Error::PathTooShort(2));
    }
    let num_headers = 2 * (path.len() - 1);
    let overhead = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let total = IPV4_HEADER_LEN * num_headers + overhead;
    let mut bytes = vec![0_u8; total];
    let origin = path[0];
    let first_hop = path[1];
    let carrier_offset = IPV4_HEADER_LEN * num_headers;
    write_udp(
        &mut bytes[carrier_offset + IPV4_HEADER_LEN..],
        first_hop,
        origin,
        src_port,
        dest_port,
        payload,
    )?;
    write_ipv4_header(
        &mut bytes[carrier_offset..],
        &Ipv4HeaderSpec {
            src: first_hop,
            dest: origin,
            protocol: IpProtocol::Udp,
            ttl: ENCAP_TTL,
            total_length: overhead as u16,
            identification: SIGNATURE_V4,
        },
    )?;
    for idx in 0..path.len() - 1 {
        let hop_a = path[idx];
        let hop_b = path[idx + 1];
        let depart_length = IPV4_HEADER_LEN * (num_headers - idx) + overhead;
        let return_length = IPV4_HEADER_LEN * (idx + 1) + overhead;
        write_ipv4_header(
            &mut bytes[IPV4_HEADER_LEN * idx..],
            &Ipv4HeaderSpec {
                src: hop_a,
                dest: hop_b,
                protocol: IpProtocol::IpInIp,
                ttl: ENCAP_TTL,
                total_length: depart_length as u16,
                identification: SIGNATURE_V4,
            },
        )?;
        write_ipv4_header(
            &mut bytes[IPV4_HEADER_LEN * (num_headers - idx - 1)..],
            &Ipv4HeaderSpec {
                src: hop_b,
                dest: hop_a,
                protocol: IpProtocol::IpInIp,
                ttl: ENCAP_TTL,
                total_length: return_length as u16,
                identification: SIGNATURE_V4,
            },
        )?;
    }
    Ok(bytes)
}

fn write_ipv4_header(buf: &mut [u8], spec: &Ipv4HeaderSpec) -> Result<()> {
    let mut ipv4 = Ipv4Packet::new(&mut buf[..IPV4_HEADER_LEN])?;
    ipv4.set_version(4);
    ipv4.set_header_length(5);
    ipv4.set_total_length(spec.total_length);
    ipv4.set_identification(spec.identification);
    ipv4.set_flags_and_fragment_offset(DONT_FRAGMENT);
    ipv4.set_ttl(spec.ttl);
    ipv4.set_protocol(spec.protocol);
    ipv4.set_source(spec.src);
    ipv4.set_destination(spec.dest);
    ipv4.set_checksum(ipv4_header_checksum(ipv4.packet()));
    Ok(())
}

fn write_icmp_echo_request(buf: &mut [u8], payload: &[u8]) -> Result<()> {
    let size = ICMP_HEADER_LEN + payload.len();
    let mut icmp = EchoRequestPacket::new(&mut buf[..size])?;
    icmp.set_icmp_type(retrace_packet::icmpv4::IcmpType::EchoRequest);
    icmp.set_icmp_code(retrace_packet::icmpv4::IcmpCode(0));
    icmp.set_identifier(0);
    icmp.set_sequence(PROBE_SEQUENCE);
    icmp.set_payload(payload);
    icmp.set_checksum(icmp_ipv4_checksum(icmp.packet()));
    Ok(())
}

fn write_udp(
    buf: &mut [u8],
    src: Ipv4Addr,
    dest: Ipv4Addr,
    src_port: Port,
    dest_port: Port,
    payload: &[u8],
) -> Result<()> {
    let size = UDP_HEADER_LEN + payload.len();
    let mut udp = UdpPacket::new(&mut buf[..size])?;
    udp.set_source(src_port.0);
    udp.set_destination(dest_port.0);
    udp.set_length(size as u16);
    udp.set_payload(payload);
    udp.set_checksum(udp_ipv4_checksum(udp.packet(), src, dest));
    Ok(())
}
