//! Path discovery: TTL-incrementing probe sequences in three modes.
//!
//! All modes require a channel whose BPF filter is exactly `"icmp"` and emit
//! one `Option<Ipv4Addr>` per TTL (`None` for a timed-out TTL) until the
//! destination answers or the TTL cap is reached.

use crate::build;
use crate::constants::{DISCOVERY_PAYLOAD, MAX_TTL};
use crate::error::Result;
use crate::net::socket::Socket;
use crate::packet::CapturedPacket;
use crate::path::Path;
use crate::types::TimeToLive;
use crate::TransportChannel;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use retrace_packet::icmpv4::{IcmpType, IcmpUnreachableCode};
use std::net::{IpAddr, Ipv4Addr};
use std::thread;
use std::time::Duration;

/// The emission side of a discovery run: one entry per TTL, `None` for a
/// timed-out TTL.
pub type PathChannel = Receiver<Option<Ipv4Addr>>;

/// Parameters for a forward (local to destination) discovery run.
#[derive(Debug, Clone, Copy)]
pub struct PathChannelParams {
    /// The destination to trace towards.
    pub dest: Ipv4Addr,
    /// Overrides the source address resolved from the routing table.
    pub override_source: Option<Ipv4Addr>,
    /// How long to wait for a response at each TTL.
    pub timeout: Duration,
}

impl PathChannelParams {
    #[must_use]
    pub fn new(dest: Ipv4Addr, timeout: Duration) -> Self {
        Self {
            dest,
            override_source: None,
            timeout,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: Ipv4Addr) -> Self {
        self.override_source = Some(source);
        self
    }
}

/// How one delivered packet advances a discovery run.
enum Classified {
    /// An intermediate hop answered.
    Hop(Ipv4Addr),
    /// The terminal response: emit the responder, then `final_hop`, then
    /// stop.
    Done {
        responder: Ipv4Addr,
        final_hop: Ipv4Addr,
    },
}

impl<S: Socket + Send + 'static> TransportChannel<S> {
    /// Trace the path from this host towards `params.dest`.
    ///
    /// A UDP probe is sent per TTL; routers answer with TTL-exceeded and the
    /// destination with port-unreachable (loopback-sourced port-unreachable
    /// is ignored).
    pub fn path_channel_to(&self, params: PathChannelParams) -> Result<PathChannel> {
        self.require_exact_filter("icmp")?;
        let source_ip = match params.override_source {
            Some(source) => source,
            None => self.find_source_ip_for_dest(params.dest)?,
        };
        let dest = params.dest;
        tracing::debug!(%source_ip, %dest, interface = self.interface(), "forward path discovery");
        let listener = self.register_listener(move |packet| {
            forward_classify(packet, source_ip, dest).is_some()
        });
        // Prime the capture path before the sweep: under some capture
        // backends the first packet after activation is lost.
        let (src_port, dest_port) = self.udp_probe_ports();
        let warmup = build::udp_traceroute_packet(
            source_ip,
            dest,
            TimeToLive(2),
            src_port,
            dest_port,
            DISCOVERY_PAYLOAD,
        )?;
        if let Err(err) = self.send_to(&warmup, IpAddr::V4(dest)) {
            tracing::warn!(%err, "failed to send warm-up packet");
        }
        let channel = self.clone();
        let timeout = params.timeout;
        Ok(run_sweep(listener_handle(channel, listener), move |channel, ttl| {
            let probe = build::udp_traceroute_packet(
                source_ip,
                dest,
                ttl,
                src_port,
                dest_port,
                DISCOVERY_PAYLOAD,
            )?;
            if let Err(err) = channel.send_to(&probe, IpAddr::V4(dest)) {
                tracing::warn!(%err, ttl = ttl.0, "failed to send probe");
            }
            Ok(())
        }, move |packet| forward_classify(packet, source_ip, dest), timeout))
    }

    /// Trace the path from `dest` back to this host.
    ///
    /// Each TTL sends a pair of IP-in-IP packets that coerce `dest` into
    /// emitting the probe sequence: a round-trip probe whose inner packet
    /// travels home with the probe TTL, and a remote probe soliciting an
    /// echo from `dest` itself.
    pub fn path_channel_from(&self, dest: Ipv4Addr, timeout: Duration) -> Result<PathChannel> {
        self.require_exact_filter("icmp")?;
        let local_ip = self.find_local_ip()?;
        tracing::debug!(%local_ip, %dest, "reverse path discovery");
        let listener = self.register_listener(move |packet| {
            reverse_classify(packet, local_ip, dest).is_some()
        });
        let channel = self.clone();
        Ok(run_sweep(listener_handle(channel, listener), move |channel, ttl| {
            let round_trip = build::encap_traceroute_packet(
                local_ip,
                dest,
                local_ip,
                local_ip,
                ttl,
                DISCOVERY_PAYLOAD,
            )?;
            let remote_probe = build::encap_traceroute_packet(
                local_ip,
                dest,
                dest,
                local_ip,
                TimeToLive(ttl.0 + 1),
                DISCOVERY_PAYLOAD,
            )?;
            if let Err(err) = channel.send_to(&round_trip, IpAddr::V4(dest)) {
                tracing::warn!(%err, ttl = ttl.0, "failed to send round-trip probe");
            }
            if let Err(err) = channel.send_to(&remote_probe, IpAddr::V4(dest)) {
                tracing::warn!(%err, ttl = ttl.0, "failed to send remote probe");
            }
            Ok(())
        }, move |packet| reverse_classify(packet, local_ip, dest), timeout))
    }

    /// Trace the path from an arbitrary `source` towards `dest`.
    ///
    /// When `source` is this host this is a forward trace; otherwise
    /// IP-in-IP probes are sent to `source` which emits the TTL sequence
    /// towards `dest` on our behalf.
    pub fn path_channel_from_source_to_dest(
        &self,
        source: Ipv4Addr,
        dest: Ipv4Addr,
        timeout: Duration,
    ) -> Result<PathChannel> {
        self.require_exact_filter("icmp")?;
        let local_ip = self.find_local_ip()?;
        if source == local_ip {
            return self.path_channel_to(PathChannelParams::new(dest, timeout));
        }
        tracing::debug!(%local_ip, %source, %dest, "remote-source path discovery");
        let listener = self.register_listener(move |packet| {
            remote_source_classify(packet, local_ip, dest).is_some()
        });
        let channel = self.clone();
        Ok(run_sweep(listener_handle(channel, listener), move |channel, ttl| {
            let probe = build::encap_traceroute_packet(
                local_ip,
                source,
                local_ip,
                dest,
                ttl,
                DISCOVERY_PAYLOAD,
            )?;
            if let Err(err) = channel.send_to(&probe, IpAddr::V4(source)) {
                tracing::warn!(%err, ttl = ttl.0, "failed to send encapsulated probe");
            }
            Ok(())
        }, move |packet| remote_source_classify(packet, local_ip, dest), timeout))
    }

    /// [`path_channel_to`](Self::path_channel_to), drained into a [`Path`].
    /// Timed-out TTLs are omitted.
    pub fn get_path_to(&self, dest: Ipv4Addr, timeout: Duration) -> Result<Path> {
        let hops = self.path_channel_to(PathChannelParams::new(dest, timeout))?;
        Ok(hops.iter().flatten().collect())
    }

    /// [`path_channel_from`](Self::path_channel_from), drained into a
    /// [`Path`].  Timed-out TTLs are omitted.
    pub fn get_path_from(&self, dest: Ipv4Addr, timeout: Duration) -> Result<Path> {
        let hops = self.path_channel_from(dest, timeout)?;
        Ok(hops.iter().flatten().collect())
    }

    /// [`path_channel_from_source_to_dest`](Self::path_channel_from_source_to_dest),
    /// drained into a [`Path`].  Timed-out TTLs are omitted.
    pub fn get_path_from_source_to_dest(
        &self,
        source: Ipv4Addr,
        dest: Ipv4Addr,
        timeout: Duration,
    ) -> Result<Path> {
        let hops = self.path_channel_from_source_to_dest(source, dest, timeout)?;
        Ok(hops.iter().flatten().collect())
    }
}

/// A channel paired with the listener a sweep owns; unregistered when the
/// sweep ends.
struct SweepListener<S: Socket> {
    channel: TransportChannel<S>,
    listener: crate::listener::Listener,
}

fn listener_handle<S: Socket>(
    channel: TransportChannel<S>,
    listener: crate::listener::Listener,
) -> SweepListener<S> {
    SweepListener { channel, listener }
}

/// Drive a TTL sweep on a worker thread.
///
/// Per TTL: send via `send_probe`, then emit the classification of the next
/// delivered packet, `None` on timeout, stopping at a terminal response or
/// after [`MAX_TTL`].
fn run_sweep<S, F, C>(
    sweep: SweepListener<S>,
    send_probe: F,
    classify: C,
    timeout: Duration,
) -> PathChannel
where
    S: Socket + Send + 'static,
    F: Fn(&TransportChannel<S>, TimeToLive) -> Result<()> + Send + 'static,
    C: Fn(&CapturedPacket) -> Option<Classified> + Send + 'static,
{
    // Sized for the worst case (a hop per TTL plus the terminal emission) so
    // the sweep never blocks on a slow consumer.
    let (path_tx, path_rx) = bounded(usize::from(MAX_TTL) + 1);
    thread::spawn(move || {
        for ttl in 1..=MAX_TTL {
            if let Err(err) = send_probe(&sweep.channel, TimeToLive(ttl)) {
                tracing::error!(%err, ttl, "failed to build probe, ending sweep");
                break;
            }
            match sweep.listener.queue().recv_timeout(timeout) {
                Ok(packet) => match classify(&packet) {
                    Some(Classified::Hop(hop)) => {
                        if path_tx.send(Some(hop)).is_err() {
                            break;
                        }
                    }
                    Some(Classified::Done {
                        responder,
                        final_hop,
                    }) => {
                        if path_tx.send(Some(responder)).is_ok() && final_hop != responder {
                            let _ = path_tx.send(Some(final_hop));
                        }
                        break;
                    }
                    None => {
                        if path_tx.send(None).is_err() {
                            break;
                        }
                    }
                },
                Err(RecvTimeoutError::Timeout) => {
                    if path_tx.send(None).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        sweep.channel.unregister_listener(&sweep.listener);
    });
    path_rx
}

/// Forward mode: TTL-exceeded addressed to us marks a hop; port-unreachable
/// from a non-loopback source marks the destination reached.
fn forward_classify(
    packet: &CapturedPacket,
    source_ip: Ipv4Addr,
    dest: Ipv4Addr,
) -> Option<Classified> {
    let ipv4 = packet.ipv4()?;
    let icmp = packet.icmpv4()?;
    match icmp.get_icmp_type() {
        IcmpType::TimeExceeded if ipv4.get_destination() == source_ip => {
            Some(Classified::Hop(ipv4.get_source()))
        }
        IcmpType::DestinationUnreachable
            if IcmpUnreachableCode::from(icmp.get_icmp_code())
                == IcmpUnreachableCode::PortUnreachable
                && ipv4.get_source() != Ipv4Addr::LOCALHOST =>
        {
            Some(Classified::Done {
                responder: ipv4.get_source(),
                final_hop: dest,
            })
        }
        _ => None,
    }
}

/// Reverse mode: TTL-exceeded addressed to us marks a hop; the echo request
/// emitted by `dest` itself marks completion, terminating at its
/// destination (this host).
fn reverse_classify(
    packet: &CapturedPacket,
    local_ip: Ipv4Addr,
    dest: Ipv4Addr,
) -> Option<Classified> {
    let ipv4 = packet.ipv4()?;
    let icmp = packet.icmpv4()?;
    match icmp.get_icmp_type() {
        IcmpType::TimeExceeded if ipv4.get_destination() == local_ip => {
            Some(Classified::Hop(ipv4.get_source()))
        }
        IcmpType::EchoRequest if ipv4.get_source() == dest => Some(Classified::Done {
            responder: ipv4.get_destination(),
            final_hop: ipv4.get_destination(),
        }),
        _ => None,
    }
}

/// Remote-source mode: TTL-exceeded addressed to us marks a hop; an echo
/// reply from `dest` marks completion.
fn remote_source_classify(
    packet: &CapturedPacket,
    local_ip: Ipv4Addr,
    dest: Ipv4Addr,
) -> Option<Classified> {
    let ipv4 = packet.ipv4()?;
    let icmp = packet.icmpv4()?;
    match icmp.get_icmp_type() {
        IcmpType::TimeExceeded if ipv4.get_destination() == local_ip => {
            Some(Classified::Hop(ipv4.get_source()))
        }
        IcmpType::EchoReply if ipv4.get_source() == dest => Some(Classified::Done {
            responder: ipv4.get_source(),
            final_hop: ipv4.get_source(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::net::channel::tests::{mock_channel, sending_socket};
    use crate::net::socket::MockSocket;
    use retrace_packet::checksum::{icmp_ipv4_checksum, ipv4_header_checksum};
    use retrace_packet::icmpv4::{IcmpCode, IcmpPacket};
    use retrace_packet::ipv4::Ipv4Packet;
    use retrace_packet::IpProtocol;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    /// Craft a minimal ICMP packet as delivered by a capture handle.
    fn icmp_reply(src: Ipv4Addr, dest: Ipv4Addr, icmp_type: IcmpType, code: IcmpCode) -> Vec<u8> {
        let total = Ipv4Packet::minimum_packet_size() + IcmpPacket::minimum_packet_size();
        let mut bytes = vec![0_u8; total];
        {
            let mut icmp = IcmpPacket::new(&mut bytes[20..]).unwrap();
            icmp.set_icmp_type(icmp_type);
            icmp.set_icmp_code(code);
            icmp.set_checksum(0);
            let checksum = icmp_ipv4_checksum(icmp.packet());
            icmp.set_checksum(checksum);
        }
        {
            let mut ipv4 = Ipv4Packet::new(&mut bytes).unwrap();
            ipv4.set_version(4);
            ipv4.set_header_length(5);
            ipv4.set_total_length(total as u16);
            ipv4.set_ttl(64);
            ipv4.set_protocol(IpProtocol::Icmp);
            ipv4.set_source(src);
            ipv4.set_destination(dest);
            let checksum = ipv4_header_checksum(ipv4.packet());
            ipv4.set_checksum(checksum);
        }
        bytes
    }

    /// A send socket which, skipping the warm-up packet, answers each probe
    /// with the next queued reply via the capture side.
    fn replying_socket(
        replies: Vec<Vec<u8>>,
        capture_tx: crossbeam_channel::Sender<Vec<u8>>,
    ) -> MockSocket {
        let mut socket = MockSocket::new();
        socket.expect_raw_fd().return_const(10);
        let pending = Mutex::new((true, VecDeque::from(replies)));
        socket.expect_send_to().returning(move |buf, _| {
            let mut pending = pending.lock().unwrap();
            if pending.0 {
                pending.0 = false;
            } else if let Some(reply) = pending.1.pop_front() {
                let _ = capture_tx.send(reply);
            }
            Ok(buf.len())
        });
        socket
    }

    #[test]
    fn test_forward_discovery_happy_path() {
        let source_ip = ip(10, 0, 0, 9);
        let dest = ip(10, 0, 0, 99);
        let r1 = ip(10, 0, 0, 10);
        let r2 = ip(10, 0, 0, 11);
        let (capture_tx, capture_rx) = crossbeam_channel::unbounded();
        let replies = vec![
            icmp_reply(r1, source_ip, IcmpType::TimeExceeded, IcmpCode(0)),
            icmp_reply(r2, source_ip, IcmpType::TimeExceeded, IcmpCode(0)),
            icmp_reply(dest, source_ip, IcmpType::DestinationUnreachable, IcmpCode(3)),
        ];
        let socket = replying_socket(replies, capture_tx);
        let channel = {
            use crate::net::capture::testing::QueueSource;
            use crate::net::capture::PacketSource;
            use crate::net::channel::tests::test_config;
            let sources: Vec<Box<dyn PacketSource>> = vec![Box::new(QueueSource::new(capture_rx))];
            let mut v6_socket = MockSocket::new();
            v6_socket.expect_raw_fd().return_const(-1);
            crate::TransportChannel::start(test_config("icmp"), sources, socket, v6_socket, vec![])
                .unwrap()
        };
        let params =
            PathChannelParams::new(dest, Duration::from_millis(500)).with_source(source_ip);
        let hops: Vec<_> = channel.path_channel_to(params).unwrap().iter().collect();
        assert_eq!(vec![Some(r1), Some(r2), Some(dest)], hops);
        channel.close();
    }

    #[test]
    fn test_forward_discovery_all_timeouts() {
        let (channel, _capture_tx) = mock_channel("icmp", sending_socket(), vec![]);
        let params = PathChannelParams::new(ip(10, 0, 0, 99), Duration::from_millis(5))
            .with_source(ip(10, 0, 0, 9));
        let hops: Vec<_> = channel.path_channel_to(params).unwrap().iter().collect();
        assert_eq!(vec![None; usize::from(MAX_TTL)], hops);
        channel.close();
    }

    #[test]
    fn test_forward_discovery_requires_icmp_filter() {
        let (channel, _capture_tx) = mock_channel("ip proto 4", sending_socket(), vec![]);
        let err = channel
            .path_channel_to(PathChannelParams::new(ip(1, 1, 1, 1), Duration::from_millis(5)))
            .unwrap_err();
        assert!(matches!(err, Error::FilterMismatch { .. }));
        channel.close();
    }

    #[test]
    fn test_forward_classify_ignores_loopback_port_unreachable() {
        let source_ip = ip(10, 0, 0, 9);
        let dest = ip(10, 0, 0, 99);
        let packet = CapturedPacket::new(icmp_reply(
            Ipv4Addr::LOCALHOST,
            source_ip,
            IcmpType::DestinationUnreachable,
            IcmpCode(3),
        ));
        assert!(forward_classify(&packet, source_ip, dest).is_none());
    }

    #[test]
    fn test_forward_classify_ignores_other_destinations() {
        let source_ip = ip(10, 0, 0, 9);
        let dest = ip(10, 0, 0, 99);
        let packet = CapturedPacket::new(icmp_reply(
            ip(10, 0, 0, 10),
            ip(10, 0, 0, 77),
            IcmpType::TimeExceeded,
            IcmpCode(0),
        ));
        assert!(forward_classify(&packet, source_ip, dest).is_none());
    }

    #[test]
    fn test_reverse_classify() {
        let local_ip = ip(10, 0, 0, 9);
        let dest = ip(10, 0, 0, 99);
        let hop = CapturedPacket::new(icmp_reply(
            ip(10, 0, 0, 50),
            local_ip,
            IcmpType::TimeExceeded,
            IcmpCode(0),
        ));
        assert!(matches!(
            reverse_classify(&hop, local_ip, dest),
            Some(Classified::Hop(addr)) if addr == ip(10, 0, 0, 50)
        ));
        let done = CapturedPacket::new(icmp_reply(
            dest,
            local_ip,
            IcmpType::EchoRequest,
            IcmpCode(0),
        ));
        assert!(matches!(
            reverse_classify(&done, local_ip, dest),
            Some(Classified::Done { responder, final_hop })
                if responder == local_ip && final_hop == local_ip
        ));
    }

    #[test]
    fn test_remote_source_classify() {
        let local_ip = ip(10, 0, 0, 9);
        let dest = ip(10, 0, 0, 99);
        let done = CapturedPacket::new(icmp_reply(
            dest,
            local_ip,
            IcmpType::EchoReply,
            IcmpCode(0),
        ));
        assert!(matches!(
            remote_source_classify(&done, local_ip, dest),
            Some(Classified::Done { responder, .. }) if responder == dest
        ));
        let unrelated = CapturedPacket::new(icmp_reply(
            ip(8, 8, 8, 8),
            local_ip,
            IcmpType::EchoReply,
            IcmpCode(0),
        ));
        assert!(remote_source_classify(&unrelated, local_ip, dest).is_none());
    }
}
