//! Boomerang probing: round-trip packets that measure per-path liveness and
//! latency.

use crate::build;
use crate::error::Error;
use crate::net::socket::Socket;
use crate::path::Path;
use crate::payload::{
    decode_payload, encode_payload, BoomerangPayload, BoomerangResult, PACKET_SIGNATURE,
    WIRE_KEY_SIZE,
};
use crate::TransportChannel;
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The filter fragment a channel must carry to capture returning boomerang
/// packets for the prefix sweeps.
const PROBE_FILTER_FRAGMENT: &str = "ip proto 4";

impl<S: Socket + Send + 'static> TransportChannel<S> {
    /// Send one packet which boomerangs over `path` and measure its round
    /// trip.
    ///
    /// For a path A,B,C,D the packet travels A -> B -> C -> D -> C -> B -> A.
    /// The probe registers its reply listener before transmitting, so the
    /// return packet cannot race registration.
    pub fn boomerang(&self, path: &Path, timeout: Duration) -> BoomerangResult {
        let dest = path.last().unwrap_or(Ipv4Addr::UNSPECIFIED);
        if path.len() < 2 {
            return BoomerangResult::fatal(dest, Error::PathTooShort(2).to_string());
        }
        let id = Uuid::new_v4();
        let payload = BoomerangPayload::new(dest, &id);
        let wire = match encode_payload(&payload, &id) {
            Ok(wire) => wire,
            Err(err) => return BoomerangResult::fatal(dest, err.to_string()),
        };
        let (src_port, dest_port) = self.udp_probe_ports();
        let packet = match build::round_trip_packet(path, src_port, dest_port, &wire) {
            Ok(packet) => packet,
            Err(err) => return BoomerangResult::fatal(dest, err.to_string()),
        };
        let origin = path[0];
        let first_hop = path[1];
        let id_bytes = *id.as_bytes();
        let listener = self.register_listener(move |candidate| {
            let Some(ipv4) = candidate.ipv4() else {
                return false;
            };
            if ipv4.get_destination() != origin || ipv4.get_source() != first_hop {
                return false;
            }
            candidate.application_payload().is_some_and(|bytes| {
                bytes.len() >= WIRE_KEY_SIZE
                    && bytes[..PACKET_SIGNATURE.len()] == PACKET_SIGNATURE
                    && bytes[PACKET_SIGNATURE.len()..WIRE_KEY_SIZE] == id_bytes
            })
        });
        let tx_timestamp = Utc::now();
        if let Err(err) = self.send_to_path(&packet, path) {
            tracing::warn!(%err, %dest, "failed to send boomerang packet");
            self.unregister_listener(&listener);
            return BoomerangResult::send_error(dest, tx_timestamp, err.to_string());
        }
        let deadline = Instant::now() + timeout;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match listener.queue().recv_timeout(remaining) {
                Ok(reply) => {
                    let decoded = reply
                        .application_payload()
                        .ok_or(Error::MalformedPayload)
                        .and_then(decode_payload);
                    match decoded {
                        Ok(mut payload) => {
                            payload.tx_timestamp = Some(tx_timestamp);
                            payload.rx_timestamp = Some(Utc::now());
                            break BoomerangResult::ok(payload);
                        }
                        Err(err) => {
                            // Keep waiting; the timer still bounds the probe.
                            tracing::warn!(%err, "discarding malformed probe reply");
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    break BoomerangResult::timed_out(dest, tx_timestamp, Utc::now());
                }
            }
        };
        self.unregister_listener(&listener);
        result
    }

    /// `num_packets` sequential boomerangs over `path`, streamed as they
    /// complete.
    pub fn probe(
        &self,
        path: &Path,
        num_packets: usize,
        timeout: Duration,
    ) -> Receiver<BoomerangResult> {
        let (result_tx, result_rx) = bounded(num_packets);
        let channel = self.clone();
        let path = path.clone();
        thread::spawn(move || {
            for _ in 0..num_packets {
                if result_tx.send(channel.boomerang(&path, timeout)).is_err() {
                    break;
                }
            }
        });
        result_rx
    }

    /// Probe every prefix of `path` concurrently, attributing loss to a
    /// specific hop.
    ///
    /// For each prefix `path[0..=i]`, `i` in 1..len, `num_packets`
    /// boomerangs are sent; all results are merged into the returned
    /// stream.  The channel must carry a BPF filter containing
    /// `"ip proto 4"`.
    pub fn probe_each_hop_of_path(
        &self,
        path: &Path,
        num_packets: usize,
        timeout: Duration,
    ) -> Receiver<BoomerangResult> {
        if let Some(fatal) = self.prefix_sweep_fatal(path) {
            return fatal;
        }
        let (result_tx, result_rx) = bounded(num_packets * path.len().saturating_sub(1));
        for prefix_len in 2..=path.len() {
            let channel = self.clone();
            let prefix = path.prefix(prefix_len);
            let result_tx = result_tx.clone();
            thread::spawn(move || {
                for _ in 0..num_packets {
                    if result_tx.send(channel.boomerang(&prefix, timeout)).is_err() {
                        break;
                    }
                }
            });
        }
        result_rx
    }

    /// Probe every prefix of `path` in lock-stepped rounds.
    ///
    /// Round k's packets all complete (and a `timeout` pause elapses) before
    /// round k+1 begins, so at most one packet per prefix is in flight.
    pub fn probe_each_hop_of_path_sync(
        &self,
        path: &Path,
        num_packets: usize,
        timeout: Duration,
    ) -> Receiver<BoomerangResult> {
        if let Some(fatal) = self.prefix_sweep_fatal(path) {
            return fatal;
        }
        let (result_tx, result_rx) = bounded(num_packets * path.len().saturating_sub(1));
        let channel = self.clone();
        let path = path.clone();
        thread::spawn(move || {
            for _ in 0..num_packets {
                let workers: Vec<_> = (2..=path.len())
                    .map(|prefix_len| {
                        let channel = channel.clone();
                        let prefix = path.prefix(prefix_len);
                        let result_tx = result_tx.clone();
                        thread::spawn(move || {
                            let _ = result_tx.send(channel.boomerang(&prefix, timeout));
                        })
                    })
                    .collect();
                for worker in workers {
                    let _ = worker.join();
                }
                thread::sleep(timeout);
            }
        });
        result_rx
    }

    /// The single fatal result emitted when the channel cannot capture
    /// returning boomerang packets.
    fn prefix_sweep_fatal(&self, path: &Path) -> Option<Receiver<BoomerangResult>> {
        if self.filter().contains(PROBE_FILTER_FRAGMENT) {
            return None;
        }
        let (result_tx, result_rx) = bounded(1);
        let dest = path.last().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let _ = result_tx.send(BoomerangResult::fatal(
            dest,
            format!(
                "transport channel must have a BPF filter containing {PROBE_FILTER_FRAGMENT:?}: got {:?} instead",
                self.filter()
            ),
        ));
        Some(result_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::channel::tests::{mock_channel, test_config};
    use crate::net::capture::testing::QueueSource;
    use crate::net::capture::PacketSource;
    use crate::net::socket::MockSocket;
    use crate::packet::CapturedPacket;
    use crate::payload::BoomerangStatus;
    use crate::types::Port;
    use retrace_packet::checksum::{ipv4_header_checksum, udp_ipv4_checksum};
    use retrace_packet::ipv4::Ipv4Packet;
    use retrace_packet::udp::UdpPacket;
    use retrace_packet::IpProtocol;

    fn test_path() -> Path {
        [
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
        ]
        .into_iter()
        .collect()
    }

    /// The packet as it arrives back at the origin: a UDP datagram from the
    /// first hop carrying the probe payload.
    fn returned_packet(origin: Ipv4Addr, first_hop: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let total = 28 + payload.len();
        let mut bytes = vec![0_u8; total];
        {
            let mut udp = UdpPacket::new(&mut bytes[20..]).unwrap();
            udp.set_source(62003);
            udp.set_destination(62002);
            udp.set_length((8 + payload.len()) as u16);
            udp.set_payload(payload);
            let checksum = udp_ipv4_checksum(udp.packet(), first_hop, origin);
            udp.set_checksum(checksum);
        }
        {
            let mut ipv4 = Ipv4Packet::new(&mut bytes).unwrap();
            ipv4.set_version(4);
            ipv4.set_header_length(5);
            ipv4.set_total_length(total as u16);
            ipv4.set_ttl(255);
            ipv4.set_protocol(IpProtocol::Udp);
            ipv4.set_source(first_hop);
            ipv4.set_destination(origin);
            let checksum = ipv4_header_checksum(ipv4.packet());
            ipv4.set_checksum(checksum);
        }
        bytes
    }

    /// A send socket that loops every sent probe back to the capture side
    /// as its returning packet, after `delay`.
    fn loopback_socket(
        capture_tx: crossbeam_channel::Sender<Vec<u8>>,
        origin: Ipv4Addr,
        first_hop: Ipv4Addr,
        delay: Duration,
    ) -> MockSocket {
        let mut socket = MockSocket::new();
        socket.expect_raw_fd().return_const(10);
        socket.expect_send_to().returning(move |buf, _| {
            let sent = CapturedPacket::new(buf.to_vec());
            if let Some(payload) = sent.application_payload() {
                let reply = returned_packet(origin, first_hop, payload);
                let capture_tx = capture_tx.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = capture_tx.send(reply);
                });
            }
            Ok(buf.len())
        });
        socket
    }

    fn loopback_channel(
        filter: &str,
        delay: Duration,
    ) -> TransportChannel<MockSocket> {
        let path = test_path();
        let (capture_tx, capture_rx) = crossbeam_channel::unbounded();
        let socket = loopback_socket(capture_tx, path[0], path[1], delay);
        let sources: Vec<Box<dyn PacketSource>> = vec![Box::new(QueueSource::new(capture_rx))];
        let mut v6_socket = MockSocket::new();
        v6_socket.expect_raw_fd().return_const(-1);
        TransportChannel::start(test_config(filter), sources, socket, v6_socket, vec![]).unwrap()
    }

    #[test]
    fn test_boomerang_ok() {
        let channel = loopback_channel("ip proto 4", Duration::from_millis(50));
        let path = test_path();
        let result = channel.boomerang(&path, Duration::from_secs(5));
        assert_eq!(BoomerangStatus::Ok, result.status, "{:?}", result.error);
        assert_eq!(Ipv4Addr::new(10, 0, 0, 3), result.payload.dest_ip);
        let rtt = result.round_trip_time().unwrap();
        assert!(rtt >= chrono::Duration::milliseconds(45), "rtt was {rtt:?}");
        assert!(rtt < chrono::Duration::seconds(5), "rtt was {rtt:?}");
        channel.close();
    }

    #[test]
    fn test_boomerang_timeout() {
        let (channel, _capture_tx) =
            mock_channel("ip proto 4", crate::net::channel::tests::sending_socket(), vec![]);
        let path = test_path();
        let before = Utc::now();
        let result = channel.boomerang(&path, Duration::from_millis(100));
        assert_eq!(BoomerangStatus::TimedOut, result.status);
        assert_eq!(Ipv4Addr::new(10, 0, 0, 3), result.payload.dest_ip);
        assert!(result.payload.tx_timestamp.unwrap() >= before);
        assert!(result.payload.rx_timestamp.is_some());
        assert!(result.error.is_some());
        channel.close();
    }

    #[test]
    fn test_boomerang_send_error() {
        let (capture_tx, capture_rx) = crossbeam_channel::unbounded();
        drop(capture_tx);
        let mut socket = MockSocket::new();
        socket.expect_raw_fd().return_const(10);
        socket.expect_send_to().returning(|_, addr| {
            Err(crate::error::IoError::SendTo(
                std::io::Error::from_raw_os_error(libc::EBADF),
                addr,
            ))
        });
        let sources: Vec<Box<dyn PacketSource>> = vec![Box::new(QueueSource::new(capture_rx))];
        let mut v6_socket = MockSocket::new();
        v6_socket.expect_raw_fd().return_const(-1);
        let channel = TransportChannel::start(
            test_config("ip proto 4"),
            sources,
            socket,
            v6_socket,
            vec![],
        )
        .unwrap();
        let result = channel.boomerang(&test_path(), Duration::from_secs(1));
        assert_eq!(BoomerangStatus::SendError, result.status);
        assert_eq!(Ipv4Addr::new(10, 0, 0, 3), result.payload.dest_ip);
        channel.close();
    }

    #[test]
    fn test_boomerang_path_too_short() {
        let (channel, _capture_tx) =
            mock_channel("ip proto 4", crate::net::channel::tests::sending_socket(), vec![]);
        let single: Path = [Ipv4Addr::new(10, 0, 0, 1)].into_iter().collect();
        let result = channel.boomerang(&single, Duration::from_secs(1));
        assert!(result.is_fatal());
        assert_eq!(Ipv4Addr::new(10, 0, 0, 1), result.payload.dest_ip);
        channel.close();
    }

    #[test]
    fn test_probe_sends_requested_count() {
        let channel = loopback_channel("ip proto 4", Duration::from_millis(1));
        let results: Vec<_> = channel
            .probe(&test_path(), 3, Duration::from_secs(2))
            .iter()
            .collect();
        assert_eq!(3, results.len());
        assert!(results.iter().all(BoomerangResult::is_ok));
        channel.close();
    }

    #[test]
    fn test_probe_each_hop_requires_filter() {
        let channel = loopback_channel("icmp", Duration::from_millis(1));
        let results: Vec<_> = channel
            .probe_each_hop_of_path(&test_path(), 2, Duration::from_secs(1))
            .iter()
            .collect();
        assert_eq!(1, results.len());
        assert!(results[0].is_fatal());
        channel.close();
    }

    #[test]
    fn test_probe_each_hop_merges_prefix_results() {
        let channel = loopback_channel("ip proto 4", Duration::from_millis(1));
        let path = test_path();
        let results: Vec<_> = channel
            .probe_each_hop_of_path(&path, 2, Duration::from_secs(2))
            .iter()
            .collect();
        assert_eq!(4, results.len());
        let to_first_hop = results
            .iter()
            .filter(|result| result.payload.dest_ip == path[1])
            .count();
        let to_terminus = results
            .iter()
            .filter(|result| result.payload.dest_ip == path[2])
            .count();
        assert_eq!(2, to_first_hop);
        assert_eq!(2, to_terminus);
        channel.close();
    }

    #[test]
    fn test_probe_each_hop_sync_emits_exact_count() {
        let channel = loopback_channel("ip proto 4", Duration::from_millis(200));
        let path = test_path();
        let results: Vec<_> = channel
            .probe_each_hop_of_path_sync(&path, 2, Duration::from_millis(300))
            .iter()
            .collect();
        assert_eq!(2 * (path.len() - 1), results.len());
        assert!(results.iter().all(BoomerangResult::is_ok));
        channel.close();
    }
}
