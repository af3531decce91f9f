use std::time::Duration;

/// The maximum time-to-live probed during path discovery.
///
/// A TTL sweep that reaches this value without a terminal response completes
/// normally.
pub const MAX_TTL: u8 = 32;

/// The capacity of the multiplexed receive queue fed by all capture handles.
pub(crate) const RECV_QUEUE_CAPACITY: usize = 1_000_000;

/// The capacity of listener and hash delivery queues.
///
/// A single slot: a stale packet is less useful than a fresh one for latency
/// probes.
pub(crate) const DELIVERY_QUEUE_CAPACITY: usize = 1;

/// How long a capture reader sleeps after an unrecognized capture error.
pub(crate) const UNKNOWN_CAPTURE_ERROR_BACKOFF: Duration = Duration::from_millis(5);

/// The exclusive upper bound for the per-channel random port offsets.
pub(crate) const MAX_PORT_OFFSET: u16 = 1024;

/// The base UDP source port for probe packets.
pub(crate) const UDP_PROBE_SRC_PORT: u16 = 62000;

/// The base UDP destination port for probe packets.
///
/// Offsets keep the destination within the conventional traceroute port
/// range.
pub(crate) const UDP_PROBE_DEST_PORT: u16 = 33434;

/// The payload carried by path discovery probe packets.
pub(crate) const DISCOVERY_PAYLOAD: &[u8] = b"Hello";

/// The port used for the UDP connect trick when discovering a source address.
pub(crate) const SOURCE_DISCOVERY_PORT: u16 = 80;

/// The TTL used for encapsulating and carrier headers.
pub(crate) const ENCAP_TTL: u8 = 255;
