use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// The signature prefixed to every probe payload.
pub const PACKET_SIGNATURE: [u8; 4] = *b"moby";

/// The size of the payload correlation key: the signature plus a raw UUID.
pub const WIRE_KEY_SIZE: usize = PACKET_SIGNATURE.len() + 16;

/// The 2-byte signature stamped into the IPv4 identification field of
/// round-trip headers, matched by `ip[4:2]` in the reference BPF filter.
pub const SIGNATURE_V4: u16 = u16::from_be_bytes([PACKET_SIGNATURE[0], PACKET_SIGNATURE[1]]);

/// The 4-byte signature matched by `ip6[48:4]` (the first payload bytes after
/// the IPv6 and UDP headers) in the reference BPF filter.
pub const SIGNATURE_V6: u32 = u32::from_be_bytes(PACKET_SIGNATURE);

/// The record carried by a round-trip probe packet.
///
/// Field names follow the JSON wire format.  Timestamps are UTC and are
/// stamped by the prober, not parsed from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoomerangPayload {
    /// The terminus of the probed path.
    #[serde(rename = "DestIP")]
    pub dest_ip: Ipv4Addr,
    /// The probe id (a UUID string), unique per probe.
    #[serde(rename = "ID")]
    pub id: String,
    /// When the probe was transmitted.
    #[serde(rename = "TxTimestamp")]
    pub tx_timestamp: Option<DateTime<Utc>>,
    /// When the probe arrived back.
    #[serde(rename = "RxTimestamp")]
    pub rx_timestamp: Option<DateTime<Utc>>,
}

impl BoomerangPayload {
    #[must_use]
    pub fn new(dest_ip: Ipv4Addr, id: &Uuid) -> Self {
        Self {
            dest_ip,
            id: id.to_string(),
            tx_timestamp: None,
            rx_timestamp: None,
        }
    }
}

/// Serialize a payload for the wire: signature, raw UUID, JSON record.
///
/// The leading [`WIRE_KEY_SIZE`] bytes are the correlation key used by the
/// hash table and the reply predicate.
pub fn encode_payload(payload: &BoomerangPayload, id: &Uuid) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(payload)?;
    let mut bytes = Vec::with_capacity(WIRE_KEY_SIZE + json.len());
    bytes.extend_from_slice(&PACKET_SIGNATURE);
    bytes.extend_from_slice(id.as_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Deserialize a wire payload produced by [`encode_payload`].
pub fn decode_payload(bytes: &[u8]) -> Result<BoomerangPayload> {
    if bytes.len() < WIRE_KEY_SIZE || bytes[..PACKET_SIGNATURE.len()] != PACKET_SIGNATURE {
        return Err(Error::MalformedPayload);
    }
    Ok(serde_json::from_slice(&bytes[WIRE_KEY_SIZE..])?)
}

/// The correlation key of a wire payload, if present.
#[must_use]
pub fn wire_key(bytes: &[u8]) -> Option<&[u8]> {
    (bytes.len() >= WIRE_KEY_SIZE && bytes[..PACKET_SIGNATURE.len()] == PACKET_SIGNATURE)
        .then(|| &bytes[..WIRE_KEY_SIZE])
}

/// How a boomerang probe concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoomerangStatus {
    /// The probe returned to the origin.
    Ok,
    /// No matching packet arrived within the probe timeout.
    TimedOut,
    /// The probe could not be transmitted.
    SendError,
    /// The probe could not be set up; the path is not probeable.
    Fatal,
}

/// The completion of one boomerang probe.
///
/// `payload.dest_ip` is always populated, including on timeout and send
/// error, so losses can be attributed to a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoomerangResult {
    pub payload: BoomerangPayload,
    pub error: Option<String>,
    pub status: BoomerangStatus,
}

impl BoomerangResult {
    pub(crate) fn ok(payload: BoomerangPayload) -> Self {
        Self {
            payload,
            error: None,
            status: BoomerangStatus::Ok,
        }
    }

    pub(crate) fn timed_out(
        dest_ip: Ipv4Addr,
        tx_timestamp: DateTime<Utc>,
        rx_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            payload: BoomerangPayload {
                dest_ip,
                id: String::new(),
                tx_timestamp: Some(tx_timestamp),
                rx_timestamp: Some(rx_timestamp),
            },
            error: Some(format!("timed out waiting for packet from {dest_ip}")),
            status: BoomerangStatus::TimedOut,
        }
    }

    pub(crate) fn send_error(
        dest_ip: Ipv4Addr,
        tx_timestamp: DateTime<Utc>,
        error: String,
    ) -> Self {
        Self {
            payload: BoomerangPayload {
                dest_ip,
                id: String::new(),
                tx_timestamp: Some(tx_timestamp),
                rx_timestamp: None,
            },
            error: Some(error),
            status: BoomerangStatus::SendError,
        }
    }

    pub(crate) fn fatal(dest_ip: Ipv4Addr, error: String) -> Self {
        Self {
            payload: BoomerangPayload {
                dest_ip,
                id: String::new(),
                tx_timestamp: None,
                rx_timestamp: None,
            },
            error: Some(error),
            status: BoomerangStatus::Fatal,
        }
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.status, BoomerangStatus::Ok)
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.status, BoomerangStatus::Fatal)
    }

    /// The observed round trip time, when both timestamps are present.
    #[must_use]
    pub fn round_trip_time(&self) -> Option<chrono::Duration> {
        match (self.payload.tx_timestamp, self.payload.rx_timestamp) {
            (Some(tx), Some(rx)) => Some(rx - tx),
            _ => None,
        }
    }
}
