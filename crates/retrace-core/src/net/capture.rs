use crate::config::ChannelConfig;
use crate::error::Result;
use crate::packet::CapturedPacket;
use pcap::{Capture, Linktype};
use std::io::ErrorKind;

// Datalink types we know how to strip framing for.
const DLT_NULL: i32 = 0;
const DLT_EN10MB: i32 = 1;
const DLT_RAW: i32 = 12;
const DLT_LOOP: i32 = 108;
const DLT_LINUX_SLL: i32 = 113;
const DLT_IPV4: i32 = 228;
const DLT_LINUX_SLL2: i32 = 276;

const ETHERTYPE_IPV4: u16 = 0x0800;

/// An error from a capture handle.
#[derive(Debug)]
pub(crate) enum CaptureError {
    /// The handle is gone; the reader should exit.
    Closed,
    /// Anything else; the reader backs off briefly and retries.
    Unknown(String),
}

/// A source of captured packets.
///
/// `next_packet` returns `Ok(None)` when the poll timed out or the frame was
/// not deliverable (non-IP), distinguishing quiet periods from errors.
pub(crate) trait PacketSource: Send {
    fn next_packet(&mut self) -> std::result::Result<Option<CapturedPacket>, CaptureError>;
}

/// A pcap-backed packet source bound to one device.
pub(crate) struct PcapSource {
    capture: Capture<pcap::Active>,
    datalink: Linktype,
}

impl PcapSource {
    /// Open and activate a capture handle per the channel configuration.
    pub fn open(device: &str, config: &ChannelConfig) -> Result<Self> {
        let mut capture = Capture::from_device(device)?
            .immediate_mode(true)
            .snaplen(config.snaplen)
            .buffer_size(config.buffer_size)
            .timeout(config.read_timeout.as_millis() as i32)
            .open()?;
        if !config.filter.is_empty() {
            capture.filter(&config.filter, true)?;
        }
        let datalink = capture.get_datalink();
        tracing::debug!(device, ?datalink, filter = %config.filter, "capture handle open");
        Ok(Self { capture, datalink })
    }
}

impl PacketSource for PcapSource {
    fn next_packet(&mut self) -> std::result::Result<Option<CapturedPacket>, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(strip_link_layer(packet.data, self.datalink).map(CapturedPacket::new)),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            // EAGAIN-class conditions retry immediately, like a quiet poll.
            Err(pcap::Error::IoError(ErrorKind::WouldBlock | ErrorKind::Interrupted)) => Ok(None),
            Err(err) => Err(classify_capture_error(&err)),
        }
    }
}

/// Classify a capture error as terminal or retryable.
///
/// The terminal set mirrors stale-handle conditions: a closed or invalid
/// descriptor, end of stream, or a handle that can make no further progress.
fn classify_capture_error(err: &pcap::Error) -> CaptureError {
    match err {
        pcap::Error::NoMorePackets => CaptureError::Closed,
        pcap::Error::IoError(kind) => match kind {
            ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof | ErrorKind::NotConnected => {
                CaptureError::Closed
            }
            _ => CaptureError::Unknown(err.to_string()),
        },
        pcap::Error::PcapError(message) => {
            let lower = message.to_lowercase();
            if lower.contains("closed")
                || lower.contains("bad file descriptor")
                || lower.contains("no longer valid")
            {
                CaptureError::Closed
            } else {
                CaptureError::Unknown(message.clone())
            }
        }
        _ => CaptureError::Unknown(err.to_string()),
    }
}

/// Strip the link-layer framing, returning bytes from the IP header onward,
/// or `None` for frames that do not carry IPv4.
fn strip_link_layer(data: &[u8], datalink: Linktype) -> Option<Vec<u8>> {
    let offset = match datalink.0 {
        DLT_RAW | DLT_IPV4 => 0,
        DLT_NULL | DLT_LOOP => 4,
        DLT_EN10MB => {
            let ethertype = u16::from_be_bytes([*data.get(12)?, *data.get(13)?]);
            if ethertype != ETHERTYPE_IPV4 {
                return None;
            }
            14
        }
        DLT_LINUX_SLL => 16,
        DLT_LINUX_SLL2 => 20,
        _ => return None,
    };
    let ip = data.get(offset..)?;
    (!ip.is_empty() && ip[0] >> 4 == 4).then(|| ip.to_vec())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{CaptureError, PacketSource};
    use crate::packet::CapturedPacket;
    use crossbeam_channel::{Receiver, RecvTimeoutError};
    use std::time::Duration;

    /// A packet source fed from a channel, standing in for a capture handle.
    pub(crate) struct QueueSource {
        queue: Receiver<Vec<u8>>,
    }

    impl QueueSource {
        pub fn new(queue: Receiver<Vec<u8>>) -> Self {
            Self { queue }
        }
    }

    impl PacketSource for QueueSource {
        fn next_packet(&mut self) -> Result<Option<CapturedPacket>, CaptureError> {
            match self.queue.recv_timeout(Duration::from_millis(10)) {
                Ok(bytes) => Ok(Some(CapturedPacket::new(bytes))),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
            }
        }
    }
}
