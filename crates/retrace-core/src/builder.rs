use crate::config::{defaults, ChannelConfig};
use crate::error::Result;
use crate::hash::{boomerang_packet_hasher, PacketHasher};
use crate::net::capture::{PacketSource, PcapSource};
use crate::net::channel::TransportChannel;
use crate::net::socket::{Socket, SocketImpl};
use crate::payload::{SIGNATURE_V4, SIGNATURE_V6};
use std::fmt::{Debug, Formatter};
use std::process::Command;
use std::time::Duration;

/// The interface name that triggers adjacency-based device enumeration.
const BSD_ANY: &str = "bsdany";

/// A builder for creating instances of [`TransportChannel`].
///
/// # Examples
///
/// A channel suitable for path discovery:
///
/// ```no_run
/// # fn main() -> Result<(), retrace_core::Error> {
/// use retrace_core::Builder;
///
/// let channel = Builder::new().bpf_filter("icmp").interface("eth0").build()?;
/// # Ok(())
/// # }
/// ```
///
/// A channel preconfigured for boomerang probing:
///
/// ```no_run
/// # fn main() -> Result<(), retrace_core::Error> {
/// use retrace_core::Builder;
///
/// let channel = Builder::new().boomerang().build()?;
/// # Ok(())
/// # }
/// ```
pub struct Builder {
    filter: String,
    interface: String,
    timeout: Duration,
    snaplen: i32,
    buffer_size: i32,
    use_listeners: bool,
    hashers: Vec<PacketHasher>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            filter: String::from(defaults::DEFAULT_BPF_FILTER),
            interface: String::from(defaults::DEFAULT_INTERFACE),
            timeout: defaults::DEFAULT_READ_TIMEOUT,
            snaplen: defaults::DEFAULT_SNAPLEN,
            buffer_size: defaults::DEFAULT_BUFFER_SIZE,
            use_listeners: defaults::DEFAULT_USE_LISTENERS,
            hashers: Vec::new(),
        }
    }
}

impl Builder {
    /// Initialize a new `Builder` with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the kernel-side capture filter.
    #[must_use]
    pub fn bpf_filter<F: Into<String>>(mut self, filter: F) -> Self {
        self.filter = filter.into();
        self
    }

    /// Set the device to capture and send on.
    ///
    /// The special value `"bsdany"` enumerates devices from the IS-IS
    /// adjacency table instead of naming one.
    #[must_use]
    pub fn interface<I: Into<String>>(mut self, interface: I) -> Self {
        self.interface = interface.into();
        self
    }

    /// Set the capture poll timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the capture truncation length.
    #[must_use]
    pub const fn snaplen(mut self, snaplen: i32) -> Self {
        self.snaplen = snaplen;
        self
    }

    /// Set the capture ring buffer size.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: i32) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Enable or disable the dispatch task.  Listener and hash registration
    /// only deliver while it is enabled.
    #[must_use]
    pub const fn use_listeners(mut self, use_listeners: bool) -> Self {
        self.use_listeners = use_listeners;
        self
    }

    /// Attach an additional packet hasher.  Hashers may be expensive: attach
    /// only what is needed.
    #[must_use]
    pub fn hasher(mut self, hasher: PacketHasher) -> Self {
        self.hashers.push(hasher);
        self
    }

    /// Preconfigure the channel for boomerang probing: the signature BPF
    /// filter plus the reference payload hasher.
    #[must_use]
    pub fn boomerang(self) -> Self {
        self.bpf_filter(format!(
            "ip[4:2] = {SIGNATURE_V4} || ip6[48:4] = {SIGNATURE_V6}"
        ))
        .hasher(Box::new(boomerang_packet_hasher))
    }

    /// Open the capture handles and raw sockets and bring the channel up.
    ///
    /// This operation requires the `CAP_NET_RAW` capability on Linux.
    pub fn build(self) -> Result<TransportChannel> {
        let config = ChannelConfig {
            filter: self.filter,
            devices: resolve_devices(&self.interface),
            read_timeout: self.timeout,
            snaplen: self.snaplen,
            buffer_size: self.buffer_size,
            use_listeners: self.use_listeners,
        };
        tracing::debug!(?config, "building transport channel");
        let mut sources: Vec<Box<dyn PacketSource>> = Vec::with_capacity(config.devices.len());
        for device in &config.devices {
            sources.push(Box::new(PcapSource::open(device, &config)?));
        }
        let v4_socket = SocketImpl::new_raw_send_socket_ipv4()?;
        let v6_socket = SocketImpl::new_raw_send_socket_ipv6()?;
        TransportChannel::start(config, sources, v4_socket, v6_socket, self.hashers)
    }
}

impl Debug for Builder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("filter", &self.filter)
            .field("interface", &self.interface)
            .field("timeout", &self.timeout)
            .field("snaplen", &self.snaplen)
            .field("buffer_size", &self.buffer_size)
            .field("use_listeners", &self.use_listeners)
            .field("hashers", &self.hashers.len())
            .finish()
    }
}

/// Resolve the configured interface to concrete device names.
fn resolve_devices(interface: &str) -> Vec<String> {
    if interface != BSD_ANY {
        return vec![interface.to_string()];
    }
    let output = match Command::new("cli").args(["-c", "show isis adjacency"]).output() {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(%err, "failed to show adjacencies, falling back to default device");
            return vec![String::from(defaults::DEFAULT_INTERFACE)];
        }
    };
    let devices = parse_adjacency_devices(&String::from_utf8_lossy(&output.stdout));
    if devices.is_empty() {
        tracing::warn!("no adjacent devices found, falling back to default device");
        return vec![String::from(defaults::DEFAULT_INTERFACE)];
    }
    tracing::debug!(?devices, "listening on adjacent devices");
    devices
}

/// Parse device names out of `show isis adjacency` output: the header line
/// is skipped, rows have five whitespace-separated fields, and the device is
/// the first field with any `.0` suffix stripped.
fn parse_adjacency_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 {
                return None;
            }
            let device = fields[0].replace(".0", "");
            (!device.is_empty()).then_some(device)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_adjacency_devices() {
        let output = "\
Interface             System         L State         Hold (secs) SNPA
ae0.0                 core1          2  Up                    24
et-0/0/1.0            core2          2  Up                    21  0:11:22:33:44:55
";
        // Only the five-field row survives, with its `.0` unit stripped.
        assert_eq!(vec![String::from("ae0")], parse_adjacency_devices(output));
    }

    #[test]
    fn test_parse_adjacency_devices_empty() {
        assert!(parse_adjacency_devices("").is_empty());
        assert!(parse_adjacency_devices("Interface System L State Hold\n").is_empty());
    }

    #[test]
    fn test_resolve_named_device() {
        assert_eq!(vec![String::from("eth0")], resolve_devices("eth0"));
    }

    #[test]
    fn test_builder_defaults() {
        let builder = Builder::new();
        assert_eq!(defaults::DEFAULT_BPF_FILTER, builder.filter);
        assert_eq!(defaults::DEFAULT_INTERFACE, builder.interface);
        assert_eq!(defaults::DEFAULT_READ_TIMEOUT, builder.timeout);
        assert_eq!(defaults::DEFAULT_SNAPLEN, builder.snaplen);
        assert_eq!(defaults::DEFAULT_BUFFER_SIZE, builder.buffer_size);
        assert!(builder.use_listeners);
        assert!(builder.hashers.is_empty());
    }

    #[test]
    fn test_boomerang_preset() {
        let builder = Builder::new().boomerang();
        assert_eq!("ip[4:2] = 28015 || ip6[48:4] = 1836016249", builder.filter);
        assert_eq!(1, builder.hashers.len());
    }
}
