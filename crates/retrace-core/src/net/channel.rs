use crate::config::ChannelConfig;
use crate::constants::{
    MAX_PORT_OFFSET, RECV_QUEUE_CAPACITY, UDP_PROBE_DEST_PORT, UDP_PROBE_SRC_PORT,
    UNKNOWN_CAPTURE_ERROR_BACKOFF,
};
use crate::error::{Error, IoResult, Result};
use crate::hash::{HashTable, PacketHash, PacketHasher};
use crate::listener::{Listener, ListenerTable};
use crate::net::capture::{CaptureError, PacketSource};
use crate::net::socket::Socket;
use crate::net::source;
use crate::packet::CapturedPacket;
use crate::path::Path;
use crate::types::Port;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::instrument;

/// How long blocked internal queue operations wait before re-checking for
/// shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Counters exposed by [`TransportChannel::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Packets read from all capture handles.
    pub packets_received: u64,
    /// Capture reader retries after unrecognized errors.
    pub capture_retries: u64,
    /// Listener deliveries dropped due to full queues.
    pub listener_drops: u64,
    /// Hash deliveries dropped due to full queues.
    pub hash_drops: u64,
}

#[derive(Default)]
struct Metrics {
    packets_received: AtomicU64,
    capture_retries: AtomicU64,
}

/// A channel for sending crafted packets and receiving captured ones.
///
/// The channel owns one capture handle per configured device, an IPv4 and an
/// IPv6 raw send socket, and the listener and hash dispatch tables.  Handles
/// are cheaply cloneable and shareable across threads; [`close`] releases
/// all resources.
///
/// [`close`]: TransportChannel::close
pub struct TransportChannel<S: Socket = crate::net::socket::SocketImpl> {
    inner: Arc<ChannelInner<S>>,
}

impl<S: Socket> Clone for TransportChannel<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ChannelInner<S> {
    config: ChannelConfig,
    listeners: Arc<ListenerTable>,
    hashes: Arc<HashTable>,
    v4_socket: Arc<Mutex<S>>,
    v4_failures: Sender<RawFd>,
    v6_socket: Arc<Mutex<S>>,
    v6_failures: Sender<RawFd>,
    rx: Mutex<Option<Receiver<CapturedPacket>>>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    src_port_offset: u16,
    dest_port_offset: u16,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<S> Drop for ChannelInner<S> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl<S: Socket + Send + 'static> TransportChannel<S> {
    /// Bring up a channel over already-constructed capture sources and send
    /// sockets.
    ///
    /// Spawns one capture reader per source feeding the shared receive
    /// queue, a repair task per send socket, and, if configured, the
    /// dispatch task.
    pub(crate) fn start(
        config: ChannelConfig,
        sources: Vec<Box<dyn PacketSource>>,
        v4_socket: S,
        v6_socket: S,
        hashers: Vec<PacketHasher>,
    ) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let listeners = Arc::new(ListenerTable::new());
        let hashes = Arc::new(HashTable::new());
        for hasher in hashers {
            hashes.attach_hasher(hasher);
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Metrics::default());
        let (packet_tx, packet_rx) = bounded(RECV_QUEUE_CAPACITY);
        let mut threads = Vec::new();
        for source in sources {
            let tx = packet_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            let metrics = Arc::clone(&metrics);
            threads.push(thread::spawn(move || {
                run_capture_reader(source, &tx, &shutdown, &metrics);
            }));
        }
        drop(packet_tx);
        let v4_socket = Arc::new(Mutex::new(v4_socket));
        let v6_socket = Arc::new(Mutex::new(v6_socket));
        let (v4_failures, v4_failure_rx) = bounded(1);
        let (v6_failures, v6_failure_rx) = bounded(1);
        {
            let socket = Arc::clone(&v4_socket);
            let shutdown = Arc::clone(&shutdown);
            threads.push(thread::spawn(move || {
                run_socket_repair(&socket, &v4_failure_rx, S::new_raw_send_socket_ipv4, &shutdown);
            }));
        }
        {
            let socket = Arc::clone(&v6_socket);
            let shutdown = Arc::clone(&shutdown);
            threads.push(thread::spawn(move || {
                run_socket_repair(&socket, &v6_failure_rx, S::new_raw_send_socket_ipv6, &shutdown);
            }));
        }
        let rx = if config.use_listeners {
            let listeners = Arc::clone(&listeners);
            let hashes = Arc::clone(&hashes);
            threads.push(thread::spawn(move || {
                run_dispatch(&packet_rx, &listeners, &hashes);
            }));
            None
        } else {
            Some(packet_rx)
        };
        Ok(Self {
            inner: Arc::new(ChannelInner {
                config,
                listeners,
                hashes,
                v4_socket,
                v4_failures,
                v6_socket,
                v6_failures,
                rx: Mutex::new(rx),
                shutdown,
                metrics,
                src_port_offset: rng.gen_range(0..MAX_PORT_OFFSET),
                dest_port_offset: rng.gen_range(0..MAX_PORT_OFFSET),
                threads: Mutex::new(threads),
            }),
        })
    }

    /// Send a crafted packet to the given address over the raw socket for
    /// its family.
    ///
    /// A send failure queues the socket for repair and surfaces the error;
    /// subsequent sends may succeed once the socket has been rotated.
    #[instrument(skip(self, packet_data), level = "trace")]
    pub fn send_to(&self, packet_data: &[u8], dest: IpAddr) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        let (socket, failures) = match dest {
            IpAddr::V4(_) => (&self.inner.v4_socket, &self.inner.v4_failures),
            IpAddr::V6(_) => (&self.inner.v6_socket, &self.inner.v6_failures),
        };
        let mut guard = socket.lock();
        match guard.send_to(packet_data, SocketAddr::new(dest, 0)) {
            Ok(_) => Ok(()),
            Err(err) => {
                let broken_fd = guard.raw_fd();
                drop(guard);
                let _ = failures.try_send(broken_fd);
                tracing::debug!(%err, broken_fd, "send failed, queued socket for repair");
                Err(Error::Io(err))
            }
        }
    }

    /// Send a crafted packet to the first real hop of the path.
    pub fn send_to_path(&self, packet_data: &[u8], path: &Path) -> Result<()> {
        if path.len() < 2 {
            return Err(Error::PathTooShort(2));
        }
        self.send_to(packet_data, IpAddr::V4(path[1]))
    }

    /// Register a listener for packets matching `predicate`.
    ///
    /// The registration is visible to the dispatch task before this
    /// returns, so a probe may transmit immediately afterwards.
    pub fn register_listener<P>(&self, predicate: P) -> Listener
    where
        P: Fn(&CapturedPacket) -> bool + Send + Sync + 'static,
    {
        self.inner.listeners.register(predicate)
    }

    /// Unregister a listener, closing its queue.
    pub fn unregister_listener(&self, listener: &Listener) -> bool {
        self.inner.listeners.unregister(listener)
    }

    /// Register interest in a packet fingerprint.
    pub fn register_hash(&self, hash: PacketHash) -> Receiver<CapturedPacket> {
        self.inner.hashes.register(hash)
    }

    /// Unregister a packet fingerprint, closing its queue.
    pub fn unregister_hash(&self, hash: &PacketHash) -> bool {
        self.inner.hashes.unregister(hash)
    }

    /// Attach a packet hasher.  Hashers may be expensive: attach only what
    /// is needed.
    pub fn attach_hasher(&self, hasher: PacketHasher) {
        self.inner.hashes.attach_hasher(hasher);
    }

    /// The BPF filter this channel captures with.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.inner.config.filter
    }

    /// The first device this channel captures on.
    #[must_use]
    pub fn interface(&self) -> &str {
        self.inner
            .config
            .devices
            .first()
            .map_or("", String::as_str)
    }

    /// The IPv4 address of the first capture device.
    pub fn find_local_ip(&self) -> Result<Ipv4Addr> {
        source::find_device_ipv4(self.interface())
    }

    /// The local address the routing table selects for `dest`.
    pub fn find_source_ip_for_dest(&self, dest: Ipv4Addr) -> Result<Ipv4Addr> {
        source::discover_source_for_dest::<S>(dest)
    }

    /// Counters for this channel.
    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            packets_received: self.inner.metrics.packets_received.load(Ordering::Relaxed),
            capture_retries: self.inner.metrics.capture_retries.load(Ordering::Relaxed),
            listener_drops: self.inner.listeners.dropped(),
            hash_drops: self.inner.hashes.dropped(),
        }
    }

    /// Shut down the channel: capture readers exit, the dispatch task
    /// drains, and send sockets are released.  Further sends fail.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        let handles = std::mem::take(&mut *self.inner.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// The multiplexed receive queue, available only when the dispatch task
    /// is disabled; listeners are the supported consumption surface.
    pub(crate) fn take_rx(&self) -> Option<Receiver<CapturedPacket>> {
        self.inner.rx.lock().take()
    }

    /// The UDP ports used for probe packets, offset per channel.
    pub(crate) fn udp_probe_ports(&self) -> (Port, Port) {
        (
            Port(UDP_PROBE_SRC_PORT + self.inner.src_port_offset),
            Port(UDP_PROBE_DEST_PORT + self.inner.dest_port_offset),
        )
    }

    /// Fail unless the channel's filter is exactly `expected` and the
    /// dispatch task is running.
    pub(crate) fn require_exact_filter(&self, expected: &str) -> Result<()> {
        if self.filter() != expected {
            return Err(Error::FilterMismatch {
                expected: expected.to_string(),
                actual: self.filter().to_string(),
            });
        }
        if !self.inner.config.use_listeners {
            return Err(Error::ListenersDisabled);
        }
        Ok(())
    }
}

/// Drain one capture source into the shared receive queue.
///
/// Quiet polls retry immediately; terminal capture errors end this reader
/// only; anything unrecognized backs off briefly and retries.
fn run_capture_reader(
    mut source: Box<dyn PacketSource>,
    tx: &Sender<CapturedPacket>,
    shutdown: &AtomicBool,
    metrics: &Metrics,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match source.next_packet() {
            Ok(Some(packet)) => {
                metrics.packets_received.fetch_add(1, Ordering::Relaxed);
                let mut pending = packet;
                loop {
                    match tx.send_timeout(pending, SHUTDOWN_POLL) {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(packet)) => {
                            if shutdown.load(Ordering::Relaxed) {
                                return;
                            }
                            pending = packet;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => return,
                    }
                }
            }
            Ok(None) => {}
            Err(CaptureError::Closed) => {
                tracing::debug!("capture handle closed, reader exiting");
                break;
            }
            Err(CaptureError::Unknown(message)) => {
                tracing::warn!(%message, "unrecognized capture error, backing off");
                metrics.capture_retries.fetch_add(1, Ordering::Relaxed);
                thread::sleep(UNKNOWN_CAPTURE_ERROR_BACKOFF);
            }
        }
    }
}

/// Rotate a send socket when a failure notice arrives.
///
/// Notices carrying a descriptor other than the currently-held one refer to
/// an already-replaced socket and are ignored.
fn run_socket_repair<S: Socket>(
    socket: &Mutex<S>,
    failures: &Receiver<RawFd>,
    make: fn() -> IoResult<S>,
    shutdown: &AtomicBool,
) {
    loop {
        match failures.recv_timeout(SHUTDOWN_POLL) {
            Ok(broken_fd) => {
                let mut guard = socket.lock();
                if guard.raw_fd() != broken_fd {
                    continue;
                }
                tracing::info!(broken_fd, "renewing raw send socket");
                match make() {
                    Ok(fresh) => *guard = fresh,
                    Err(err) => tracing::warn!(%err, "failed to renew raw send socket"),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Fan captured packets out to the hash and listener tables.
///
/// Both tables may match the same packet; all deliveries are non-blocking so
/// neither table can stall the other.
fn run_dispatch(
    rx: &Receiver<CapturedPacket>,
    listeners: &ListenerTable,
    hashes: &HashTable,
) {
    for packet in rx.iter() {
        hashes.dispatch(&packet);
        listeners.dispatch(&packet);
    }
}
