use crate::error::{IoError, IoOperation, IoResult};
use socket2::{Domain, Protocol, SockAddr, Type};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// A send-side socket.
///
/// Raw sockets are created with `IPPROTO_RAW`, so every send supplies the
/// full IP packet (`IP_HDRINCL`).
#[cfg_attr(test, mockall::automock)]
pub trait Socket
where
    Self: Sized,
{
    /// Create an IPv4 raw socket for sending crafted packets.
    fn new_raw_send_socket_ipv4() -> IoResult<Self>;
    /// Create an IPv6 raw socket for sending crafted packets.
    fn new_raw_send_socket_ipv6() -> IoResult<Self>;
    /// Create a (non-raw) IPv4/UDP socket for source address discovery.
    fn new_udp_dgram_socket_ipv4() -> IoResult<Self>;
    fn connect(&mut self, address: SocketAddr) -> IoResult<()>;
    fn local_addr(&mut self) -> IoResult<Option<SocketAddr>>;
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> IoResult<usize>;
    /// The OS-level descriptor, used to detect stale failure notices when
    /// the socket is rotated.
    fn raw_fd(&self) -> RawFd;
}

/// A network socket.
pub struct SocketImpl {
    inner: socket2::Socket,
}

impl SocketImpl {
    fn new(domain: Domain, ty: Type, protocol: Protocol) -> IoResult<Self> {
        Ok(Self {
            inner: socket2::Socket::new(domain, ty, Some(protocol))
                .map_err(|err| IoError::Other(err, IoOperation::NewSocket))?,
        })
    }
}

impl Socket for SocketImpl {
    fn new_raw_send_socket_ipv4() -> IoResult<Self> {
        let socket = Self::new(Domain::IPV4, Type::RAW, Protocol::from(libc::IPPROTO_RAW))?;
        socket
            .inner
            .set_header_included(true)
            .map_err(|err| IoError::Other(err, IoOperation::SetHeaderIncluded))?;
        Ok(socket)
    }

    fn new_raw_send_socket_ipv6() -> IoResult<Self> {
        // IPV6_HDRINCL is not portable across targets; IPPROTO_RAW sends
        // already include the header.
        Self::new(Domain::IPV6, Type::RAW, Protocol::from(libc::IPPROTO_RAW))
    }

    fn new_udp_dgram_socket_ipv4() -> IoResult<Self> {
        Self::new(Domain::IPV4, Type::DGRAM, Protocol::UDP)
    }

    fn connect(&mut self, address: SocketAddr) -> IoResult<()> {
        self.inner
            .connect(&SockAddr::from(address))
            .map_err(|err| IoError::Connect(err, address))
    }

    fn local_addr(&mut self) -> IoResult<Option<SocketAddr>> {
        Ok(self
            .inner
            .local_addr()
            .map_err(|err| IoError::Other(err, IoOperation::LocalAddr))?
            .as_socket())
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> IoResult<usize> {
        self.inner
            .send_to(buf, &SockAddr::from(addr))
            .map_err(|err| IoError::SendTo(err, addr))
    }

    fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
