use crate::constants::SOURCE_DISCOVERY_PORT;
use crate::error::{Error, Result};
use crate::net::socket::Socket;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Discover the local address the routing table selects for `dest`.
///
/// Note that no packets are transmitted by this method.
pub(crate) fn discover_source_for_dest<S: Socket>(dest: Ipv4Addr) -> Result<Ipv4Addr> {
    let mut socket = S::new_udp_dgram_socket_ipv4()?;
    socket.connect(SocketAddr::new(IpAddr::V4(dest), SOURCE_DISCOVERY_PORT))?;
    match socket.local_addr()?.ok_or(Error::MissingAddr)?.ip() {
        IpAddr::V4(addr) => Ok(addr),
        IpAddr::V6(_) => Err(Error::MissingAddr),
    }
}

/// The first IPv4 address assigned to the named capture device.
pub(crate) fn find_device_ipv4(device: &str) -> Result<Ipv4Addr> {
    let found = pcap::Device::list()?
        .into_iter()
        .find(|candidate| candidate.name == device)
        .ok_or_else(|| Error::UnknownInterface(device.to_string()))?;
    found
        .addresses
        .iter()
        .find_map(|address| match address.addr {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::UnknownInterface(device.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoError;
    use crate::net::socket::MockSocket;
    use parking_lot::Mutex;
    use std::io;

    // The mock context for the static constructor is process-global.
    static CONTEXT_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_discover_source_for_dest() {
        let _lock = CONTEXT_LOCK.lock();
        let ctx = MockSocket::new_udp_dgram_socket_ipv4_context();
        ctx.expect().returning(|| {
            let mut socket = MockSocket::new();
            socket.expect_connect().returning(|_| Ok(()));
            socket.expect_local_addr().returning(|| {
                Ok(Some(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
                    0,
                )))
            });
            Ok(socket)
        });
        let addr = discover_source_for_dest::<MockSocket>(Ipv4Addr::new(1, 1, 1, 1)).unwrap();
        assert_eq!(Ipv4Addr::new(10, 0, 0, 9), addr);
    }

    #[test]
    fn test_discover_source_missing_addr() {
        let _lock = CONTEXT_LOCK.lock();
        let ctx = MockSocket::new_udp_dgram_socket_ipv4_context();
        ctx.expect().returning(|| {
            let mut socket = MockSocket::new();
            socket.expect_connect().returning(|_| Ok(()));
            socket.expect_local_addr().returning(|| Ok(None));
            Ok(socket)
        });
        let err = discover_source_for_dest::<MockSocket>(Ipv4Addr::new(1, 1, 1, 1)).unwrap_err();
        assert!(matches!(err, Error::MissingAddr));
    }

    #[test]
    fn test_discover_source_connect_error() {
        let _lock = CONTEXT_LOCK.lock();
        let ctx = MockSocket::new_udp_dgram_socket_ipv4_context();
        ctx.expect().returning(|| {
            let mut socket = MockSocket::new();
            socket.expect_connect().returning(|addr| {
                Err(IoError::Connect(
                    io::Error::from_raw_os_error(libc::ENETUNREACH),
                    addr,
                ))
            });
            Ok(socket)
        });
        let err = discover_source_for_dest::<MockSocket>(Ipv4Addr::new(1, 1, 1, 1)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
