//! UDP socket construction for RTP and SAP senders.
//!
//! Creating, binding and switching to non-blocking are hard failures. The
//! remaining options (TTL, loopback, TOS, interface, send timeout) are applied
//! best-effort and only logged when the platform refuses them.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

use crate::config::StreamConfig;
use crate::SEND_TIMEOUT_MS;

/// Options for an outgoing multicast socket
#[derive(Debug, Clone)]
pub(crate) struct MulticastOptions {
    pub ttl: u32,
    /// DSCP code point, shifted into the TOS byte
    pub dscp: Option<u8>,
    pub interface: Option<Ipv4Addr>,
    pub loopback: bool,
    pub write_timeout: Option<Duration>,
}

impl From<&StreamConfig> for MulticastOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            ttl: config.ttl,
            dscp: Some(config.dscp),
            interface: config.interface,
            loopback: config.multicast_loopback,
            write_timeout: Some(Duration::from_millis(SEND_TIMEOUT_MS)),
        }
    }
}

/// Create the non-blocking RTP socket for a stream
pub(crate) fn create_stream_socket(config: &StreamConfig) -> io::Result<UdpSocket> {
    create_multicast_sender(&MulticastOptions::from(config))
}

/// Create a non-blocking UDP socket for sending to a multicast group
pub(crate) fn create_multicast_sender(opts: &MulticastOptions) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    let bind_addr = opts.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.bind(&SockAddr::from(SocketAddrV4::new(bind_addr, 0)))?;

    socket.set_nonblocking(true)?;

    let socket: UdpSocket = socket.into();

    if let Err(e) = set_ttl(&socket, opts.ttl) {
        log::warn!("Failed to set multicast TTL {}: {}", opts.ttl, e);
    }
    if let Err(e) = set_multicast_loopback(&socket, opts.loopback) {
        log::warn!("Failed to set multicast loopback: {}", e);
    }
    if let Some(dscp) = opts.dscp {
        if let Err(e) = set_dscp(&socket, dscp) {
            log::warn!("Failed to set DSCP {}: {}", dscp, e);
        }
    }
    if let Some(iface) = opts.interface {
        if let Err(e) = set_interface(&socket, iface) {
            log::warn!("Failed to set multicast interface {}: {}", iface, e);
        }
    }
    if let Some(timeout) = opts.write_timeout {
        if let Err(e) = socket.set_write_timeout(Some(timeout)) {
            log::warn!("Failed to set send timeout: {}", e);
        }
    }

    Ok(socket)
}

pub(crate) fn set_ttl(socket: &UdpSocket, ttl: u32) -> io::Result<()> {
    SockRef::from(socket).set_multicast_ttl_v4(ttl)
}

/// Mark outgoing packets with a DSCP code point (upper six bits of TOS)
pub(crate) fn set_dscp(socket: &UdpSocket, dscp: u8) -> io::Result<()> {
    let tos = ((dscp & 0x3F) as u32) << 2;
    SockRef::from(socket).set_tos(tos)
}

pub(crate) fn set_interface(socket: &UdpSocket, interface: Ipv4Addr) -> io::Result<()> {
    SockRef::from(socket).set_multicast_if_v4(&interface)
}

pub(crate) fn set_multicast_loopback(socket: &UdpSocket, enabled: bool) -> io::Result<()> {
    SockRef::from(socket).set_multicast_loop_v4(enabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_socket_is_configured() {
        let mut config = StreamConfig::default();
        config.ttl = 4;
        let socket = create_stream_socket(&config).unwrap();

        let sock = SockRef::from(&socket);
        assert_eq!(sock.multicast_ttl_v4().unwrap(), 4);
        assert!(sock.multicast_loop_v4().unwrap());
        assert!(socket.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn test_live_option_updates() {
        let socket = create_stream_socket(&StreamConfig::default()).unwrap();

        set_ttl(&socket, 64).unwrap();
        set_multicast_loopback(&socket, false).unwrap();

        let sock = SockRef::from(&socket);
        assert_eq!(sock.multicast_ttl_v4().unwrap(), 64);
        assert!(!sock.multicast_loop_v4().unwrap());
    }

    #[test]
    fn test_nonblocking_send_to_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = receiver.local_addr().unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();

        let socket = create_stream_socket(&StreamConfig::default()).unwrap();
        assert_eq!(socket.send_to(b"ping", dest).unwrap(), 4);

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
    }
}
