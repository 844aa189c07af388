use std::{
    io,
    mem::size_of,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    os::fd::{AsRawFd, FromRawFd},
};

use tracing::debug;

use crate::NetError;

/// Builds the multicast receiver socket: `SO_REUSEADDR` (several peers on
/// one host share the group port), bound to `INADDR_ANY:port`, joined to the
/// group on all interfaces, nonblocking.
///
/// The reuse option must be set between `socket(2)` and `bind(2)`, which the
/// std constructors cannot express, so the socket is created raw.
pub fn mcast_receiver_socket(group: Ipv4Addr, port: u16) -> Result<mio::net::UdpSocket, NetError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP) };
    if fd < 0 {
        return Err(NetError::Socket(io::Error::last_os_error()));
    }
    // owns the descriptor from here on; drop closes it on every error path
    let sock = unsafe { UdpSocket::from_raw_fd(fd) };

    set_reuse_addr(&sock).map_err(NetError::Socket)?;

    let bind_addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            std::ptr::addr_of!(bind_addr).cast::<libc::sockaddr>(),
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(NetError::Bind {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            source: io::Error::last_os_error(),
        });
    }

    sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|source| NetError::MulticastJoin { group, source })?;
    sock.set_nonblocking(true).map_err(NetError::Socket)?;

    debug!(%group, port, "multicast receiver established");
    Ok(mio::net::UdpSocket::from_std(sock))
}

fn set_reuse_addr(sock: &UdpSocket) -> io::Result<()> {
    let yes: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(yes).cast::<libc::c_void>(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Multicast sender: TTL 2, otherwise unbound; the destination rides with
/// every `send_to`. Datagram sends bypass the selector entirely and may be
/// issued straight from the application thread.
pub struct McastSender {
    sock: UdpSocket,
    dest: SocketAddrV4,
}

impl McastSender {
    pub fn new(group: Ipv4Addr, port: u16) -> Result<Self, NetError> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(NetError::Socket)?;
        sock.set_multicast_ttl_v4(2).map_err(NetError::Socket)?;
        sock.set_nonblocking(true).map_err(NetError::Socket)?;
        debug!(%group, port, "multicast sender established");
        Ok(Self { sock, dest: SocketAddrV4::new(group, port) })
    }

    /// One datagram, one `sendto`; failure is surfaced, never retried.
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        self.sock.send_to(frame, self.dest).map_err(NetError::Datagram)?;
        Ok(())
    }

    pub fn dest(&self) -> SocketAddrV4 {
        self.dest
    }
}
