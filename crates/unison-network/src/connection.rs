use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use mio::{
    Interest, Registry, Token,
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, trace, warn};

use crate::{ByteBuf, FrameDecoder, frame::LEN_PREFIX_SIZE};

/// Initial capacity of the receive and send-staging buffers.
pub const BUF_SIZE: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    TcpInbound,
    TcpOutbound,
    McastRecv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnStatus {
    Disconnected,
    Established,
}

/// Classification of a socket syscall result.
///
/// `WouldBlock` is control flow, not an error; the three remaining non-`Ok`
/// outcomes are fatal for a stream and close the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockOutcome {
    Ok,
    WouldBlock,
    PeerClosed,
    Reset,
    Generic,
}

impl SockOutcome {
    fn from_err(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::ConnectionReset => Self::Reset,
            _ => Self::Generic,
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, Self::PeerClosed | Self::Reset | Self::Generic)
    }
}

enum Sock {
    Stream(TcpStream),
    Dgram(UdpSocket),
}

/// A socket plus the framing state machine and per-direction staging buffers.
///
/// Inbound: bytes land in the receive buffer, the decoder reassembles
/// length-prefixed packets out of it, leftovers shorter than a prefix are
/// compacted to the front.
///
/// Outbound (TCP only): fully-framed packets queue up, the staging buffer
/// coalesces several of them per `send(2)`, and the mark lets a partial write
/// resume without re-copying.
pub struct Connection {
    kind: Kind,
    status: ConnStatus,
    sock: Option<Sock>,
    peer_addr: SocketAddr,
    rdn: ByteBuf,
    decoder: FrameDecoder,
    outbound_q: VecDeque<ByteBuf>,
    current: Option<ByteBuf>,
    staging: ByteBuf,
    writable_armed: bool,
}

impl Connection {
    fn new(kind: Kind, sock: Sock, peer_addr: SocketAddr) -> Self {
        Self {
            kind,
            status: ConnStatus::Established,
            sock: Some(sock),
            peer_addr,
            rdn: ByteBuf::new(BUF_SIZE),
            decoder: FrameDecoder::new(),
            outbound_q: VecDeque::new(),
            current: None,
            staging: ByteBuf::new(BUF_SIZE),
            writable_armed: false,
        }
    }

    pub fn tcp_inbound(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self::new(Kind::TcpInbound, Sock::Stream(stream), peer_addr)
    }

    /// Connects, then switches the stream to nonblocking. A target that is
    /// unreachable within `timeout` is an error; there is no retry.
    pub fn establish_tcp(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nonblocking(true)?;
        debug!(%addr, "connect OK");
        Ok(Self::new(Kind::TcpOutbound, Sock::Stream(TcpStream::from_std(stream)), addr))
    }

    pub fn mcast_receiver(sock: UdpSocket, group: SocketAddr) -> Self {
        Self::new(Kind::McastRecv, Sock::Dgram(sock), group)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self.sock.as_mut() {
            Some(Sock::Stream(s)) => registry.register(s, token, interests),
            Some(Sock::Dgram(s)) => registry.register(s, token, interests),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Drains the socket until `WouldBlock`, handing every completed packet
    /// to `on_pkt`. For datagram sockets the source address of each datagram
    /// rides along with its packets.
    pub fn on_readable<F>(&mut self, mut on_pkt: F) -> SockOutcome
    where
        F: FnMut(ByteBuf, Option<Ipv4Addr>),
    {
        match self.sock {
            Some(Sock::Stream(_)) => self.pump_stream(&mut on_pkt),
            Some(Sock::Dgram(_)) => self.pump_dgram(&mut on_pkt),
            None => SockOutcome::PeerClosed,
        }
    }

    fn pump_stream<F>(&mut self, on_pkt: &mut F) -> SockOutcome
    where
        F: FnMut(ByteBuf, Option<Ipv4Addr>),
    {
        loop {
            self.rdn.set_write_mode();
            let outcome = loop {
                if self.rdn.remaining() == 0 {
                    break SockOutcome::Ok;
                }
                let Some(Sock::Stream(stream)) = self.sock.as_mut() else {
                    return SockOutcome::PeerClosed;
                };
                match stream.read(self.rdn.spare_mut()) {
                    Ok(0) => break SockOutcome::PeerClosed,
                    Ok(n) => self.rdn.advance_write(n),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        break SockOutcome::WouldBlock;
                    }
                    Err(ref e) => {
                        trace!(%e, "stream read");
                        break SockOutcome::from_err(e);
                    }
                }
            };
            self.chase_packets(on_pkt, None);
            match outcome {
                // receive buffer was full; packets are chased out, read on
                SockOutcome::Ok => {}
                other => return other,
            }
        }
    }

    fn pump_dgram<F>(&mut self, on_pkt: &mut F) -> SockOutcome
    where
        F: FnMut(ByteBuf, Option<Ipv4Addr>),
    {
        loop {
            self.rdn.reset();
            let res = {
                let Some(Sock::Dgram(sock)) = &self.sock else {
                    return SockOutcome::PeerClosed;
                };
                sock.recv_from(self.rdn.spare_mut())
            };
            match res {
                Ok((n, src)) => {
                    self.rdn.advance_write(n);
                    let src_ip = match src {
                        SocketAddr::V4(v4) => Some(*v4.ip()),
                        SocketAddr::V6(_) => None,
                    };
                    self.chase_packets(on_pkt, src_ip);
                    if self.decoder.awaiting_body() {
                        warn!(%src, "truncated frame in datagram, discarding");
                    }
                    // datagram boundary == frame boundary
                    self.decoder.reset();
                    self.rdn.reset();
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return SockOutcome::WouldBlock;
                }
                Err(ref e) => {
                    trace!(%e, "datagram recv");
                    return SockOutcome::from_err(e);
                }
            }
        }
    }

    fn chase_packets<F>(&mut self, on_pkt: &mut F, src_ip: Option<Ipv4Addr>)
    where
        F: FnMut(ByteBuf, Option<Ipv4Addr>),
    {
        self.rdn.set_read_mode();
        while let Some(body) = self.decoder.chase(&mut self.rdn) {
            trace!(len = body.limit(), "packet reassembled");
            on_pkt(body, src_ip);
        }
        if self.rdn.available() == 0 {
            self.rdn.reset();
        } else {
            self.rdn.set_mark();
            if self.rdn.available() < LEN_PREFIX_SIZE {
                self.rdn.compact();
            }
        }
    }

    /// Queues an already-framed packet for the coalescing send path.
    pub fn queue_frame(&mut self, frame: ByteBuf) {
        self.outbound_q.push_back(frame);
    }

    pub fn write_idle(&self) -> bool {
        self.staging.available() == 0 &&
            self.outbound_q.is_empty() &&
            !self.current.as_ref().is_some_and(|p| p.available() > 0)
    }

    /// Coalesces queued packets into the staging buffer and writes until
    /// everything is out or the kernel pushes back.
    pub fn flush_outbound(&mut self) -> SockOutcome {
        loop {
            self.fill_staging();
            match self.send_staging() {
                SockOutcome::Ok => {
                    if !self.has_send_work() {
                        return SockOutcome::Ok;
                    }
                }
                other => return other,
            }
        }
    }

    fn has_send_work(&self) -> bool {
        self.current.as_ref().is_some_and(|p| p.available() > 0) || !self.outbound_q.is_empty()
    }

    fn fill_staging(&mut self) {
        self.staging.set_write_mode();
        loop {
            if self.staging.remaining() == 0 {
                break;
            }
            if let Some(pkt) = self.current.as_mut().filter(|p| p.available() > 0) {
                if self.staging.append_no_resize(pkt) == 0 {
                    break;
                }
            } else {
                let Some(mut next) = self.outbound_q.pop_front() else { break };
                next.set_read_mode();
                self.current = Some(next);
            }
        }
    }

    fn send_staging(&mut self) -> SockOutcome {
        self.staging.set_read_mode();
        loop {
            if self.staging.available() == 0 {
                self.staging.reset();
                return SockOutcome::Ok;
            }
            let Some(Sock::Stream(stream)) = self.sock.as_mut() else {
                return SockOutcome::PeerClosed;
            };
            match stream.write(self.staging.unread()) {
                Ok(0) => return SockOutcome::PeerClosed,
                Ok(n) => self.staging.advance_read(n).expect("bounded by unread bytes"),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // remember where to resume on the next writable event
                    self.staging.set_mark();
                    return SockOutcome::WouldBlock;
                }
                Err(ref e) => {
                    trace!(%e, "stream write");
                    return SockOutcome::from_err(e);
                }
            }
        }
    }

    pub fn writable_armed(&self) -> bool {
        self.writable_armed
    }

    /// Starts watching the socket for writability. Returns false when the
    /// reregistration fails (the connection must then be closed).
    pub fn arm_writable(&mut self, registry: &Registry, token: Token) -> bool {
        if self.writable_armed {
            return true;
        }
        let Some(Sock::Stream(stream)) = self.sock.as_mut() else {
            return false;
        };
        match registry.reregister(stream, token, Interest::READABLE | Interest::WRITABLE) {
            Ok(()) => {
                self.writable_armed = true;
                true
            }
            Err(e) => {
                debug!(%e, "reregister for writable");
                false
            }
        }
    }

    /// Drops the writable watch once the outbound state is drained.
    pub fn disarm_writable(&mut self, registry: &Registry, token: Token) -> bool {
        if !self.writable_armed {
            return true;
        }
        let Some(Sock::Stream(stream)) = self.sock.as_mut() else {
            return false;
        };
        match registry.reregister(stream, token, Interest::READABLE) {
            Ok(()) => {
                self.writable_armed = false;
                true
            }
            Err(e) => {
                debug!(%e, "reregister to drop writable");
                false
            }
        }
    }

    /// Closes the socket and resets every buffer to the fresh state, so a
    /// Disconnected connection holds no unread bytes and no queued output.
    pub fn close(&mut self, registry: &Registry) {
        if let Some(mut sock) = self.sock.take() {
            let res = match &mut sock {
                Sock::Stream(s) => registry.deregister(s),
                Sock::Dgram(s) => registry.deregister(s),
            };
            if let Err(e) = res {
                trace!(%e, "deregister on close");
            }
        }
        self.status = ConnStatus::Disconnected;
        self.decoder.reset();
        self.rdn.reset();
        self.staging.reset();
        self.outbound_q.clear();
        self.current = None;
        self.writable_armed = false;
        debug!(peer = %self.peer_addr, "connection closed");
    }
}

#[cfg(test)]
mod test {
    use std::{io::Read, net::SocketAddr, thread, time::Duration};

    use super::*;
    use crate::encode_frame;

    fn loopback_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = std::net::TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    fn mio_conn(kind_inbound: bool, stream: std::net::TcpStream) -> Connection {
        stream.set_nonblocking(true).unwrap();
        let peer: SocketAddr = stream.peer_addr().unwrap();
        let stream = TcpStream::from_std(stream);
        if kind_inbound {
            Connection::tcp_inbound(stream, peer)
        } else {
            Connection::new(Kind::TcpOutbound, Sock::Stream(stream), peer)
        }
    }

    #[test]
    fn coalesced_frames_arrive_intact() {
        let (ours, theirs) = loopback_pair();
        let mut conn = mio_conn(false, ours);

        let payloads: Vec<Vec<u8>> =
            vec![b"alpha".to_vec(), b"bravo-bravo".to_vec(), vec![0xAB; 3000]];
        let mut expected = Vec::new();
        for p in &payloads {
            expected.extend_from_slice(encode_frame(p).written());
            conn.queue_frame(encode_frame(p));
        }

        // everything fits the kernel buffer, one flush drains it all
        assert_eq!(conn.flush_outbound(), SockOutcome::Ok);
        assert!(conn.write_idle());

        let mut theirs = theirs;
        let mut got = vec![0u8; expected.len()];
        theirs.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn read_path_reassembles_across_buffer_refills() {
        let (ours, theirs) = loopback_pair();
        let mut conn = mio_conn(true, ours);

        // larger than the 8 KiB receive buffer to force multiple fill rounds
        let big = vec![0x5A_u8; 40_000];
        let mut wire = encode_frame(b"small").written().to_vec();
        wire.extend_from_slice(encode_frame(&big).written());

        let writer = thread::spawn(move || {
            use std::io::Write;
            let mut theirs = theirs;
            theirs.write_all(&wire).unwrap();
            theirs.flush().unwrap();
            // keep the socket open while the reader drains
            thread::sleep(Duration::from_millis(200));
        });

        let mut got: Vec<Vec<u8>> = Vec::new();
        while got.len() < 2 {
            let outcome = conn.on_readable(|body, src| {
                assert!(src.is_none());
                got.push(body.written().to_vec());
            });
            assert!(!outcome.is_fatal(), "unexpected outcome {outcome:?}");
            thread::sleep(Duration::from_millis(1));
        }
        writer.join().unwrap();

        assert_eq!(got[0], b"small");
        assert_eq!(got[1], big);
    }

    #[test]
    fn peer_close_is_reported() {
        let (ours, theirs) = loopback_pair();
        let mut conn = mio_conn(true, ours);
        drop(theirs);

        // a closed peer eventually yields a clean EOF
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let outcome = conn.on_readable(|_, _| panic!("no packets expected"));
            if outcome == SockOutcome::PeerClosed {
                break;
            }
            assert_eq!(outcome, SockOutcome::WouldBlock);
            assert!(std::time::Instant::now() < deadline, "EOF never observed");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
