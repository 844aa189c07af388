use std::{
    collections::{HashMap, HashSet},
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, Waker, net::TcpListener};
use tracing::{debug, error, info, trace, warn};
use unison_communication::{EventQueue, StatusCell};

use crate::{
    Acceptor, ByteBuf, Connection, ControlChannel, CtrlEvent, McastSender, NetError, SockOutcome,
    multicast::mcast_receiver_socket,
};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
pub(crate) const MCAST_RX: Token = Token(2);
const FIRST_CONN_TOKEN: usize = 8;

/// Selector lifecycle. `Request*` stages are set by the peer thread; the
/// selector advances past them. `Error` orders above every regular stage so
/// a waiter on any level is released when the selector fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum SelectorStatus {
    ToInit = 0,
    Init = 1,
    RequestReady = 2,
    Ready = 3,
    RequestSelect = 4,
    Select = 5,
    RequestStop = 6,
    Stopped = 7,
    Error = 500,
}

#[derive(Clone, Debug)]
pub struct SelectorConfig {
    pub listen_ip: Ipv4Addr,
    pub listen_port: u16,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    /// Period of the `Interrupt` events that drive the peer's deadline
    /// logic.
    pub tick_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            listen_ip: Ipv4Addr::UNSPECIFIED,
            listen_port: 31582,
            multicast_group: Ipv4Addr::new(239, 0, 0, 82),
            multicast_port: 8745,
            tick_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// A reassembled inbound packet. `src_ip` is filled from the datagram source
/// address for multicast arrivals; TCP arrivals carry `None` (their peer is
/// already known).
#[derive(Debug)]
pub struct PacketEvent {
    pub conn: Token,
    pub body: ByteBuf,
    pub src_ip: Option<Ipv4Addr>,
}

/// Events forwarded from the selector to the peer, in observation order.
#[derive(Debug)]
pub enum SelectorEvent {
    /// Periodic tick or shutdown nudge.
    Interrupt,
    /// A new inbound TCP connection; the peer pushes the current value at
    /// it right away.
    IncomingConnect(Token),
    PacketAvailable(PacketEvent),
}

/// Wall-clock tick anchored across loop iterations: readiness returning
/// early does not restart the period.
struct TickTimer {
    interval: Duration,
    anchor: Instant,
}

impl TickTimer {
    fn new(interval: Duration) -> Self {
        Self { interval, anchor: Instant::now() }
    }

    fn remaining(&self) -> Duration {
        self.interval.saturating_sub(self.anchor.elapsed())
    }

    fn fired(&mut self) -> bool {
        if self.anchor.elapsed() >= self.interval {
            self.anchor = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Handle held by the peer thread: control channel in, event queue out,
/// multicast sender, and the port the acceptor actually bound.
pub struct SelectorHandle {
    ctrl: Arc<ControlChannel>,
    status: Arc<StatusCell<SelectorStatus>>,
    events: Arc<EventQueue<SelectorEvent>>,
    mcast: McastSender,
    bound_port: Arc<AtomicU16>,
    join: Option<JoinHandle<()>>,
}

impl SelectorHandle {
    pub fn control(&self) -> &ControlChannel {
        &self.ctrl
    }

    pub fn status(&self) -> &StatusCell<SelectorStatus> {
        &self.status
    }

    pub fn events(&self) -> &Arc<EventQueue<SelectorEvent>> {
        &self.events
    }

    pub fn multicast(&self) -> &McastSender {
        &self.mcast
    }

    /// Valid once the selector reached `Select`.
    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("selector thread panicked");
            }
        }
    }
}

/// The I/O loop: owns every socket and the connection registries, blocks in
/// exactly one place (the readiness poll), and is woken by network traffic
/// or by the control channel.
pub struct Selector {
    cfg: SelectorConfig,
    poll: Poll,
    acceptor: Acceptor,
    listener: Option<TcpListener>,
    mcast_rx: Connection,
    inbound: HashMap<Token, Connection>,
    inbound_pending: HashSet<Token>,
    outbound: HashMap<Token, Connection>,
    outbound_pending: HashSet<Token>,
    ctrl: Arc<ControlChannel>,
    status: Arc<StatusCell<SelectorStatus>>,
    events_q: Arc<EventQueue<SelectorEvent>>,
    bound_port: Arc<AtomicU16>,
    next_token: usize,
    tick: TickTimer,
}

impl Selector {
    /// Creates the sockets that exist for the whole peer lifetime, starts
    /// the worker thread and leaves it waiting in `Init` for the staged
    /// handshake.
    pub fn spawn(cfg: SelectorConfig) -> Result<SelectorHandle, NetError> {
        let poll = Poll::new().map_err(NetError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(NetError::Register)?;
        let ctrl = Arc::new(ControlChannel::new(waker));
        let status = Arc::new(StatusCell::new(SelectorStatus::ToInit));
        let events_q = Arc::new(EventQueue::new());
        let bound_port = Arc::new(AtomicU16::new(0));

        let rx_sock = mcast_receiver_socket(cfg.multicast_group, cfg.multicast_port)?;
        let group_addr = SocketAddr::from((cfg.multicast_group, cfg.multicast_port));
        let mcast_rx = Connection::mcast_receiver(rx_sock, group_addr);
        let mcast = McastSender::new(cfg.multicast_group, cfg.multicast_port)?;

        let selector = Self {
            acceptor: Acceptor::new(cfg.listen_ip, cfg.listen_port),
            listener: None,
            mcast_rx,
            inbound: HashMap::new(),
            inbound_pending: HashSet::new(),
            outbound: HashMap::new(),
            outbound_pending: HashSet::new(),
            ctrl: ctrl.clone(),
            status: status.clone(),
            events_q: events_q.clone(),
            bound_port: bound_port.clone(),
            next_token: FIRST_CONN_TOKEN,
            tick: TickTimer::new(cfg.tick_interval),
            poll,
            cfg,
        };
        selector.status.set(SelectorStatus::Init);

        let join = std::thread::Builder::new()
            .name("unison-selector".into())
            .spawn(move || selector.run())
            .map_err(NetError::Thread)?;

        Ok(SelectorHandle { ctrl, status, events: events_q, mcast, bound_port, join: Some(join) })
    }

    fn run(mut self) {
        debug!("selector thread running, waiting for go-ready");
        let observed = self
            .status
            .await_reached(SelectorStatus::RequestReady, None)
            .expect("unbounded wait cannot time out");
        if observed >= SelectorStatus::RequestStop {
            self.finish();
            return;
        }
        debug!("go-ready requested, going ready");
        self.status.set(SelectorStatus::Ready);

        let observed = self
            .status
            .await_reached(SelectorStatus::RequestSelect, None)
            .expect("unbounded wait cannot time out");
        if observed >= SelectorStatus::RequestStop {
            self.finish();
            return;
        }
        debug!("go-select requested, going select");

        if let Err(e) = self.start_connections() {
            error!(%e, "starting connections");
            self.status.set(SelectorStatus::Error);
            self.finish();
            return;
        }
        self.status.set(SelectorStatus::Select);

        self.select_loop();
        self.finish();
    }

    /// Binds the listening socket (with port auto-adjustment), publishes the
    /// resulting port, and puts the long-lived sockets under the read watch.
    fn start_connections(&mut self) -> Result<(), NetError> {
        let mut listener = self.acceptor.bind()?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(NetError::Register)?;
        let port = listener.local_addr().map_err(NetError::Socket)?.port();
        self.bound_port.store(port, Ordering::Release);
        self.listener = Some(listener);

        self.mcast_rx
            .register(self.poll.registry(), MCAST_RX, Interest::READABLE)
            .map_err(NetError::Register)?;

        info!(port, "server socket ready");
        Ok(())
    }

    fn select_loop(&mut self) {
        let mut events = Events::with_capacity(128);
        while self.status.get() == SelectorStatus::Select {
            let timeout = self.tick.remaining();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%e, "readiness poll");
                self.status.set(SelectorStatus::Error);
                break;
            }
            for ev in events.iter() {
                self.dispatch(ev);
            }
            if self.tick.fired() {
                self.events_q.put(SelectorEvent::Interrupt);
            }
        }
    }

    fn dispatch(&mut self, ev: &mio::event::Event) {
        match ev.token() {
            WAKER => self.process_ctrl_events(),
            MCAST_RX => self.pump_mcast(),
            LISTENER => self.accept_ready(),
            token => {
                if ev.is_readable() {
                    self.conn_readable(token);
                }
                if ev.is_writable() {
                    self.conn_writable(token);
                }
            }
        }
    }

    fn process_ctrl_events(&mut self) {
        for ev in self.ctrl.drain() {
            trace!(?ev, "control event");
            match ev {
                CtrlEvent::Interrupt => {}
                CtrlEvent::ConnectRequest { addr } => self.open_outbound(addr),
                CtrlEvent::SendPacket { conn, frame } => self.queue_send(conn, frame),
                CtrlEvent::Disconnect { conn } => self.disconnect(conn),
            }
        }
    }

    fn open_outbound(&mut self, addr: SocketAddr) {
        let mut conn = match Connection::establish_tcp(addr, self.cfg.connect_timeout) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%addr, %e, "connect failed");
                return;
            }
        };
        let token = Token(self.next_token);
        if let Err(e) = conn.register(self.poll.registry(), token, Interest::READABLE) {
            error!(%addr, %e, "register outbound connection");
            conn.close(self.poll.registry());
            return;
        }
        self.next_token += 1;
        self.outbound.insert(token, conn);
    }

    fn queue_send(&mut self, token: Token, frame: ByteBuf) {
        let in_inbound = self.inbound.contains_key(&token);
        let (conns, pending) = if in_inbound {
            (&mut self.inbound, &mut self.inbound_pending)
        } else if self.outbound.contains_key(&token) {
            (&mut self.outbound, &mut self.outbound_pending)
        } else {
            debug!(?token, "send for a connection no longer in the registry, dropping");
            return;
        };
        let conn = conns.get_mut(&token).expect("membership checked");
        conn.queue_frame(frame);
        if conn.arm_writable(self.poll.registry(), token) {
            pending.insert(token);
        } else {
            warn!(?token, "cannot watch for writability, closing");
            conn.close(self.poll.registry());
            conns.remove(&token);
            pending.remove(&token);
        }
    }

    fn disconnect(&mut self, token: Token) {
        if self.inbound.contains_key(&token) || self.outbound.contains_key(&token) {
            self.close_and_remove(token, SockOutcome::Ok);
        } else {
            debug!(?token, "disconnect for a connection no longer in the registry, dropping");
        }
    }

    fn accept_ready(&mut self) {
        loop {
            let res = {
                let Some(listener) = &self.listener else { return };
                listener.accept()
            };
            match res {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    if let Err(e) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        error!(%addr, %e, "register accepted connection");
                        continue;
                    }
                    self.next_token += 1;
                    info!(%addr, ?token, "incoming connection");
                    self.inbound.insert(token, Connection::tcp_inbound(stream, addr));
                    self.events_q.put(SelectorEvent::IncomingConnect(token));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(%e, "accept");
                    return;
                }
            }
        }
    }

    fn pump_mcast(&mut self) {
        let events_q = &self.events_q;
        let outcome = self.mcast_rx.on_readable(|body, src_ip| {
            events_q.put(SelectorEvent::PacketAvailable(PacketEvent {
                conn: MCAST_RX,
                body,
                src_ip,
            }));
        });
        // a connectionless socket survives transient errors; closing it
        // would silently end discovery
        if outcome.is_fatal() {
            error!(?outcome, "multicast receive");
        }
    }

    fn conn_readable(&mut self, token: Token) {
        let events_q = &self.events_q;
        let Some(conn) = conn_entry(&mut self.inbound, &mut self.outbound, token) else {
            trace!(?token, "readable event for unknown connection");
            return;
        };
        let outcome = conn.on_readable(|body, src_ip| {
            events_q.put(SelectorEvent::PacketAvailable(PacketEvent { conn: token, body, src_ip }));
        });
        if outcome.is_fatal() {
            self.close_and_remove(token, outcome);
        }
    }

    fn conn_writable(&mut self, token: Token) {
        let Some(conn) = conn_entry(&mut self.inbound, &mut self.outbound, token) else {
            trace!(?token, "writable event for unknown connection");
            return;
        };
        let outcome = conn.flush_outbound();
        if outcome.is_fatal() {
            self.close_and_remove(token, outcome);
            return;
        }
        if conn.write_idle() {
            if conn.disarm_writable(self.poll.registry(), token) {
                self.inbound_pending.remove(&token);
                self.outbound_pending.remove(&token);
            } else {
                self.close_and_remove(token, SockOutcome::Generic);
            }
        }
    }

    fn close_and_remove(&mut self, token: Token, outcome: SockOutcome) {
        match outcome {
            SockOutcome::Ok => debug!(?token, "closing connection"),
            SockOutcome::PeerClosed => debug!(?token, "peer closed"),
            other => error!(?token, ?other, "socket error, closing"),
        }
        if let Some(mut conn) = self.inbound.remove(&token) {
            conn.close(self.poll.registry());
            self.inbound_pending.remove(&token);
        } else if let Some(mut conn) = self.outbound.remove(&token) {
            conn.close(self.poll.registry());
            self.outbound_pending.remove(&token);
        }
    }

    fn stop_and_clean(&mut self) {
        debug!("closing all connections");
        for conn in self.inbound.values_mut() {
            conn.close(self.poll.registry());
        }
        self.inbound.clear();
        self.inbound_pending.clear();
        for conn in self.outbound.values_mut() {
            conn.close(self.poll.registry());
        }
        self.outbound.clear();
        self.outbound_pending.clear();
        self.mcast_rx.close(self.poll.registry());
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                trace!(%e, "deregister listener");
            }
        }
    }

    fn finish(&mut self) {
        self.stop_and_clean();
        self.status.set(SelectorStatus::Stopped);
        debug!("selector stopped");
    }
}

fn conn_entry<'a>(
    inbound: &'a mut HashMap<Token, Connection>,
    outbound: &'a mut HashMap<Token, Connection>,
    token: Token,
) -> Option<&'a mut Connection> {
    if let Some(conn) = inbound.get_mut(&token) {
        return Some(conn);
    }
    outbound.get_mut(&token)
}

#[cfg(test)]
mod test {
    use std::{thread, time::Duration};

    use super::*;

    #[test]
    fn tick_timer_carries_anchor() {
        let mut tick = TickTimer::new(Duration::from_millis(40));
        assert!(!tick.fired());
        assert!(tick.remaining() <= Duration::from_millis(40));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(tick.remaining(), Duration::ZERO);
        assert!(tick.fired());
        // rearmed: a fresh period is pending again
        assert!(!tick.fired());
        assert!(tick.remaining() > Duration::ZERO);
    }

    #[test]
    fn status_ordering_puts_error_last() {
        assert!(SelectorStatus::Error > SelectorStatus::Stopped);
        assert!(SelectorStatus::Select < SelectorStatus::RequestStop);
        assert!(SelectorStatus::ToInit < SelectorStatus::Init);
    }
}
