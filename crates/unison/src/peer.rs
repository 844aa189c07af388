use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, error, info, trace, warn};
use unison_communication::{EventQueue, StatusCell};
use unison_network::{
    ByteBuf, CtrlEvent, PacketEvent, Selector, SelectorEvent, SelectorHandle, SelectorStatus,
    Token, host_ipv4_addrs,
};

use crate::{Config, PeerError, proto::Packet};

/// Per-stage bound for the selector lifecycle handshake.
const STAGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Wall-clock seconds since the epoch; the cluster's notion of freshness.
fn gen_ts() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_secs() as u32
}

/// What the reconciliation machine needs from the outside world. The
/// selector handle is the production implementation; tests substitute a
/// recorder.
pub trait Wire {
    /// One multicast datagram to the whole cluster.
    fn broadcast(&self, frame: &ByteBuf);
    /// Framed packet down a TCP connection, via the selector.
    fn send(&self, conn: Token, frame: ByteBuf);
    fn connect(&self, addr: SocketAddrV4);
    fn disconnect(&self, conn: Token);
}

impl Wire for SelectorHandle {
    fn broadcast(&self, frame: &ByteBuf) {
        if let Err(e) = self.multicast().send_frame(frame.written()) {
            error!(%e, "heartbeat broadcast failed");
        }
    }

    fn send(&self, conn: Token, frame: ByteBuf) {
        self.control().post(CtrlEvent::SendPacket { conn, frame });
    }

    fn connect(&self, addr: SocketAddrV4) {
        self.control().post(CtrlEvent::ConnectRequest { addr: SocketAddr::V4(addr) });
    }

    fn disconnect(&self, conn: Token) {
        self.control().post(CtrlEvent::Disconnect { conn });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// The timestamp-reconciliation state machine.
///
/// `desired_ts >= current_ts` always; while they differ the peer considers
/// itself mid-synchronization and keeps quiet instead of advertising a
/// timestamp it is about to replace.
pub struct NodeState {
    pub current_ts: u32,
    pub desired_ts: u32,
    pub data: String,
    pub listen_port: u16,
    pub daemon: bool,
    pub get_mode: bool,
    pub synch_deadline: Instant,
    pub host_ifs: HashSet<Ipv4Addr>,
    pub exit_requested: Arc<AtomicBool>,
}

impl NodeState {
    pub fn handle_event<W: Wire>(&mut self, evt: SelectorEvent, now: Instant, wire: &W) -> Flow {
        match evt {
            SelectorEvent::Interrupt => self.check_deadline(now, wire),
            SelectorEvent::IncomingConnect(conn) => {
                debug!(?conn, "pushing current value to newcomer");
                let pkt = Packet::Data { value: self.data.clone(), ts: self.current_ts };
                wire.send(conn, pkt.frame());
                Flow::Continue
            }
            SelectorEvent::PacketAvailable(evt) => self.on_packet(evt, wire),
        }
    }

    /// A heartbeat is foreign iff its source IP is not one of this host's
    /// interfaces and its advertised port differs from our listening port.
    fn is_foreign(&self, src_ip: Option<Ipv4Addr>, advertised_port: u16) -> bool {
        let local_ip = src_ip.is_some_and(|ip| self.host_ifs.contains(&ip));
        !local_ip && advertised_port != self.listen_port
    }

    fn on_packet<W: Wire>(&mut self, evt: PacketEvent, wire: &W) -> Flow {
        let pkt = match Packet::decode(evt.body.written()) {
            Ok(pkt) => pkt,
            Err(e) => {
                error!(%e, "malformed packet, dropping");
                return Flow::Continue;
            }
        };
        trace!(?pkt, src_ip = ?evt.src_ip, "packet");
        match pkt {
            Packet::Alive { listen_port, ts } => {
                if !self.is_foreign(evt.src_ip, listen_port) {
                    debug!("heartbeat is from this node, discarding");
                    return Flow::Continue;
                }
                self.on_alive(evt.src_ip, listen_port, ts, wire)
            }
            // data rides a TCP connection we deliberately opened or
            // accepted; it is foreign by construction
            Packet::Data { value, ts } => self.on_data(evt.conn, value, ts, wire),
        }
    }

    fn on_alive<W: Wire>(
        &mut self,
        src_ip: Option<Ipv4Addr>,
        listen_port: u16,
        other_ts: u32,
        wire: &W,
    ) -> Flow {
        if self.current_ts == 0 && other_ts == 0 {
            debug!("alive from another newly spawned node, both still synching");
            return Flow::Continue;
        }

        if self.current_ts > other_ts {
            if self.current_ts == self.desired_ts {
                debug!(other_ts, "other node is stale, notifying");
                self.broadcast_alive(wire);
            }
            // mid-synchronization: a fresher timestamp is already being
            // chased, let the cluster answer once it lands
        } else if self.current_ts < other_ts {
            if self.desired_ts < other_ts {
                self.desired_ts = other_ts;
                match src_ip {
                    Some(ip) => {
                        debug!(other_ts, %ip, listen_port, "fresher timestamp seen, requesting data");
                        wire.connect(SocketAddrV4::new(ip, listen_port));
                    }
                    None => warn!("alive without source address, cannot request data"),
                }
            }
        }
        Flow::Continue
    }

    fn on_data<W: Wire>(&mut self, conn: Token, value: String, ts: u32, wire: &W) -> Flow {
        let mut flow = Flow::Continue;
        if ts > self.current_ts {
            info!(ts, %value, "adopting cluster value");
            self.data = value;
            self.current_ts = ts;
            if ts > self.desired_ts {
                self.desired_ts = ts;
            }
            if self.get_mode {
                flow = Flow::Exit;
            }
        }
        if ts < self.desired_ts {
            debug!(ts, "sender is stale, advertising our timestamp");
            self.broadcast_alive(wire);
        }
        wire.disconnect(conn);
        flow
    }

    fn check_deadline<W: Wire>(&mut self, now: Instant, wire: &W) -> Flow {
        if self.exit_requested.load(Ordering::Relaxed) {
            info!("exit requested");
            return Flow::Exit;
        }
        if !self.daemon && now > self.synch_deadline {
            debug!("synch window elapsed, ephemeral client done");
            return Flow::Exit;
        }
        if self.daemon && self.current_ts == 0 && self.desired_ts == 0 && now > self.synch_deadline
        {
            let ts = gen_ts();
            self.current_ts = ts;
            self.desired_ts = ts;
            info!(ts, "no peer responded, self-elected timestamp");
            self.broadcast_alive(wire);
        }
        Flow::Continue
    }

    fn broadcast_alive<W: Wire>(&self, wire: &W) {
        let pkt = Packet::Alive { listen_port: self.listen_port, ts: self.current_ts };
        trace!(ts = self.current_ts, "broadcasting alive");
        wire.broadcast(&pkt.frame());
    }
}

/// Requests an orderly exit from outside the event loop (signal handler,
/// another thread). The queued interrupt makes the peer notice immediately.
#[derive(Clone)]
pub struct StopHandle {
    exit: Arc<AtomicBool>,
    events: Arc<EventQueue<SelectorEvent>>,
}

impl StopHandle {
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Relaxed);
        self.events.put(SelectorEvent::Interrupt);
    }
}

/// The application loop: walks the selector through its lifecycle, seeds
/// the initial state for `set` invocations, then consumes selector events
/// until the reconciliation machine decides to exit.
pub struct Peer {
    cfg: Config,
    state: NodeState,
    handle: SelectorHandle,
}

impl Peer {
    pub fn new(cfg: Config) -> Result<Self, PeerError> {
        let handle = Selector::spawn(cfg.selector())?;
        let state = NodeState {
            current_ts: 0,
            desired_ts: 0,
            data: String::new(),
            listen_port: cfg.listen_port,
            daemon: cfg.daemon,
            get_mode: cfg.get_mode,
            synch_deadline: Instant::now() + cfg.synch_window,
            host_ifs: host_ipv4_addrs(),
            exit_requested: Arc::new(AtomicBool::new(false)),
        };
        Ok(Self { cfg, state, handle })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            exit: self.state.exit_requested.clone(),
            events: self.handle.events().clone(),
        }
    }

    /// Runs until convergence lets an ephemeral client finish, the deadline
    /// gives up, or an exit is requested. `get` invocations return the
    /// learned value.
    pub fn run(mut self) -> Result<Option<String>, PeerError> {
        self.start()?;

        // the acceptor may have auto-adjusted the port; heartbeats must
        // advertise the one actually bound
        self.state.listen_port = self.handle.bound_port();
        self.state.synch_deadline = Instant::now() + self.cfg.synch_window;

        if let Some(value) = self.cfg.set_value.clone() {
            let ts = gen_ts();
            info!(%value, ts, "setting cluster value");
            self.state.data = value;
            self.state.current_ts = ts;
            self.state.desired_ts = ts;
        }
        self.state.broadcast_alive(&self.handle);

        debug!("processing incoming events");
        loop {
            let evt = self.handle.events().get();
            if self.state.handle_event(evt, Instant::now(), &self.handle) == Flow::Exit {
                break;
            }
        }

        self.stop();
        Ok(self.cfg.get_mode.then(|| self.state.data.clone()))
    }

    fn start(&self) -> Result<(), PeerError> {
        let status = self.handle.status();
        debug!("wait selector go init");
        expect_stage(status, SelectorStatus::Init)?;

        debug!("request selector go ready");
        status.set(SelectorStatus::RequestReady);
        expect_stage(status, SelectorStatus::Ready)?;

        debug!("request selector go selecting");
        status.set(SelectorStatus::RequestSelect);
        expect_stage(status, SelectorStatus::Select)?;

        debug!("selector is selecting");
        Ok(())
    }

    fn stop(&mut self) {
        debug!("request selector to stop");
        self.handle.status().set(SelectorStatus::RequestStop);
        self.handle.control().post(CtrlEvent::Interrupt);
        match self.handle.status().await_reached(SelectorStatus::Stopped, Some(Duration::from_secs(10)))
        {
            Ok(_) => debug!("selector stopped"),
            Err(e) => warn!(%e, "selector did not stop in time"),
        }
        self.handle.join();
    }
}

fn expect_stage(
    status: &StatusCell<SelectorStatus>,
    stage: SelectorStatus,
) -> Result<(), PeerError> {
    let observed = status.await_reached(stage, Some(STAGE_TIMEOUT))?;
    if observed == stage { Ok(()) } else { Err(PeerError::SelectorFailed) }
}
