use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Mutex,
};

use mio::{Token, Waker};
use tracing::debug;

use crate::ByteBuf;

/// Control events posted by the application thread to the selector.
///
/// Events are owned values; posting transfers ownership to the selector.
pub enum CtrlEvent {
    /// Wake the blocking readiness call without further action (shutdown).
    Interrupt,
    /// Establish an outbound TCP connection to `addr`.
    ConnectRequest { addr: SocketAddr },
    /// Queue an already-framed packet on `conn` and watch it for
    /// writability.
    SendPacket { conn: Token, frame: ByteBuf },
    /// Close and deregister `conn`.
    Disconnect { conn: Token },
}

impl std::fmt::Debug for CtrlEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => write!(f, "Interrupt"),
            Self::ConnectRequest { addr } => write!(f, "ConnectRequest({addr})"),
            Self::SendPacket { conn, frame } => {
                write!(f, "SendPacket({conn:?}, {} bytes)", frame.limit())
            }
            Self::Disconnect { conn } => write!(f, "Disconnect({conn:?})"),
        }
    }
}

/// The selector's wakeup channel: a FIFO of control events plus a poll
/// waker, so the single blocking readiness call observes both network I/O
/// and control traffic.
pub struct ControlChannel {
    events: Mutex<VecDeque<CtrlEvent>>,
    waker: Waker,
}

impl ControlChannel {
    pub fn new(waker: Waker) -> Self {
        Self { events: Mutex::new(VecDeque::new()), waker }
    }

    /// Enqueues the event and wakes the selector. Posting to a selector
    /// whose poll is gone only logs; the peer is shutting down anyway.
    pub fn post(&self, event: CtrlEvent) {
        self.events.lock().expect("control channel poisoned").push_back(event);
        if let Err(e) = self.waker.wake() {
            debug!(%e, "selector wakeup failed");
        }
    }

    /// Takes every pending event, in posting order.
    pub fn drain(&self) -> VecDeque<CtrlEvent> {
        std::mem::take(&mut *self.events.lock().expect("control channel poisoned"))
    }
}
