mod acceptor;
mod bytes;
mod connection;
mod control;
mod error;
mod frame;
mod iface;
mod multicast;
mod selector;

pub use acceptor::Acceptor;
pub use bytes::{BufError, ByteBuf};
pub use connection::{ConnStatus, Connection, Kind, SockOutcome};
pub use control::{ControlChannel, CtrlEvent};
pub use error::NetError;
pub use frame::{FrameDecoder, LEN_PREFIX_SIZE, encode_frame};
pub use iface::host_ipv4_addrs;
pub use mio::Token;
pub use multicast::McastSender;
pub use selector::{
    PacketEvent, Selector, SelectorConfig, SelectorEvent, SelectorHandle, SelectorStatus,
};
