use std::{io, net::SocketAddr};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("socket create: {0}")]
    Socket(#[source] io::Error),
    #[error("bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("listening port space exhausted")]
    PortsExhausted,
    #[error("multicast join {group}: {source}")]
    MulticastJoin { group: std::net::Ipv4Addr, source: io::Error },
    #[error("readiness poll: {0}")]
    Poll(#[source] io::Error),
    #[error("register with poll: {0}")]
    Register(#[source] io::Error),
    #[error("selector thread spawn: {0}")]
    Thread(#[source] io::Error),
    #[error("datagram send: {0}")]
    Datagram(#[source] io::Error),
}
