use std::net::{Ipv4Addr, SocketAddr};

use mio::net::TcpListener;
use tracing::{debug, warn};

use crate::NetError;

/// Binds and listens on the configured TCP port, adjusting upward on
/// collision. The port actually bound is advertised in heartbeats, so the
/// caller must publish it after `bind`.
pub struct Acceptor {
    listen_ip: Ipv4Addr,
    port: u16,
}

impl Acceptor {
    pub fn new(listen_ip: Ipv4Addr, port: u16) -> Self {
        Self { listen_ip, port }
    }

    /// Retries `bind` with the next port until one succeeds; running out of
    /// port space is a critical error.
    pub fn bind(&mut self) -> Result<TcpListener, NetError> {
        loop {
            let addr = SocketAddr::from((self.listen_ip, self.port));
            match TcpListener::bind(addr) {
                Ok(listener) => {
                    debug!(port = self.port, "listening");
                    return Ok(listener);
                }
                Err(e) => {
                    warn!(%addr, %e, "bind failed, auto-adjusting listening port");
                    self.port = self.port.checked_add(1).ok_or(NetError::PortsExhausted)?;
                }
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
