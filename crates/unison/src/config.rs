use std::{net::Ipv4Addr, time::Duration};

use unison_network::SelectorConfig;

/// Peer configuration. The listening port is a request; bind collisions
/// auto-adjust it upward and the effective port is what heartbeats carry.
#[derive(Clone, Debug)]
pub struct Config {
    /// Stay resident past the synch window.
    pub daemon: bool,
    /// Exit after reading the cluster value, printing it to stdout.
    pub get_mode: bool,
    /// Value to push into the cluster at startup.
    pub set_value: Option<String>,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub listen_port: u16,
    /// How long a newborn peer waits to hear from others before it either
    /// self-elects a timestamp (daemons) or gives up (set/get clients).
    pub synch_window: Duration,
    pub tick_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: false,
            get_mode: true,
            set_value: None,
            multicast_group: Ipv4Addr::new(239, 0, 0, 82),
            multicast_port: 8745,
            listen_port: 31582,
            synch_window: Duration::from_secs(4),
            tick_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl Config {
    pub fn selector(&self) -> SelectorConfig {
        SelectorConfig {
            listen_ip: Ipv4Addr::UNSPECIFIED,
            listen_port: self.listen_port,
            multicast_group: self.multicast_group,
            multicast_port: self.multicast_port,
            tick_interval: self.tick_interval,
            connect_timeout: self.connect_timeout,
        }
    }
}
