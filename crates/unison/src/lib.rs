pub mod config;
pub mod error;
pub mod logging;
pub mod peer;
pub mod proto;

pub use config::Config;
pub use error::PeerError;
pub use peer::{Peer, StopHandle};
