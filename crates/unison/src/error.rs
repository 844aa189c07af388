use thiserror::Error;
use unison_communication::AwaitTimeout;
use unison_network::NetError;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("selector: {0}")]
    Net(#[from] NetError),
    #[error("selector status wait: {0}")]
    StatusWait(#[from] AwaitTimeout),
    #[error("selector entered error state")]
    SelectorFailed,
}
