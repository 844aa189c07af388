use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("timed out waiting for status")]
pub struct AwaitTimeout;
