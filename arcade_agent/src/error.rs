//! Typed errors for conditions callers branch on. Everything else travels
//! as `anyhow::Error`.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("insufficient data: requested {requested} transitions, buffer holds {available}")]
    InsufficientData { requested: usize, available: usize },
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("connection to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("connection to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    #[error("send failed: {0}")]
    Send(String),
}
