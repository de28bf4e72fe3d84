use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

/// Structural problems found while reading or writing DNS wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("packet truncated at offset {offset}: need {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("compression pointer at offset {at} targets invalid offset {target}")]
    BadPointer { at: usize, target: usize },

    #[error("compression pointer chain starting at offset {start} is too long")]
    PointerLoop { start: usize },

    #[error("reserved label type 0x{0:02x}")]
    BadLabelType(u8),

    #[error("label of {0} bytes exceeds 63")]
    LabelTooLong(usize),

    #[error("name of {0} bytes exceeds 255")]
    NameTooLong(usize),

    #[error("{what} of {len} does not fit the wire format")]
    Oversized { what: &'static str, len: usize },

    #[error("invalid domain name: {0}")]
    InvalidName(String),
}

/// Every way handling a single client datagram can fail.
///
/// None of these are fatal to the server: the event loop logs the error and
/// drops the request without sending anything back to the client.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] WireError),

    #[error("{client} sends too many identical queries")]
    FloodDetected { client: IpAddr },

    #[error("upstream {upstream} did not answer within {timeout:?}")]
    UpstreamTimeout {
        upstream: SocketAddr,
        timeout: Duration,
    },

    #[error("upstream reply id {received:#06x} does not match query id {expected:#06x}")]
    UpstreamIntegrity { expected: u16, received: u16 },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForwardError {
    /// Short stable label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Malformed(_) => "malformed",
            ForwardError::FloodDetected { .. } => "flood",
            ForwardError::UpstreamTimeout { .. } => "upstream_timeout",
            ForwardError::UpstreamIntegrity { .. } => "upstream_integrity",
            ForwardError::Io(_) => "io",
        }
    }
}
