//! Network endpoints.
//!
//! [`Socket`] is the single capability every connection engine talks to. TCP streams,
//! UDP datagram sockets and secure-tunnel streams all expose the same blocking calls
//! and the same `aio_*` submissions, so nothing above this module branches on the
//! transport in use.
use std::io::{self, ErrorKind};

use thiserror::Error;

mod address;
mod socket;
pub mod tunnel;

pub use address::{AddressError, Endpoint, Transport};
pub use socket::{Socket, SocketFactory, TransportFactory};
pub use tunnel::{Handshake, SharedSecret};

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("socket is closed")]
    Closed,
    #[error("operation timed out")]
    TimedOut,
    #[error("tunnel handshake failed: {0}")]
    Handshake(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl SocketError {
    /// Whether the failure was a deadline expiring rather than the peer or the
    /// network refusing the operation.
    pub fn is_timeout(&self) -> bool {
        match self {
            SocketError::TimedOut => true,
            // Blocking sockets with a read/write timeout report expiry as `WouldBlock`.
            SocketError::Io(e) => matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock),
            _ => false,
        }
    }
}
