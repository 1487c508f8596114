//! Transport-agnostic ONC-RPC plumbing: record-marked calls and replies carried over
//! TCP, UDP or a handshaked tunnel, with every socket operation completed through a
//! shared [`aio::Dispatcher`].
pub mod aio;
pub mod client;
pub mod config;
pub mod net;
pub mod peer;
pub mod protocol;
pub mod server;

pub use aio::Dispatcher;
pub use client::{Client, ClientError};
pub use config::{BackendKind, ClientConfig, DispatcherConfig, ServerConfig, TraceFlags};
pub use net::{Endpoint, SharedSecret, Socket, SocketError, Transport};
pub use protocol::{Call, Reply, RpcError};
pub use server::{Handler, Responder, Server, ServerError};
