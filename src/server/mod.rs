//! Completion-driven RPC server.
//!
//! [`Server::bind`] opens the endpoint and starts an accept loop (stream transports)
//! or a receive loop (datagrams), then returns. Every decoded request is passed to the
//! [`Handler`] together with a [`Responder`] bound to the connection or datagram it came
//! from. Faults stay local: a broken connection or a corrupt datagram is logged and
//! dropped while the rest of the server keeps running.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    aio::Dispatcher,
    config::ServerConfig,
    net::{AddressError, Endpoint, Handshake, Socket, SocketError, Transport},
    peer::Peer,
    protocol::{Call, Incoming, Message, ProtocolError, Reply},
};

mod datagram;
mod stream;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("failed to bind: {0}")]
    Bind(#[source] SocketError),
    #[error("failed to accept: {0}")]
    Accept(#[source] SocketError),
    #[error("failed to read: {0}")]
    Read(#[source] SocketError),
    #[error("failed to write: {0}")]
    Write(#[source] SocketError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("failed to create socket: {0}")]
    Resource(#[source] SocketError),
}

pub trait Handler: Send + Sync + 'static {
    type Request: Incoming;
    type Response: Message;

    /// Handles one request. Runs on a dispatcher worker, so long work should be
    /// handed elsewhere; `responder` may be used from any thread.
    fn handle(&self, request: Self::Request, responder: Responder<Self::Response>);
}

impl<F> Handler for F
where
    F: Fn(Call, Responder<Reply>) + Send + Sync + 'static,
{
    type Request = Call;
    type Response = Reply;

    fn handle(&self, request: Call, responder: Responder<Reply>) {
        self(request, responder)
    }
}

type ResponseSink<T> = Box<dyn FnOnce(Option<T>) + Send + 'static>;

/// Sends the response to one request back where the request came from.
///
/// Dropping it without responding gives up on the request; the connection moves
/// on as if a response had been written.
pub struct Responder<T: Message> {
    sink: Option<ResponseSink<T>>,
}

impl<T: Message> Responder<T> {
    fn new(sink: impl FnOnce(Option<T>) + Send + 'static) -> Self {
        Self {
            sink: Some(Box::new(sink)),
        }
    }

    pub fn respond(mut self, response: T) {
        if let Some(sink) = self.sink.take() {
            sink(Some(response));
        }
    }
}

impl<T: Message> Drop for Responder<T> {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink(None);
        }
    }
}

/// Live stream connections, so shutdown can close them.
type Registry = Arc<Mutex<HashMap<usize, Socket>>>;

struct Context<H> {
    peer: Peer,
    handler: H,
    config: ServerConfig,
    connections: Registry,
}

#[derive(Debug)]
pub struct Server {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    socket: Socket,
    connections: Registry,
}

impl Server {
    /// Binds `endpoint` and starts serving it with `handler`.
    pub fn bind<H: Handler>(
        dispatcher: &Dispatcher,
        endpoint: &Endpoint,
        handler: H,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        Self::start(dispatcher, endpoint, handler, config, None)
    }

    /// Like [`Server::bind`], with every accepted socket running `handshake` first.
    pub fn bind_tunnel<H: Handler>(
        dispatcher: &Dispatcher,
        endpoint: &Endpoint,
        handler: H,
        config: ServerConfig,
        handshake: Arc<dyn Handshake>,
    ) -> Result<Self, ServerError> {
        Self::start(dispatcher, endpoint, handler, config, Some(handshake))
    }

    fn start<H: Handler>(
        dispatcher: &Dispatcher,
        endpoint: &Endpoint,
        handler: H,
        config: ServerConfig,
        handshake: Option<Arc<dyn Handshake>>,
    ) -> Result<Self, ServerError> {
        let address = endpoint.resolve()?;
        let trace = config.trace;
        let connections = Registry::default();
        let context = Arc::new(Context {
            peer: Peer::new(dispatcher, trace),
            handler,
            config,
            connections: Arc::clone(&connections),
        });

        let socket = match endpoint.transport {
            Transport::Udp => {
                let socket =
                    Socket::datagram(dispatcher, address, trace.io).map_err(ServerError::Resource)?;
                socket.bind(address).map_err(ServerError::Bind)?;
                socket
            }
            Transport::Tcp => {
                Socket::listener(dispatcher, address, trace.io, None).map_err(ServerError::Bind)?
            }
            Transport::Tunnel => {
                let Some(handshake) = handshake else {
                    return Err(ServerError::Resource(SocketError::Unsupported(
                        "tunnel transport without a handshake",
                    )));
                };
                Socket::listener(dispatcher, address, trace.io, Some(handshake))
                    .map_err(ServerError::Bind)?
            }
        };
        let local_addr = socket.local_addr().map_err(ServerError::Bind)?;
        info!("serving {} on {local_addr}", endpoint.transport.scheme());

        if endpoint.transport.is_stream() {
            stream::accept(socket.clone(), context);
        } else {
            datagram::receive(socket.clone(), context);
        }

        Ok(Self {
            endpoint: endpoint.clone(),
            local_addr,
            socket,
            connections,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live stream connections.
    pub fn connections(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops accepting or receiving and closes every live connection.
    pub fn shutdown(&self) {
        info!("shutting down server on {}", self.local_addr);
        self.socket.close();
        let connections: Vec<Socket> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, socket)| socket)
            .collect();
        for socket in connections {
            socket.close();
        }
    }
}

fn log_fault(error: &ServerError) {
    match error {
        ServerError::Read(SocketError::Closed) => debug!("peer closed the connection"),
        error => warn!("{error}"),
    }
}
