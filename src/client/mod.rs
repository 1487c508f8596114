//! Pooled RPC client.
//!
//! A [`Client`] sends requests to one peer over at most `concurrency_level` sockets.
//! Each submitted request acquires a socket from the pool (creating it lazily),
//! connects if needed, writes itself and reads until its response decodes. I/O
//! failures are retried on a fresh socket up to `reconnect_tries_max` times, doubling
//! the operation timeout whenever the failure was a timeout. Every request ends with
//! exactly one call of its sink, carrying the response or a [`ClientError`].
use std::{
    marker::PhantomData,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use log::{debug, error};
use thiserror::Error;

use crate::{
    aio::Dispatcher,
    config::ClientConfig,
    net::{
        AddressError, Endpoint, Handshake, Socket, SocketError, SocketFactory, TransportFactory,
    },
    peer::Peer,
    protocol::{ProtocolError, Request},
};

mod connection;
mod pool;

use connection::Connection;
use pool::{Slot, SocketPool};

/// Pause between attempts to create a socket while the system refuses to.
const SOCKET_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) type Sink<T> = Box<dyn FnOnce(Result<T, ClientError>) + Send + 'static>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {peer}: {source}")]
    Connect {
        peer: SocketAddr,
        #[source]
        source: SocketError,
    },
    #[error("failed to read from {peer}: {source}")]
    Read {
        peer: SocketAddr,
        #[source]
        source: SocketError,
    },
    #[error("failed to write to {peer}: {source}")]
    Write {
        peer: SocketAddr,
        #[source]
        source: SocketError,
    },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("failed to create socket: {0}")]
    Resource(#[source] SocketError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("request was dropped before it completed")]
    Disconnected,
}

pub(crate) struct Shared {
    peer: Peer,
    address: SocketAddr,
    config: ClientConfig,
    pool: SocketPool,
    factory: Box<dyn SocketFactory>,
    live: AtomicUsize,
}

impl Shared {
    /// Asks the factory for a socket until it hands one over. Only an unsupported
    /// configuration gives up, since no retry could fix it.
    fn create_socket(&self) -> Result<Socket, SocketError> {
        let mut attempt: u64 = 0;
        loop {
            match self.factory.create_socket() {
                Ok(socket) => {
                    self.live.fetch_add(1, Ordering::AcqRel);
                    debug!("created socket #{} for {}", socket.id(), self.address);
                    return Ok(socket);
                }
                Err(e @ SocketError::Unsupported(_)) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    error!(
                        "failed to create socket for {} (attempt {attempt}): {e}",
                        self.address
                    );
                    thread::sleep(SOCKET_RETRY_DELAY);
                }
            }
        }
    }

    fn discard(&self, socket: &Socket) {
        socket.close();
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Client<R: Request> {
    shared: Arc<Shared>,
    _request: PhantomData<fn(R)>,
}

impl<R: Request> Clone for Client<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _request: PhantomData,
        }
    }
}

impl<R: Request> Client<R> {
    /// A client for `endpoint` using the transport its scheme names.
    ///
    /// Tunnel endpoints need a handshake; use [`Client::connect_tunnel`] for those.
    pub fn connect(
        dispatcher: &Dispatcher,
        endpoint: &Endpoint,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let address = endpoint.resolve()?;
        let factory = TransportFactory::new(dispatcher, endpoint.transport, address, config.trace.io);
        Ok(Self::with_factory(dispatcher, address, config, factory))
    }

    pub fn connect_tunnel(
        dispatcher: &Dispatcher,
        endpoint: &Endpoint,
        config: ClientConfig,
        handshake: Arc<dyn Handshake>,
    ) -> Result<Self, ClientError> {
        let address = endpoint.resolve()?;
        let factory = TransportFactory::new(dispatcher, endpoint.transport, address, config.trace.io)
            .with_handshake(handshake);
        Ok(Self::with_factory(dispatcher, address, config, factory))
    }

    /// A client whose sockets come from `factory`. Sockets are created lazily, so
    /// nothing touches the network until the first request.
    pub fn with_factory(
        dispatcher: &Dispatcher,
        address: SocketAddr,
        config: ClientConfig,
        factory: impl SocketFactory,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                peer: Peer::new(dispatcher, config.trace),
                address,
                pool: SocketPool::new(usize::from(config.concurrency_level)),
                config,
                factory: Box::new(factory),
                live: AtomicUsize::new(0),
            }),
            _request: PhantomData,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Sockets currently alive, whether idle in the pool or carrying a request.
    pub fn live_sockets(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Sends `request` and calls `sink` exactly once with its outcome, on a
    /// dispatcher worker.
    ///
    /// Blocks while every pooled socket is busy, so it must not be called from a
    /// completion running on a dispatcher worker.
    pub fn submit<F>(&self, request: R, sink: F)
    where
        F: FnOnce(Result<R::Response, ClientError>) + Send + 'static,
    {
        self.shared.peer.trace_operation(format_args!(
            "client to {}: acquiring socket",
            self.shared.address
        ));
        let socket = match self.shared.pool.acquire() {
            Slot::Idle(socket) => socket,
            Slot::Vacant => match self.shared.create_socket() {
                Ok(socket) => socket,
                Err(e) => {
                    self.shared.pool.release(Slot::Vacant);
                    sink(Err(ClientError::Resource(e)));
                    return;
                }
            },
        };

        Connection::new(Arc::clone(&self.shared), request, Box::new(sink), socket).connect();
    }

    /// Sends `request` and waits for its response.
    pub fn call(&self, request: R) -> Result<R::Response, ClientError> {
        let (tx, rx) = mpsc::channel();
        self.submit(request, move |result| {
            // The caller may have stopped waiting; nothing to do then.
            let _ = tx.send(result);
        });
        rx.recv().map_err(|_| ClientError::Disconnected)?
    }

    /// Closes idle pooled sockets. Requests in flight finish normally.
    pub fn shutdown(&self) {
        let closed = self.shared.pool.drain();
        self.shared.live.fetch_sub(closed, Ordering::AcqRel);
        debug!("client to {}: closed {closed} idle sockets", self.shared.address);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        sync::{Mutex, atomic::AtomicUsize},
        time::Instant,
    };

    use super::*;
    use crate::{
        aio::test_dispatchers,
        net::Transport,
        protocol::{Call, Decoded, Decoder, Message, rpc::CallDecoder},
    };

    /// Echo server over plain std sockets. The first `hang_up` connections are
    /// closed as soon as a call arrives; later ones reply after `delay`.
    fn serve(hang_up: usize, delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        serve_on(listener, hang_up, delay, Arc::clone(&accepted));
        (addr, accepted)
    }

    fn serve_on(listener: TcpListener, hang_up: usize, delay: Duration, accepted: Arc<AtomicUsize>) {
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || answer(stream, index < hang_up, delay));
            }
        });
    }

    fn answer(mut stream: TcpStream, hang_up: bool, delay: Duration) {
        let mut decoder = CallDecoder::default();
        let mut buf = [0u8; 4096];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let mut input = &buf[..n];
            while !input.is_empty() {
                match decoder.decode(&mut input) {
                    Ok(Decoded::Done(call)) => {
                        if hang_up {
                            return;
                        }
                        thread::sleep(delay);
                        let text: String = call.decode_args().unwrap();
                        let reply = call.reply(&text).unwrap().serialize().unwrap();
                        if stream.write_all(&reply).is_err() {
                            return;
                        }
                    }
                    Ok(Decoded::NeedMore(_)) => {}
                    Err(_) => return,
                }
            }
        }
    }

    fn echo(text: &str) -> Call {
        Call::new(0x2000_0001, 1, 1, &text.to_string()).unwrap()
    }

    fn client(
        dispatcher: &Dispatcher,
        addr: SocketAddr,
        config: ClientConfig,
        created: &Arc<AtomicUsize>,
    ) -> Client<Call> {
        let dispatcher_handle = dispatcher.clone();
        let created = Arc::clone(created);
        Client::with_factory(dispatcher, addr, config, move || {
            created.fetch_add(1, Ordering::SeqCst);
            Socket::stream(&dispatcher_handle, addr, false)
        })
    }

    #[test]
    fn call_round_trip() {
        for dispatcher in test_dispatchers() {
            let (addr, _) = serve(0, Duration::ZERO);
            let endpoint = Endpoint::new(Transport::Tcp, "127.0.0.1", addr.port());
            let client = Client::connect(&dispatcher, &endpoint, ClientConfig::default()).unwrap();

            let reply = client.call(echo("hello")).unwrap();
            assert_eq!(reply.result::<String>().unwrap(), "hello");
            assert_eq!(client.live_sockets(), 1);

            client.shutdown();
            assert_eq!(client.live_sockets(), 0);
            dispatcher.shutdown();
        }
    }

    #[test]
    fn single_socket_serializes_requests() {
        for dispatcher in test_dispatchers() {
            let (addr, accepted) = serve(0, Duration::from_millis(50));
            let created = Arc::new(AtomicUsize::new(0));
            let config = ClientConfig {
                concurrency_level: 1,
                ..ClientConfig::default()
            };
            let client = client(&dispatcher, addr, config, &created);

            let (tx, rx) = mpsc::channel();
            let handles: Vec<_> = ["first", "second"]
                .into_iter()
                .map(|text| {
                    let client = client.clone();
                    let tx = tx.clone();
                    thread::spawn(move || {
                        client.submit(echo(text), move |res| {
                            tx.send(res.unwrap().result::<String>().unwrap()).unwrap()
                        })
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let mut replies: Vec<String> = rx.iter().take(2).collect();
            replies.sort();
            assert_eq!(replies, vec!["first", "second"]);
            assert_eq!(created.load(Ordering::SeqCst), 1);
            assert_eq!(accepted.load(Ordering::SeqCst), 1);
            dispatcher.shutdown();
        }
    }

    #[test]
    fn live_sockets_never_exceed_concurrency() {
        for dispatcher in test_dispatchers() {
            let (addr, _) = serve(0, Duration::from_millis(10));
            let created = Arc::new(AtomicUsize::new(0));
            let config = ClientConfig {
                concurrency_level: 2,
                ..ClientConfig::default()
            };
            let client = client(&dispatcher, addr, config, &created);
            let peak = Arc::new(AtomicUsize::new(0));

            let (tx, rx) = mpsc::channel();
            for i in 0..8 {
                let tx = tx.clone();
                let peak = Arc::clone(&peak);
                let observer = client.clone();
                client.submit(echo(&i.to_string()), move |res| {
                    peak.fetch_max(observer.live_sockets(), Ordering::SeqCst);
                    tx.send(res.is_ok()).unwrap();
                });
            }

            assert!(rx.iter().take(8).all(|ok| ok));
            assert!(created.load(Ordering::SeqCst) <= 2);
            assert!(peak.load(Ordering::SeqCst) <= 2);
            assert!(client.live_sockets() <= 2);
            dispatcher.shutdown();
        }
    }

    #[test]
    fn reconnects_until_a_try_succeeds() {
        for dispatcher in test_dispatchers() {
            let (addr, accepted) = serve(2, Duration::ZERO);
            let created = Arc::new(AtomicUsize::new(0));
            let config = ClientConfig {
                reconnect_tries_max: 2,
                ..ClientConfig::default()
            };
            let client = client(&dispatcher, addr, config, &created);

            let replies = Arc::new(Mutex::new(Vec::new()));
            let (tx, rx) = mpsc::channel();
            let sink = Arc::clone(&replies);
            client.submit(echo("persistent"), move |res| {
                sink.lock().unwrap().push(res.unwrap().result::<String>().unwrap());
                tx.send(()).unwrap();
            });
            rx.recv().unwrap();

            // Give a duplicated delivery a chance to show up.
            thread::sleep(Duration::from_millis(50));
            assert_eq!(*replies.lock().unwrap(), vec!["persistent".to_string()]);
            assert_eq!(accepted.load(Ordering::SeqCst), 3);
            assert_eq!(created.load(Ordering::SeqCst), 3);
            assert_eq!(client.live_sockets(), 1);
            dispatcher.shutdown();
        }
    }

    #[test]
    fn refused_connect_is_retried() {
        for dispatcher in test_dispatchers() {
            let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
            let created = Arc::new(AtomicUsize::new(0));
            let accepted = Arc::new(AtomicUsize::new(0));
            let config = ClientConfig {
                reconnect_tries_max: 1,
                ..ClientConfig::default()
            };

            let handle = dispatcher.clone();
            let counter = Arc::clone(&created);
            let served = Arc::clone(&accepted);
            let client = Client::<Call>::with_factory(
                &dispatcher,
                addr,
                config,
                move || -> Result<Socket, SocketError> {
                    // Nothing listens until the first connect has been refused.
                    if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                        let listener = TcpListener::bind(addr)?;
                        serve_on(listener, 0, Duration::ZERO, Arc::clone(&served));
                    }
                    Socket::stream(&handle, addr, false)
                },
            );

            let reply = client.call(echo("second try")).unwrap();
            assert_eq!(reply.result::<String>().unwrap(), "second try");
            assert_eq!(created.load(Ordering::SeqCst), 2);
            assert_eq!(accepted.load(Ordering::SeqCst), 1);
            assert_eq!(client.live_sockets(), 1);
            dispatcher.shutdown();
        }
    }

    #[test]
    fn exhausted_retries_deliver_one_error() {
        for dispatcher in test_dispatchers() {
            let (addr, accepted) = serve(usize::MAX, Duration::ZERO);
            let created = Arc::new(AtomicUsize::new(0));
            let config = ClientConfig {
                concurrency_level: 1,
                reconnect_tries_max: 1,
                ..ClientConfig::default()
            };
            let client = client(&dispatcher, addr, config, &created);

            let (tx, rx) = mpsc::channel();
            client.submit(echo("doomed"), move |res| tx.send(res).unwrap());

            assert!(matches!(rx.recv().unwrap(), Err(ClientError::Read { .. })));
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            assert_eq!(accepted.load(Ordering::SeqCst), 2);
            assert_eq!(client.live_sockets(), 0);
            assert_eq!(client.shared.pool.idle(), 0);
            assert!(matches!(client.shared.pool.acquire(), Slot::Vacant));
            dispatcher.shutdown();
        }
    }

    #[test]
    fn timeout_doubles_before_retry() {
        for dispatcher in test_dispatchers() {
            let (addr, _) = serve(0, Duration::from_secs(5));
            let created = Arc::new(AtomicUsize::new(0));
            let config = ClientConfig {
                operation_timeout: Duration::from_millis(50),
                reconnect_tries_max: 1,
                ..ClientConfig::default()
            };
            let client = client(&dispatcher, addr, config, &created);

            let start = Instant::now();
            let err = client.call(echo("slow")).unwrap_err();
            let ClientError::Read { source, .. } = err else {
                panic!("expected a read timeout, got {err}");
            };
            assert!(source.is_timeout());
            // 50ms on the first try, 100ms on the second.
            assert!(start.elapsed() >= Duration::from_millis(150));
            dispatcher.shutdown();
        }
    }

    #[test]
    fn refused_connect_is_reported() {
        for dispatcher in test_dispatchers() {
            let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
            let created = Arc::new(AtomicUsize::new(0));
            let config = ClientConfig {
                reconnect_tries_max: 0,
                ..ClientConfig::default()
            };
            let client = client(&dispatcher, addr, config, &created);

            assert!(matches!(
                client.call(echo("nobody home")),
                Err(ClientError::Connect { .. })
            ));
            dispatcher.shutdown();
        }
    }

    #[test]
    fn unsupported_factory_is_a_resource_error() {
        let dispatcher = test_dispatchers().remove(0);
        let endpoint: Endpoint = "oncrpcs://127.0.0.1:1".parse().unwrap();
        let client = Client::<Call>::connect(&dispatcher, &endpoint, ClientConfig::default()).unwrap();

        assert!(matches!(
            client.call(echo("tunnel")),
            Err(ClientError::Resource(SocketError::Unsupported(_)))
        ));
        dispatcher.shutdown();
    }

    #[test]
    fn trailing_bytes_are_fatal() {
        for dispatcher in test_dispatchers() {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                let mut decoder = CallDecoder::default();
                let mut buf = [0u8; 1024];
                loop {
                    let n = stream.read(&mut buf).unwrap();
                    let mut input = &buf[..n];
                    if let Ok(Decoded::Done(call)) = decoder.decode(&mut input) {
                        let mut reply = call.reply(&()).unwrap().serialize().unwrap();
                        reply.extend_from_slice(b"junk");
                        stream.write_all(&reply).unwrap();
                        return;
                    }
                }
            });

            let created = Arc::new(AtomicUsize::new(0));
            let client = client(&dispatcher, addr, ClientConfig::default(), &created);
            assert!(matches!(
                client.call(echo("x")),
                Err(ClientError::Protocol(ProtocolError::TrailingBytes(4)))
            ));
            // Protocol errors are never retried.
            assert_eq!(created.load(Ordering::SeqCst), 1);
            assert_eq!(client.live_sockets(), 0);
            dispatcher.shutdown();
        }
    }
}
