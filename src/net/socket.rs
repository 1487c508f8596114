use std::{
    fmt,
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, UdpSocket},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use log::{debug, trace, warn};
use socket2::{Domain, Protocol, SockAddr, SockRef, Type};

use crate::aio::{Dispatcher, Operation};

use super::{Handshake, SocketError, Transport};

const LISTEN_BACKLOG: i32 = 128;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

enum Handle {
    Stream(socket2::Socket),
    Datagram(UdpSocket),
}

struct Tunnel {
    handshake: Arc<dyn Handshake>,
    pending: Mutex<Option<Role>>,
}

struct Inner {
    id: usize,
    domain: Domain,
    kind: Type,
    protocol: Option<Protocol>,
    handle: Handle,
    nonblocking: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    trace: bool,
    tunnel: Option<Tunnel>,
    dispatcher: Dispatcher,
}

/// A shared handle to one OS socket.
///
/// Clones refer to the same endpoint; the descriptor is released when the last
/// clone is dropped. Exactly one connection drives a socket at a time, other
/// clones exist only so continuations can resubmit work.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<Inner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("domain", &self.inner.domain)
            .field("type", &self.inner.kind)
            .field("tunnel", &self.inner.tunnel.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn peer_of(addr: SockAddr) -> Result<SocketAddr, SocketError> {
    addr.as_socket()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "not an inet address").into())
}

impl Socket {
    fn from_handle(
        dispatcher: &Dispatcher,
        domain: Domain,
        handle: Handle,
        trace: bool,
        handshake: Option<Arc<dyn Handshake>>,
    ) -> Result<Self, SocketError> {
        let (kind, protocol) = match &handle {
            Handle::Stream(_) => (Type::STREAM, Some(Protocol::TCP)),
            Handle::Datagram(_) => (Type::DGRAM, Some(Protocol::UDP)),
        };
        let socket = Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                domain,
                kind,
                protocol,
                handle,
                nonblocking: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                trace,
                tunnel: handshake.map(|handshake| Tunnel {
                    handshake,
                    pending: Mutex::new(None),
                }),
                dispatcher: dispatcher.clone(),
            }),
        };
        socket.set_blocking_mode(!dispatcher.is_nonblocking())?;
        Ok(socket)
    }

    fn new_stream(
        dispatcher: &Dispatcher,
        addr: SocketAddr,
        trace: bool,
        handshake: Option<Arc<dyn Handshake>>,
    ) -> Result<Self, SocketError> {
        let domain = Domain::for_address(addr);
        let socket = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        Self::from_handle(dispatcher, domain, Handle::Stream(socket), trace, handshake)
    }

    /// A TCP socket in the address family of `addr`, not yet connected.
    pub fn stream(dispatcher: &Dispatcher, addr: SocketAddr, trace: bool) -> Result<Self, SocketError> {
        Self::new_stream(dispatcher, addr, trace, None)
    }

    /// A TCP socket that runs `handshake` once connected, before its first read or write.
    pub fn tunnel(
        dispatcher: &Dispatcher,
        addr: SocketAddr,
        trace: bool,
        handshake: Arc<dyn Handshake>,
    ) -> Result<Self, SocketError> {
        Self::new_stream(dispatcher, addr, trace, Some(handshake))
    }

    /// An unbound UDP socket in the address family of `addr`.
    pub fn datagram(dispatcher: &Dispatcher, addr: SocketAddr, trace: bool) -> Result<Self, SocketError> {
        let domain = Domain::for_address(addr);
        let socket = socket2::Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        Self::from_handle(
            dispatcher,
            domain,
            Handle::Datagram(UdpSocket::from(socket)),
            trace,
            None,
        )
    }

    /// A TCP socket bound to `addr` and listening. Accepted sockets run `handshake`
    /// as the server side when one is given.
    pub fn listener(
        dispatcher: &Dispatcher,
        addr: SocketAddr,
        trace: bool,
        handshake: Option<Arc<dyn Handshake>>,
    ) -> Result<Self, SocketError> {
        let socket = Self::new_stream(dispatcher, addr, trace, handshake)?;
        if let Handle::Stream(inner) = &socket.inner.handle {
            inner.set_reuse_address(true)?;
        }
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket)
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn domain(&self) -> Domain {
        self.inner.domain
    }

    pub fn socket_type(&self) -> Type {
        self.inner.kind
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.inner.protocol
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self.inner.handle, Handle::Datagram(_))
    }

    pub fn is_tunnel(&self) -> bool {
        self.inner.tunnel.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_blocking(&self) -> bool {
        !self.is_nonblocking()
    }

    pub(crate) fn is_nonblocking(&self) -> bool {
        self.inner.nonblocking.load(Ordering::Acquire)
    }

    pub fn set_blocking_mode(&self, blocking: bool) -> Result<(), SocketError> {
        match &self.inner.handle {
            Handle::Stream(socket) => socket.set_nonblocking(!blocking)?,
            Handle::Datagram(socket) => socket.set_nonblocking(!blocking)?,
        }
        self.inner.nonblocking.store(!blocking, Ordering::Release);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        match &self.inner.handle {
            Handle::Stream(socket) => peer_of(socket.local_addr()?),
            Handle::Datagram(socket) => Ok(socket.local_addr()?),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, SocketError> {
        match &self.inner.handle {
            Handle::Stream(socket) => peer_of(socket.peer_addr()?),
            Handle::Datagram(socket) => Ok(socket.peer_addr()?),
        }
    }

    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;

        match &self.inner.handle {
            Handle::Stream(socket) => socket.as_raw_fd(),
            Handle::Datagram(socket) => socket.as_raw_fd(),
        }
    }

    fn sock_ref(&self) -> SockRef<'_> {
        match &self.inner.handle {
            Handle::Stream(socket) => SockRef::from(socket),
            Handle::Datagram(socket) => SockRef::from(socket),
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<(), SocketError> {
        self.sock_ref().bind(&addr.into())?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<(), SocketError> {
        match &self.inner.handle {
            Handle::Stream(socket) => Ok(socket.listen(backlog)?),
            Handle::Datagram(_) => Err(SocketError::Unsupported("listen on a datagram socket")),
        }
    }

    fn mark_connected(&self, role: Role) {
        self.inner.connected.store(true, Ordering::Release);
        if let Some(tunnel) = &self.inner.tunnel {
            *tunnel.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(role);
        }
    }

    fn handshake_pending(&self) -> bool {
        self.inner.tunnel.as_ref().is_some_and(|tunnel| {
            tunnel
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
        })
    }

    /// Connects and, for a tunnel socket, runs the client handshake.
    ///
    /// Blocks only on a socket in blocking mode; a non-blocking socket reports
    /// `WouldBlock`/`EINPROGRESS` as an I/O error.
    pub fn connect(&self, peer: SocketAddr) -> Result<(), SocketError> {
        self.start_connect(peer, None)?;
        self.handshake()
    }

    pub(crate) fn start_connect(
        &self,
        peer: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<(), SocketError> {
        let addr = SockAddr::from(peer);
        match (timeout, self.is_nonblocking()) {
            (Some(timeout), false) if !self.is_datagram() => {
                self.sock_ref().connect_timeout(&addr, timeout)?
            }
            _ => self.sock_ref().connect(&addr)?,
        }
        debug!("socket #{}: connected to {peer}", self.id());
        self.mark_connected(Role::Client);
        Ok(())
    }

    /// Completes a non-blocking connect. `Ok(false)` means it is still in progress.
    pub(crate) fn finish_connect(&self) -> Result<bool, SocketError> {
        let socket = self.sock_ref();
        if let Some(e) = socket.take_error()? {
            return Err(e.into());
        }
        match socket.peer_addr() {
            Ok(peer) => {
                debug!("socket #{}: connected to {:?}", self.id(), peer.as_socket());
                self.mark_connected(Role::Client);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs the pending tunnel handshake, if any. Plain sockets return at once.
    pub(crate) fn handshake(&self) -> Result<(), SocketError> {
        let Some(tunnel) = &self.inner.tunnel else {
            return Ok(());
        };
        let Some(role) = tunnel
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        let Handle::Stream(socket) = &self.inner.handle else {
            return Err(SocketError::Unsupported("handshake on a datagram socket"));
        };

        let restore = self.is_nonblocking();
        if restore {
            socket.set_nonblocking(false)?;
        }
        socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        socket.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let mut stream: &socket2::Socket = socket;
        let result = match role {
            Role::Client => tunnel.handshake.client(&mut stream),
            Role::Server => tunnel.handshake.server(&mut stream),
        };

        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)?;
        if restore {
            socket.set_nonblocking(true)?;
        }

        match result {
            Ok(()) => {
                debug!("socket #{}: {role:?} handshake complete", self.id());
                Ok(())
            }
            Err(e) => {
                warn!("socket #{}: {role:?} handshake failed: {e}", self.id());
                self.shutdown();
                Err(SocketError::Handshake(e.to_string()))
            }
        }
    }

    fn trace_io(&self, direction: &str, bytes: &[u8]) {
        if self.inner.trace {
            debug!("socket #{}: {direction} {} bytes", self.id(), bytes.len());
            trace!("socket #{}: {direction} {:02x?}", self.id(), bytes);
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let n = match &self.inner.handle {
            Handle::Stream(socket) => {
                let mut stream: &socket2::Socket = socket;
                stream.read(buf)?
            }
            Handle::Datagram(socket) => socket.recv(buf)?,
        };
        self.trace_io("read", &buf[..n]);
        Ok(n)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
        let n = match &self.inner.handle {
            Handle::Stream(socket) => {
                let mut stream: &socket2::Socket = socket;
                stream.write(buf)?
            }
            Handle::Datagram(socket) => socket.send(buf)?,
        };
        self.trace_io("wrote", &buf[..n]);
        Ok(n)
    }

    pub fn accept(&self) -> Result<(Socket, SocketAddr), SocketError> {
        let Handle::Stream(listener) = &self.inner.handle else {
            return Err(SocketError::Unsupported("accept on a datagram socket"));
        };
        let (socket, addr) = listener.accept()?;
        let peer = peer_of(addr)?;
        socket.set_nodelay(true)?;

        let accepted = Self::from_handle(
            &self.inner.dispatcher,
            self.inner.domain,
            Handle::Stream(socket),
            self.inner.trace,
            self.inner
                .tunnel
                .as_ref()
                .map(|tunnel| Arc::clone(&tunnel.handshake)),
        )?;
        accepted.mark_connected(Role::Server);
        debug!("socket #{}: accepted socket #{} from {peer}", self.id(), accepted.id());
        Ok((accepted, peer))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        let Handle::Datagram(socket) = &self.inner.handle else {
            return Err(SocketError::Unsupported("recv_from on a stream socket"));
        };
        let (n, from) = socket.recv_from(buf)?;
        self.trace_io("received", &buf[..n]);
        Ok((n, from))
    }

    pub fn send_to(&self, buf: &[u8], peer: SocketAddr) -> Result<usize, SocketError> {
        let Handle::Datagram(socket) = &self.inner.handle else {
            return Err(SocketError::Unsupported("send_to on a stream socket"));
        };
        let n = socket.send_to(buf, peer)?;
        self.trace_io("sent", &buf[..n]);
        Ok(n)
    }

    /// Shuts both directions down, waking any blocked operation. Errors from a
    /// socket that was never connected are ignored.
    pub fn shutdown(&self) {
        if let Err(e) = self.sock_ref().shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                debug!("socket #{}: shutdown: {e}", self.id());
            }
        }
    }

    /// Marks the socket closed and shuts it down. Pending and future operations
    /// fail with [`SocketError::Closed`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            trace!("socket #{}: closed", self.id());
            self.shutdown();
        }
    }

    fn submit(&self, operation: Operation) {
        self.inner.dispatcher.submit(self.clone(), operation);
    }

    /// Submits `operation`, first running the tunnel handshake when one is pending.
    fn submit_after_handshake(&self, operation: Operation) {
        if !self.handshake_pending() {
            self.submit(operation);
            return;
        }

        let socket = self.clone();
        self.submit(Operation::Handshake {
            done: Box::new(move |result| match result {
                Ok(()) => socket.submit(operation),
                Err(e) => operation.abort(e)(),
            }),
        });
    }

    /// Connects asynchronously. `timeout` bounds the connect on blocking backends;
    /// callers that need a deadline everywhere arm a dispatcher timer as well.
    pub fn aio_connect<F>(&self, peer: SocketAddr, timeout: Option<Duration>, done: F)
    where
        F: FnOnce(Result<(), SocketError>) + Send + 'static,
    {
        self.submit(Operation::Connect {
            peer,
            timeout,
            in_progress: false,
            done: Box::new(done),
        });
    }

    /// Reads whatever is available, appending to `buffer`. Completes with
    /// [`SocketError::Closed`] once a stream peer has shut down.
    pub fn aio_read<F>(&self, buffer: Vec<u8>, done: F)
    where
        F: FnOnce(Result<Vec<u8>, SocketError>) + Send + 'static,
    {
        self.submit_after_handshake(Operation::Read {
            buffer,
            done: Box::new(done),
        });
    }

    /// Writes all of `buffer`, completing with the number of bytes written.
    pub fn aio_write<F>(&self, buffer: Vec<u8>, done: F)
    where
        F: FnOnce(Result<usize, SocketError>) + Send + 'static,
    {
        self.submit_after_handshake(Operation::Write {
            buffer,
            written: 0,
            done: Box::new(done),
        });
    }

    pub fn aio_accept<F>(&self, done: F)
    where
        F: FnOnce(Result<(Socket, SocketAddr), SocketError>) + Send + 'static,
    {
        self.submit(Operation::Accept {
            done: Box::new(done),
        });
    }

    pub fn aio_recv_from<F>(&self, buffer: Vec<u8>, done: F)
    where
        F: FnOnce(Result<(Vec<u8>, SocketAddr), SocketError>) + Send + 'static,
    {
        self.submit(Operation::RecvFrom {
            buffer,
            done: Box::new(done),
        });
    }

    pub fn aio_send_to<F>(&self, buffer: Vec<u8>, peer: SocketAddr, done: F)
    where
        F: FnOnce(Result<usize, SocketError>) + Send + 'static,
    {
        self.submit(Operation::SendTo {
            buffer,
            peer,
            done: Box::new(done),
        });
    }
}

/// Creates fresh client sockets, lazily and after every fault.
pub trait SocketFactory: Send + Sync + 'static {
    fn create_socket(&self) -> Result<Socket, SocketError>;
}

impl<F> SocketFactory for F
where
    F: Fn() -> Result<Socket, SocketError> + Send + Sync + 'static,
{
    fn create_socket(&self) -> Result<Socket, SocketError> {
        self()
    }
}

/// Builds sockets for one transport towards one peer.
#[derive(Clone)]
pub struct TransportFactory {
    dispatcher: Dispatcher,
    transport: Transport,
    peer: SocketAddr,
    trace: bool,
    handshake: Option<Arc<dyn Handshake>>,
}

impl TransportFactory {
    pub fn new(dispatcher: &Dispatcher, transport: Transport, peer: SocketAddr, trace: bool) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            transport,
            peer,
            trace,
            handshake: None,
        }
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }
}

impl SocketFactory for TransportFactory {
    fn create_socket(&self) -> Result<Socket, SocketError> {
        match self.transport {
            Transport::Tcp => Socket::stream(&self.dispatcher, self.peer, self.trace),
            Transport::Udp => Socket::datagram(&self.dispatcher, self.peer, self.trace),
            Transport::Tunnel => match &self.handshake {
                Some(handshake) => {
                    Socket::tunnel(&self.dispatcher, self.peer, self.trace, Arc::clone(handshake))
                }
                None => Err(SocketError::Unsupported(
                    "tunnel transport without a handshake",
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, sync::mpsc::channel, thread};

    use super::*;
    use crate::{aio::test_dispatchers, net::SharedSecret};

    #[test]
    fn accepted_socket_follows_dispatcher_mode() {
        for dispatcher in test_dispatchers() {
            let listener = Socket::listener(&dispatcher, "127.0.0.1:0".parse().unwrap(), true, None)
                .unwrap();
            let addr = listener.local_addr().unwrap();

            let (tx, rx) = channel();
            listener.aio_accept(move |res| tx.send(res.unwrap()).unwrap());

            let client = std::net::TcpStream::connect(addr).unwrap();
            let (accepted, peer) = rx.recv().unwrap();
            assert_eq!(peer, client.local_addr().unwrap());
            assert!(accepted.is_connected());
            assert_eq!(accepted.is_blocking(), !dispatcher.is_nonblocking());

            dispatcher.shutdown();
        }
    }

    #[test]
    fn ids_are_unique() {
        for dispatcher in test_dispatchers() {
            let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
            let a = Socket::stream(&dispatcher, addr, false).unwrap();
            let b = Socket::stream(&dispatcher, addr, false).unwrap();
            assert_ne!(a.id(), b.id());
            assert_eq!(a.clone().id(), a.id());
            dispatcher.shutdown();
        }
    }

    #[test]
    fn read_after_close_fails() {
        for dispatcher in test_dispatchers() {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let socket = Socket::stream(&dispatcher, addr, false).unwrap();

            let (tx, rx) = channel();
            let reader = socket.clone();
            socket.aio_connect(addr, None, move |res| {
                res.unwrap();
                reader.close();
                reader.aio_read(Vec::new(), move |res| tx.send(res).unwrap());
            });
            let _peer = listener.accept().unwrap();

            assert!(matches!(rx.recv().unwrap(), Err(SocketError::Closed)));
            dispatcher.shutdown();
        }
    }

    #[test]
    fn refused_connect_reports_error() {
        for dispatcher in test_dispatchers() {
            // Bind then drop to find a port nobody listens on.
            let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
            let socket = Socket::stream(&dispatcher, addr, false).unwrap();

            let (tx, rx) = channel();
            socket.aio_connect(addr, None, move |res| tx.send(res).unwrap());
            assert!(rx.recv().unwrap().is_err());
            assert!(!socket.is_connected());
            dispatcher.shutdown();
        }
    }

    #[test]
    fn tunnel_handshake_precedes_data() {
        for dispatcher in test_dispatchers() {
            let secret: Arc<dyn Handshake> = Arc::new(SharedSecret::new("open sesame").unwrap());
            let listener = Socket::listener(
                &dispatcher,
                "127.0.0.1:0".parse().unwrap(),
                false,
                Some(Arc::clone(&secret)),
            )
            .unwrap();
            let addr = listener.local_addr().unwrap();

            let (tx, rx) = channel();
            listener.aio_accept(move |res| {
                let (accepted, _) = res.unwrap();
                let reader = accepted.clone();
                reader.aio_read(Vec::new(), move |res| {
                    tx.send(res.unwrap()).unwrap();
                    drop(accepted);
                });
            });

            let client = TransportFactory::new(&dispatcher, Transport::Tunnel, addr, false)
                .with_handshake(secret)
                .create_socket()
                .unwrap();
            let writer = client.clone();
            client.aio_connect(addr, None, move |res| {
                res.unwrap();
                writer.aio_write(b"payload".to_vec(), |res| {
                    res.unwrap();
                });
            });

            assert_eq!(rx.recv().unwrap(), b"payload");
            dispatcher.shutdown();
        }
    }

    #[test]
    fn tunnel_rejects_wrong_secret() {
        for dispatcher in test_dispatchers() {
            let listener = Socket::listener(
                &dispatcher,
                "127.0.0.1:0".parse().unwrap(),
                false,
                Some(Arc::new(SharedSecret::new("right").unwrap())),
            )
            .unwrap();
            let addr = listener.local_addr().unwrap();

            let (tx, rx) = channel();
            listener.aio_accept(move |res| {
                let (accepted, _) = res.unwrap();
                accepted.aio_read(Vec::new(), move |res| tx.send(res).unwrap());
            });

            let client = thread::spawn(move || {
                let mut stream = std::net::TcpStream::connect(addr).unwrap();
                SharedSecret::new("wrong").unwrap().client(&mut stream)
            });

            assert!(matches!(rx.recv().unwrap(), Err(SocketError::Handshake(_))));
            assert!(client.join().unwrap().is_err());
            dispatcher.shutdown();
        }
    }

    #[test]
    fn tunnel_factory_requires_handshake() {
        let dispatcher = test_dispatchers().remove(0);
        let factory = TransportFactory::new(
            &dispatcher,
            Transport::Tunnel,
            "127.0.0.1:1".parse().unwrap(),
            false,
        );
        assert!(matches!(
            factory.create_socket(),
            Err(SocketError::Unsupported(_))
        ));
        dispatcher.shutdown();
    }
}
