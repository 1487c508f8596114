use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use log::{error, warn};

use crate::{
    aio::Timer,
    net::{Socket, SocketError},
    protocol::{Decoded, Decoder, Request},
};

use super::{ClientError, Shared, Sink, pool::Slot};

/// Initial capacity of the buffer a response is read into.
const RESPONSE_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connect,
    Write,
    Read,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Connect => "connect",
            Stage::Write => "write",
            Stage::Read => "read",
        })
    }
}

/// One request travelling over one socket: connect, write the request, read until
/// the response decodes. Owns the socket until it goes back to the pool.
pub(crate) struct Connection<R: Request> {
    shared: Arc<Shared>,
    request: R,
    sink: Sink<R::Response>,
    socket: Socket,
    decoder: R::Decoder,
    tries: u8,
    timeout: Duration,
}

/// Hands the connection to whichever of the I/O completion and the deadline timer
/// arrives first. The loser finds the latch empty and does nothing.
struct Latch<R: Request> {
    connection: Mutex<Option<Connection<R>>>,
    timer: Mutex<Option<Timer>>,
}

impl<R: Request> Latch<R> {
    fn arm(connection: Connection<R>, stage: Stage) -> Arc<Self> {
        let dispatcher = connection.shared.peer.dispatcher().clone();
        let timeout = connection.timeout;
        let latch = Arc::new(Self {
            connection: Mutex::new(Some(connection)),
            timer: Mutex::new(None),
        });

        let expired = Arc::clone(&latch);
        let timer = dispatcher.schedule(timeout, move || {
            if let Some(connection) = expired.take_connection() {
                connection.fail(stage, SocketError::TimedOut);
            }
        });
        *latch.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        latch
    }

    fn take_connection(&self) -> Option<Connection<R>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Claims the connection for the completion path, disarming the timer.
    fn take(&self) -> Option<Connection<R>> {
        let connection = self.take_connection()?;
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.cancel();
        }
        Some(connection)
    }
}

impl<R: Request> Connection<R> {
    pub(crate) fn new(shared: Arc<Shared>, request: R, sink: Sink<R::Response>, socket: Socket) -> Self {
        let decoder = request.create_response();
        let timeout = shared.config.operation_timeout;
        Self {
            shared,
            request,
            sink,
            socket,
            decoder,
            tries: 0,
            timeout,
        }
    }

    fn trace(&self, args: fmt::Arguments<'_>) {
        self.shared.peer.trace_operation(format_args!(
            "client socket #{} to {}: {args}",
            self.socket.id(),
            self.shared.address
        ));
    }

    pub(crate) fn connect(self) {
        if self.socket.is_connected() {
            self.write();
            return;
        }

        self.trace(format_args!("connecting, try {}", self.tries + 1));
        let socket = self.socket.clone();
        let address = self.shared.address;
        let timeout = self.timeout;
        let latch = Latch::arm(self, Stage::Connect);
        socket.aio_connect(address, Some(timeout), move |result| {
            let Some(connection) = latch.take() else {
                return;
            };
            match result {
                Ok(()) => connection.write(),
                Err(e) => connection.fail(Stage::Connect, e),
            }
        });
    }

    fn write(self) {
        let bytes = match self.request.serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.abort(e.into());
                return;
            }
        };

        self.trace(format_args!("sending {} bytes", bytes.len()));
        let socket = self.socket.clone();
        let latch = Latch::arm(self, Stage::Write);
        socket.aio_write(bytes, move |result| {
            let Some(mut connection) = latch.take() else {
                return;
            };
            match result {
                Ok(written) => {
                    connection.trace(format_args!("wrote {written} bytes"));
                    connection.decoder = connection.request.create_response();
                    connection.read(Vec::with_capacity(RESPONSE_BUFFER));
                }
                Err(e) => connection.fail(Stage::Write, e),
            }
        });
    }

    fn read(self, buffer: Vec<u8>) {
        let socket = self.socket.clone();
        let latch = Latch::arm(self, Stage::Read);
        socket.aio_read(buffer, move |result| {
            let Some(connection) = latch.take() else {
                return;
            };
            match result {
                Ok(buffer) => connection.decode(buffer),
                Err(e) => connection.fail(Stage::Read, e),
            }
        });
    }

    fn decode(mut self, mut buffer: Vec<u8>) {
        let mut input = &buffer[..];
        match self.decoder.decode(&mut input) {
            Ok(Decoded::NeedMore(wanted)) => {
                self.trace(format_args!("partially decoded, reading {wanted} more bytes"));
                buffer.clear();
                buffer.reserve(wanted);
                self.read(buffer);
            }
            Ok(Decoded::Done(response)) if input.is_empty() => self.finish(response),
            Ok(Decoded::Done(_)) => {
                let trailing = input.len();
                self.abort(crate::protocol::ProtocolError::TrailingBytes(trailing).into());
            }
            Err(e) => self.abort(e.into()),
        }
    }

    fn finish(self, response: R::Response) {
        self.trace(format_args!("decoded response"));
        self.shared.pool.release(Slot::Idle(self.socket));
        (self.sink)(Ok(response));
    }

    /// Ends the request without retrying; the socket is not trusted again.
    fn abort(self, error: ClientError) {
        error!("request to {} failed: {error}", self.shared.address);
        self.shared.discard(&self.socket);
        self.shared.pool.release(Slot::Vacant);
        (self.sink)(Err(error));
    }

    /// Handles an I/O failure: retry on a fresh socket while tries remain.
    fn fail(mut self, stage: Stage, error: SocketError) {
        warn!(
            "{stage} on socket #{} to {} failed (try {}): {error}",
            self.socket.id(),
            self.shared.address,
            self.tries + 1
        );
        self.shared.discard(&self.socket);

        if self.tries >= self.shared.config.reconnect_tries_max {
            self.shared.pool.release(Slot::Vacant);
            let address = self.shared.address;
            let error = match stage {
                Stage::Connect => ClientError::Connect {
                    peer: address,
                    source: error,
                },
                Stage::Write => ClientError::Write {
                    peer: address,
                    source: error,
                },
                Stage::Read => ClientError::Read {
                    peer: address,
                    source: error,
                },
            };
            (self.sink)(Err(error));
            return;
        }

        self.tries += 1;
        if error.is_timeout() {
            self.timeout = self.timeout.saturating_mul(2);
        }
        match self.shared.create_socket() {
            Ok(socket) => {
                self.socket = socket;
                self.connect();
            }
            Err(e) => {
                self.shared.pool.release(Slot::Vacant);
                (self.sink)(Err(ClientError::Resource(e)));
            }
        }
    }
}
