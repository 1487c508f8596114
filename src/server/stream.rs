use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{debug, warn};

use crate::{
    net::{Socket, SocketError},
    protocol::{Decoded, Decoder, Incoming, Message},
};

use super::{Context, Handler, Responder, ServerError, log_fault};

/// Keeps one accept outstanding on `listener` until it is closed.
pub(super) fn accept<H: Handler>(listener: Socket, context: Arc<Context<H>>) {
    let next = listener.clone();
    listener.aio_accept(move |result| match result {
        Ok((socket, peer)) => {
            // Re-arm first so the backlog keeps draining while this one starts up.
            accept(next, Arc::clone(&context));
            Connection::start(socket, peer, context);
        }
        Err(_) if next.is_closed() => debug!("listener closed, no longer accepting"),
        Err(e) => {
            log_fault(&ServerError::Accept(e));
            accept(next, context);
        }
    });
}

type RequestDecoder<H> = <<H as Handler>::Request as Incoming>::Decoder;

struct State<H: Handler> {
    decoder: RequestDecoder<H>,
    /// Read buffer, parked here while no read is outstanding.
    buffer: Option<Vec<u8>>,
    /// Requests handed to the handler that have not been answered yet.
    in_flight: usize,
    outbox: VecDeque<Vec<u8>>,
    writing: bool,
    reading: bool,
    closed: bool,
}

/// One accepted stream. Reads are paused while requests are in flight and resume
/// once every response has been written.
struct Connection<H: Handler> {
    socket: Socket,
    peer: SocketAddr,
    context: Arc<Context<H>>,
    state: Mutex<State<H>>,
}

impl<H: Handler> Connection<H> {
    fn start(socket: Socket, peer: SocketAddr, context: Arc<Context<H>>) {
        context
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(socket.id(), socket.clone());

        let connection = Arc::new(Self {
            state: Mutex::new(State {
                decoder: Default::default(),
                buffer: None,
                in_flight: 0,
                outbox: VecDeque::new(),
                writing: false,
                reading: true,
                closed: false,
            }),
            socket,
            peer,
            context,
        });
        connection.trace("accepted");
        let buffer = Vec::with_capacity(connection.context.config.read_buffer);
        connection.read(buffer);
    }

    fn state(&self) -> MutexGuard<'_, State<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trace(&self, what: &str) {
        self.context.peer.trace_operation(format_args!(
            "server socket #{} from {}: {what}",
            self.socket.id(),
            self.peer
        ));
    }

    /// Issues a read; the caller has already set `reading`.
    fn read(self: &Arc<Self>, buffer: Vec<u8>) {
        let connection = Arc::clone(self);
        self.socket
            .aio_read(buffer, move |result| connection.on_read(result));
    }

    fn on_read(self: Arc<Self>, result: Result<Vec<u8>, SocketError>) {
        let mut buffer = match result {
            Ok(buffer) => buffer,
            Err(e) => return self.teardown(ServerError::Read(e)),
        };

        let mut requests = Vec::new();
        {
            let mut state = self.state();
            let mut input = &buffer[..];
            while !input.is_empty() {
                match state.decoder.decode(&mut input) {
                    Ok(Decoded::Done(request)) => requests.push(request),
                    Ok(Decoded::NeedMore(_)) => break,
                    Err(e) => {
                        drop(state);
                        return self.teardown(e.into());
                    }
                }
            }
            buffer.clear();

            if requests.is_empty() {
                drop(state);
                self.trace("partially decoded, reading again");
                return self.read(buffer);
            }
            state.in_flight += requests.len();
            state.reading = false;
            state.buffer = Some(buffer);
        }

        self.trace(&format!("decoded {} requests", requests.len()));
        for request in requests {
            let connection = Arc::clone(&self);
            let responder = Responder::new(move |response| connection.on_response(response));
            self.context.handler.handle(request, responder);
        }
    }

    fn on_response(self: Arc<Self>, response: Option<H::Response>) {
        let bytes = match response.map(|response| response.serialize()).transpose() {
            Ok(bytes) => bytes,
            Err(e) => return self.teardown(e.into()),
        };

        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.closed {
            return;
        }
        let Some(bytes) = bytes else {
            warn!(
                "handler dropped a request from {} without responding",
                self.peer
            );
            drop(state);
            return self.resume_reading();
        };

        if state.writing {
            state.outbox.push_back(bytes);
            return;
        }
        state.writing = true;
        drop(state);
        self.trace("responding");
        self.write(bytes);
    }

    fn write(self: &Arc<Self>, bytes: Vec<u8>) {
        let connection = Arc::clone(self);
        self.socket
            .aio_write(bytes, move |result| connection.on_written(result));
    }

    fn on_written(self: Arc<Self>, result: Result<usize, SocketError>) {
        match result {
            Ok(written) => self.trace(&format!("wrote {written} bytes")),
            Err(e) => return self.teardown(ServerError::Write(e)),
        }

        let mut state = self.state();
        if let Some(next) = state.outbox.pop_front() {
            drop(state);
            return self.write(next);
        }
        state.writing = false;
        drop(state);
        self.resume_reading();
    }

    /// Re-arms the read once nothing is in flight or waiting to be written.
    fn resume_reading(self: &Arc<Self>) {
        let mut state = self.state();
        if state.closed || state.reading || state.writing || state.in_flight > 0 {
            return;
        }
        state.reading = true;
        let buffer = state
            .buffer
            .take()
            .unwrap_or_else(|| Vec::with_capacity(self.context.config.read_buffer));
        drop(state);
        self.trace("reading");
        self.read(buffer);
    }

    fn teardown(&self, error: ServerError) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.outbox.clear();
        }
        log_fault(&error);
        self.trace("closing");
        self.socket.close();
        self.context
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.socket.id());
    }
}
