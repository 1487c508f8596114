use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    time::Duration,
};

use crate::net::{Socket, SocketError};

use super::{Callback, Job};

/// Bytes reserved when a stream read is submitted with a full buffer.
const READ_CHUNK: usize = 1024;

/// Largest payload a single UDP datagram can carry.
pub(crate) const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// A submitted socket operation together with the continuation that receives
/// its outcome.
pub(crate) enum Operation {
    Connect {
        peer: SocketAddr,
        timeout: Option<Duration>,
        in_progress: bool,
        done: Callback<()>,
    },
    Handshake {
        done: Callback<()>,
    },
    Read {
        buffer: Vec<u8>,
        done: Callback<Vec<u8>>,
    },
    Write {
        buffer: Vec<u8>,
        written: usize,
        done: Callback<usize>,
    },
    Accept {
        done: Callback<(Socket, SocketAddr)>,
    },
    RecvFrom {
        buffer: Vec<u8>,
        done: Callback<(Vec<u8>, SocketAddr)>,
    },
    SendTo {
        buffer: Vec<u8>,
        peer: SocketAddr,
        done: Callback<usize>,
    },
}

/// Outcome of one attempt at an operation.
pub(crate) enum Progress {
    /// Finished; running the job delivers the result to the continuation.
    Complete(Job),
    /// The socket is not ready; retry once it is.
    Wait(Interest, Operation),
}

fn complete<T: Send + 'static>(done: Callback<T>, result: Result<T, SocketError>) -> Progress {
    Progress::Complete(Box::new(move || done(result)))
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
}

fn in_progress(e: &io::Error) -> bool {
    would_block(e) || e.raw_os_error() == Some(libc::EINPROGRESS)
}

impl Operation {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Operation::Connect { .. } => "connect",
            Operation::Handshake { .. } => "handshake",
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::Accept { .. } => "accept",
            Operation::RecvFrom { .. } => "recvfrom",
            Operation::SendTo { .. } => "sendto",
        }
    }

    /// Fails the operation without touching the socket.
    pub(crate) fn abort(self, error: SocketError) -> Job {
        match self {
            Operation::Connect { done, .. } | Operation::Handshake { done } => {
                Box::new(move || done(Err(error)))
            }
            Operation::Read { done, .. } => Box::new(move || done(Err(error))),
            Operation::Write { done, .. } | Operation::SendTo { done, .. } => {
                Box::new(move || done(Err(error)))
            }
            Operation::Accept { done } => Box::new(move || done(Err(error))),
            Operation::RecvFrom { done, .. } => Box::new(move || done(Err(error))),
        }
    }

    /// Makes as much progress as the socket allows without blocking beyond what
    /// the socket's own blocking mode implies.
    pub(crate) fn execute(self, socket: &Socket) -> Progress {
        match self {
            Operation::Connect {
                peer,
                timeout,
                in_progress: started,
                done,
            } => {
                if started {
                    return match socket.finish_connect() {
                        Ok(true) => complete(done, Ok(())),
                        Ok(false) => Progress::Wait(
                            Interest::Write,
                            Operation::Connect {
                                peer,
                                timeout,
                                in_progress: true,
                                done,
                            },
                        ),
                        Err(e) => complete(done, Err(e)),
                    };
                }

                match socket.start_connect(peer, timeout) {
                    Ok(()) => complete(done, Ok(())),
                    Err(SocketError::Io(e)) if in_progress(&e) => Progress::Wait(
                        Interest::Write,
                        Operation::Connect {
                            peer,
                            timeout,
                            in_progress: true,
                            done,
                        },
                    ),
                    Err(e) => complete(done, Err(e)),
                }
            }
            Operation::Handshake { done } => {
                let result = socket.handshake();
                complete(done, result)
            }
            Operation::Read { mut buffer, done } => {
                // A datagram that does not fit is truncated by the kernel, so always
                // leave room for the largest one.
                if socket.is_datagram() {
                    buffer.reserve(MAX_DATAGRAM);
                } else if buffer.capacity() == buffer.len() {
                    buffer.reserve(READ_CHUNK);
                }

                let start = buffer.len();
                buffer.resize(buffer.capacity(), 0);
                loop {
                    match socket.read(&mut buffer[start..]) {
                        Ok(0) if !socket.is_datagram() || socket.is_closed() => {
                            buffer.truncate(start);
                            return complete(done, Err(SocketError::Closed));
                        }
                        Ok(n) => {
                            buffer.truncate(start + n);
                            return complete(done, Ok(buffer));
                        }
                        Err(SocketError::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(SocketError::Io(e)) if would_block(&e) => {
                            buffer.truncate(start);
                            return Progress::Wait(Interest::Read, Operation::Read { buffer, done });
                        }
                        Err(e) => return complete(done, Err(e)),
                    }
                }
            }
            Operation::Write {
                buffer,
                mut written,
                done,
            } => {
                while written < buffer.len() {
                    match socket.write(&buffer[written..]) {
                        Ok(0) => {
                            return complete(
                                done,
                                Err(io::Error::from(ErrorKind::WriteZero).into()),
                            );
                        }
                        Ok(n) => written += n,
                        Err(SocketError::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(SocketError::Io(e)) if would_block(&e) => {
                            return Progress::Wait(
                                Interest::Write,
                                Operation::Write {
                                    buffer,
                                    written,
                                    done,
                                },
                            );
                        }
                        Err(e) => return complete(done, Err(e)),
                    }
                }
                complete(done, Ok(written))
            }
            Operation::Accept { done } => loop {
                match socket.accept() {
                    Ok(accepted) => return complete(done, Ok(accepted)),
                    Err(SocketError::Io(e))
                        if matches!(
                            e.kind(),
                            ErrorKind::Interrupted | ErrorKind::ConnectionAborted
                        ) =>
                    {
                        continue;
                    }
                    Err(SocketError::Io(e)) if would_block(&e) => {
                        return Progress::Wait(Interest::Read, Operation::Accept { done });
                    }
                    Err(e) => return complete(done, Err(e)),
                }
            },
            Operation::RecvFrom { mut buffer, done } => {
                buffer.clear();
                buffer.resize(MAX_DATAGRAM, 0);
                loop {
                    match socket.recv_from(&mut buffer) {
                        Ok(_) if socket.is_closed() => {
                            return complete(done, Err(SocketError::Closed));
                        }
                        Ok((n, from)) => {
                            buffer.truncate(n);
                            return complete(done, Ok((buffer, from)));
                        }
                        Err(SocketError::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(SocketError::Io(e)) if would_block(&e) => {
                            return Progress::Wait(
                                Interest::Read,
                                Operation::RecvFrom { buffer, done },
                            );
                        }
                        Err(e) => return complete(done, Err(e)),
                    }
                }
            }
            Operation::SendTo { buffer, peer, done } => loop {
                match socket.send_to(&buffer, peer) {
                    Ok(n) => return complete(done, Ok(n)),
                    Err(SocketError::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(SocketError::Io(e)) if would_block(&e) => {
                        return Progress::Wait(
                            Interest::Write,
                            Operation::SendTo { buffer, peer, done },
                        );
                    }
                    Err(e) => return complete(done, Err(e)),
                }
            },
        }
    }
}
