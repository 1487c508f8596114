//! Runtime configuration for clients, servers and the completion dispatcher.
//!
//! Every knob has a default matching the values a freshly constructed peer would use
//! when nothing is supplied on the command line. The binaries map their `clap`
//! arguments onto these structs; library users build them directly.
use std::{thread, time::Duration};

use clap::ValueEnum;

/// Diagnostic switches shared by clients and servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceFlags {
    /// Log every socket read/write (byte counts at `debug`, raw bytes at `trace`).
    pub io: bool,
    /// Log every connection state transition at `info`.
    pub operations: bool,
}

impl TraceFlags {
    pub const NONE: TraceFlags = TraceFlags {
        io: false,
        operations: false,
    };

    pub const ALL: TraceFlags = TraceFlags {
        io: true,
        operations: true,
    };
}

/// Which asynchronous I/O backend drives socket operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Operations are staged with blocking I/O threads and their completions queued
    /// for the worker pool, in the manner of an OS completion port.
    #[default]
    CompletionQueue,
    /// Non-blocking sockets registered with a readiness poller; workers retry an
    /// operation once its socket becomes ready.
    Reactor,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub backend: BackendKind,
    /// Number of worker threads delivering completions.
    pub workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            backend: BackendKind::default(),
            workers,
        }
    }
}

pub const CONCURRENCY_LEVEL_DEFAULT: u16 = 4;
pub const OPERATION_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);
pub const RECONNECT_TRIES_MAX_DEFAULT: u8 = 2;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum simultaneous sockets to the peer; also the socket pool size.
    pub concurrency_level: u16,
    /// Deadline for each connect, write and read step. Doubled for the next
    /// attempt whenever a step times out.
    pub operation_timeout: Duration,
    /// How many times a request is retried on a fresh socket after an I/O error.
    pub reconnect_tries_max: u8,
    pub trace: TraceFlags,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            concurrency_level: CONCURRENCY_LEVEL_DEFAULT,
            operation_timeout: OPERATION_TIMEOUT_DEFAULT,
            reconnect_tries_max: RECONNECT_TRIES_MAX_DEFAULT,
            trace: TraceFlags::NONE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub trace: TraceFlags,
    /// Initial capacity of each connection's read buffer.
    pub read_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            trace: TraceFlags::NONE,
            read_buffer: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let config = ClientConfig::default();

        assert_eq!(config.concurrency_level, 4);
        assert_eq!(config.operation_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_tries_max, 2);
        assert_eq!(config.trace, TraceFlags::NONE);
    }

    #[test]
    fn dispatcher_has_workers() {
        let config = DispatcherConfig::default();

        assert!(config.workers > 0);
        assert_eq!(config.backend, BackendKind::CompletionQueue);
    }

    #[test]
    fn backend_from_cli_value() {
        let kind = BackendKind::from_str("reactor", true).unwrap();
        assert_eq!(kind, BackendKind::Reactor);

        let kind = BackendKind::from_str("completion-queue", true).unwrap();
        assert_eq!(kind, BackendKind::CompletionQueue);
    }
}
