use std::fmt;

use log::info;

use crate::{aio::Dispatcher, config::TraceFlags};

/// What clients and servers have in common: the dispatcher that runs their
/// completions and the diagnostics they were asked to emit.
#[derive(Debug, Clone)]
pub struct Peer {
    dispatcher: Dispatcher,
    trace: TraceFlags,
}

impl Peer {
    pub fn new(dispatcher: &Dispatcher, trace: TraceFlags) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            trace,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn trace(&self) -> TraceFlags {
        self.trace
    }

    /// Logs a connection state transition when operation tracing is on.
    pub(crate) fn trace_operation(&self, args: fmt::Arguments<'_>) {
        if self.trace.operations {
            info!("{args}");
        }
    }
}
