use std::{error::Error, sync::Arc, sync::mpsc};

use clap::Parser;
use log::{info, warn};
use skein::{
    BackendKind, Call, Dispatcher, DispatcherConfig, Endpoint, Reply, Responder, Server,
    ServerConfig, SharedSecret, TraceFlags, Transport,
    protocol::rpc::AcceptedStatus,
};

/// Echo program served by default, in the unassigned user-defined range.
const ECHO_PROGRAM: u32 = 0x2000_5eca;
const NULL_PROCEDURE: u32 = 0;
const ECHO_PROCEDURE: u32 = 1;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Endpoint to serve, e.g. oncrpc://0.0.0.0:32638
    uri: Endpoint,
    /// Program number answered by the echo service
    #[arg(long, default_value_t = ECHO_PROGRAM)]
    program: u32,
    /// Program version answered by the echo service
    #[arg(long, default_value_t = 1)]
    version: u32,
    /// Completion backend
    #[arg(long, value_enum, default_value_t = BackendKind::default())]
    backend: BackendKind,
    /// Dispatcher worker threads
    #[arg(long)]
    workers: Option<usize>,
    /// Shared secret for oncrpcs:// endpoints
    #[arg(long)]
    secret: Option<String>,
    /// Log socket reads and writes
    #[arg(long)]
    trace_io: bool,
    /// Log connection state transitions
    #[arg(long)]
    trace_operations: bool,
}

fn echo(program: u32, version: u32) -> impl Fn(Call, Responder<Reply>) + Send + Sync + 'static {
    move |call: Call, responder: Responder<Reply>| {
        let reply = if call.program() != program {
            call.reply_error(AcceptedStatus::ProgramUnavailable)
        } else if call.version() != version {
            call.reply_error(AcceptedStatus::ProgramMismatch {
                low: version,
                high: version,
            })
        } else {
            match call.procedure() {
                NULL_PROCEDURE => match call.reply(&()) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("failed to encode reply: {e}");
                        call.reply_error(AcceptedStatus::SystemError)
                    }
                },
                ECHO_PROCEDURE => match call.decode_args::<String>() {
                    Ok(text) => call
                        .reply(&text)
                        .unwrap_or_else(|_| call.reply_error(AcceptedStatus::SystemError)),
                    Err(_) => call.reply_error(AcceptedStatus::GarbageArgs),
                },
                _ => call.reply_error(AcceptedStatus::ProcedureUnavailable),
            }
        };
        responder.respond(reply);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut dispatcher_config = DispatcherConfig {
        backend: cli.backend,
        ..Default::default()
    };
    if let Some(workers) = cli.workers {
        dispatcher_config.workers = workers;
    }
    let dispatcher = Dispatcher::new(&dispatcher_config)?;
    let config = ServerConfig {
        trace: TraceFlags {
            io: cli.trace_io,
            operations: cli.trace_operations,
        },
        ..Default::default()
    };

    let handler = echo(cli.program, cli.version);
    let server = match (cli.uri.transport, cli.secret) {
        (Transport::Tunnel, Some(secret)) => {
            let handshake = Arc::new(SharedSecret::new(secret)?);
            Server::bind_tunnel(&dispatcher, &cli.uri, handler, config, handshake)?
        }
        (Transport::Tunnel, None) => return Err("oncrpcs:// endpoints need --secret".into()),
        _ => Server::bind(&dispatcher, &cli.uri, handler, config)?,
    };
    info!("listening on {}", server.local_addr());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    rx.recv()?;

    server.shutdown();
    dispatcher.shutdown();
    Ok(())
}
