use std::{
    error::Error,
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use clap::Parser;
use log::{error, info};
use skein::{
    BackendKind, Call, Client, ClientConfig, Dispatcher, DispatcherConfig, Endpoint,
    SharedSecret, TraceFlags, Transport,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Endpoint to call, e.g. oncrpc://127.0.0.1:32638
    uri: Endpoint,
    #[arg(long, default_value_t = 0x2000_5eca)]
    program: u32,
    #[arg(long, default_value_t = 1)]
    version: u32,
    #[arg(long, default_value_t = 1)]
    procedure: u32,
    /// Text sent as the call arguments
    #[arg(long, default_value = "hello")]
    payload: String,
    /// Number of calls to make
    #[arg(long, default_value_t = 1)]
    count: usize,
    /// Sockets kept open to the server
    #[arg(long, default_value_t = skein::config::CONCURRENCY_LEVEL_DEFAULT)]
    concurrency: u16,
    /// Deadline for each connect, write and read, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
    #[arg(long, default_value_t = skein::config::RECONNECT_TRIES_MAX_DEFAULT)]
    reconnect_tries: u8,
    /// Shared secret for oncrpcs:// endpoints
    #[arg(long)]
    secret: Option<String>,
    #[arg(long, value_enum, default_value_t = BackendKind::default())]
    backend: BackendKind,
    #[arg(long)]
    workers: Option<usize>,
    /// Log socket reads and writes
    #[arg(long)]
    trace_io: bool,
    /// Log connection state transitions
    #[arg(long)]
    trace_operations: bool,
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
    let config = ClientConfig {
        concurrency_level: cli.concurrency,
        operation_timeout: Duration::from_millis(cli.timeout_ms),
        reconnect_tries_max: cli.reconnect_tries,
        trace: TraceFlags {
            io: cli.trace_io,
            operations: cli.trace_operations,
        },
    };

    let client: Client<Call> = match (cli.uri.transport, &cli.secret) {
        (Transport::Tunnel, Some(secret)) => {
            let handshake = Arc::new(SharedSecret::new(secret.as_bytes())?);
            Client::connect_tunnel(&dispatcher, &cli.uri, config, handshake)?
        }
        (Transport::Tunnel, None) => return Err("oncrpcs:// endpoints need --secret".into()),
        _ => Client::connect(&dispatcher, &cli.uri, config)?,
    };

    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    for _ in 0..cli.count {
        let call = Call::new(cli.program, cli.version, cli.procedure, &cli.payload)?;
        let xid = call.xid();
        let tx = tx.clone();
        client.submit(call, move |result| {
            let _ = tx.send((xid, result));
        });
    }
    drop(tx);

    let mut failed = 0;
    for (xid, result) in rx {
        match result.map(|reply| reply.result::<String>()) {
            Ok(Ok(text)) => println!("{xid:#010x}: {text}"),
            Ok(Err(e)) => {
                failed += 1;
                error!("call {xid:#010x} was not successful: {e}");
            }
            Err(e) => {
                failed += 1;
                error!("call {xid:#010x} failed: {e}");
            }
        }
    }
    info!(
        "{} calls in {:?}, {failed} failed",
        cli.count,
        started.elapsed()
    );

    client.shutdown();
    dispatcher.shutdown();
    if failed > 0 {
        return Err(format!("{failed} of {} calls failed", cli.count).into());
    }
    Ok(())
}
