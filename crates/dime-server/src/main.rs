//! `dimed` — the DiME broker binary: CLI parsing, logging setup, signal
//! handling and process lifecycle around [`dime_broker::Broker`].

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use dime_broker::{Address, Broker, BrokerConfig, BrokerError};
use tracing::{error, info};

/// How often the event loop is polled for a pending shutdown signal while
/// otherwise blocked waiting on readiness.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "dimed", about = "Distributed Matlab Environment message broker")]
struct Cli {
    /// Local-domain socket path to bind. Ignored if a positional URI is
    /// given.
    #[arg(short = 'f', long = "socket", value_name = "PATH")]
    socket: Option<PathBuf>,

    /// `<proto>://<hostname>[:<port>]` address (`ipc`, `unix`, `tcp`).
    /// Overrides `-f` and the platform default when given.
    uri: Option<String>,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Transport security is an external wrapper (spec §1); this flag exists
    /// only so an operator's `tls://`-shaped invocation fails loudly instead
    /// of silently running in the clear.
    #[arg(long = "tls")]
    tls: bool,

    /// Close a client once its outbox exceeds this many approximate bytes,
    /// instead of letting a slow consumer grow it without bound.
    #[arg(long = "outbox-cap-bytes", value_name = "BYTES")]
    outbox_cap_bytes: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.tls {
        error!("--tls was given but dimed does not terminate TLS; put a TLS-terminating proxy in front of it instead");
        return ExitCode::FAILURE;
    }

    let address = match resolve_address(&cli) {
        Ok(address) => address,
        Err(err) => {
            error!(%err, "invalid address");
            return ExitCode::FAILURE;
        }
    };

    let config = BrokerConfig { address, outbox_cap_bytes: cli.outbox_cap_bytes, ..Default::default() };
    let mut broker = match Broker::bind(config) {
        Ok(broker) => broker,
        Err(err) => {
            error!(%err, "failed to start broker");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            error!(%err, "failed to install Ctrl-C handler, continuing without it");
        }
    }

    info!("dime broker listening");
    while !shutdown.load(Ordering::SeqCst) {
        if let Err(err) = broker.tick(Some(SHUTDOWN_POLL_INTERVAL)) {
            error!(%err, "fatal i/o error driving event loop");
            return ExitCode::FAILURE;
        }
    }
    info!("shutting down");
    ExitCode::SUCCESS
}

fn resolve_address(cli: &Cli) -> Result<Address, BrokerError> {
    if let Some(uri) = &cli.uri {
        return Address::parse(uri);
    }
    if let Some(path) = &cli.socket {
        return Ok(Address::Unix(path.clone()));
    }
    Ok(Address::default_for_platform())
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}
