//! framed-echo: a framed echo server and load client
//!
//! The server multiplexes connections over a readiness-based reactor:
//! - length-prefixed frames with magic/length validation
//! - one-shot readable interest, re-armed after each message cycle
//! - per-connection serialization locks with exclusive buffer ownership
//! - worker-pool dispatch so slow reads never stall the poll loop
//!
//! The load client drives the same wire protocol from plain blocking
//! sockets and verifies every echo byte-for-byte.

mod client;
mod config;
mod protocol;
mod runtime;

use clap::Parser;
use config::{CliArgs, CliCommand, Config};
use runtime::ShutdownHandle;
use std::sync::OnceLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bridge from the process signal handlers to the running server.
static SHUTDOWN: OnceLock<ShutdownHandle> = OnceLock::new();

extern "C" fn handle_signal(_signum: libc::c_int) {
    // Only async-signal-safe work here: an atomic flag flip and an
    // eventfd write inside the waker.
    if let Some(handle) = SHUTDOWN.get() {
        handle.request();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        CliCommand::Serve(serve_args) => {
            let config = Config::resolve(serve_args)?;

            info!(
                listen = %config.listen,
                buffer_size = config.buffer_size,
                max_events = config.max_events,
                workers = config.workers,
                "Starting framed-echo server"
            );

            let mut server = runtime::Server::init(&config)?;
            let _ = SHUTDOWN.set(server.shutdown_handle());
            unsafe {
                libc::signal(libc::SIGINT, handle_signal as usize);
                libc::signal(libc::SIGTERM, handle_signal as usize);
            }

            server.run()?;
        }
        CliCommand::Load(load_args) => {
            client::run(&load_args)?;
        }
    }

    Ok(())
}
