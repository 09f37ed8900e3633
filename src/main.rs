//! polyglot-echo: a concurrent TCP echo server
//!
//! Every accepted connection gets its own task, which writes back whatever
//! bytes the peer sends until the peer closes. Connection lifecycle and
//! traffic are logged to stderr at a configurable verbosity.
//!
//! Exit status is 2 for any configuration or socket setup error.

mod config;
mod connection;
mod logging;
mod server;

use config::Config;
use server::Server;
use std::process::ExitCode;
use tracing::debug;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(logging::FATAL_EXIT_CODE as u8);
        }
    };

    // Initialize logging before any connection task exists
    logging::init();
    logging::set_level(config.log_level);

    debug!(
        "Starting with host {}, port {}, workers {:?}, log level {}",
        config.host,
        config.port,
        config.workers,
        logging::effective_level()
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("echo-worker");
    // 0 means one worker per core, same as leaving it unset
    if let Some(workers) = config.workers.filter(|&n| n > 0) {
        builder.worker_threads(workers);
    }
    let runtime = builder
        .build()
        .unwrap_or_else(|e| logging::fatal(format_args!("Could not start runtime: {e}")));

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> ExitCode {
    let server = Server::bind(&config).unwrap_or_else(|e| logging::fatal(format_args!("{e}")));

    match server.run_forever().await {
        Ok(never) => match never {},
        Err(e) => logging::fatal(format_args!("{e}")),
    }
}
