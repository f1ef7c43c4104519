use std::process::ExitCode;

use clap::Parser;

use http_reply::{launch, ActivityLog, ShutdownHandle};
use reply_trace::LogOptions;

mod cli;

/// First interrupt stops accepting and lets open connections finish, a
/// second one drops them.
async fn watch_interrupts(handle: ShutdownHandle) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    reply_trace::info!("Interrupted, finishing open connections (Ctrl-C again to stop now)");
    handle.graceful();

    if tokio::signal::ctrl_c().await.is_ok() {
        reply_trace::warn!("Interrupted again, dropping open connections");
        handle.hard();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Args::parse();

    let config = match args.resolve() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let options = LogOptions {
        level: args.level(),
        log_file: config.log_file.clone(),
    };
    if let Err(err) = reply_trace::init(&options) {
        eprintln!("Logging unavailable: {err}");
    }

    let server = match launch(&config, ActivityLog::tracing()).await {
        Ok(server) => server,
        Err(err) => {
            reply_trace::error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    tokio::spawn(watch_interrupts(server.shutdown_handle()));

    let summary = server.serve().await;
    reply_trace::info!("Done: {}", summary);

    ExitCode::SUCCESS
}
