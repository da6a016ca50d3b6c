//! gantry-server binary entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use gantry_server::{Options, ServerInstance};
use tracing::error;

/// Supervisory core of the gantry L4/L7 proxy.
#[derive(Parser)]
#[command(name = "gantry-server", version, about)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long)]
    config_path: PathBuf,

    /// Hot-restart generation; epoch N inherits sockets from epoch N-1.
    #[arg(long, default_value_t = 0)]
    restart_epoch: u32,

    /// Directory for hot-restart domain sockets.
    #[arg(long, default_value = "/tmp/gantry")]
    base_dir: PathBuf,

    /// Number of worker threads.
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// File to write the resolved admin address to.
    #[arg(long)]
    admin_address_path: Option<PathBuf>,

    /// Access-log flush interval in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    file_flush_interval_ms: u64,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gantry={}", args.log_level).into()),
        )
        .init();

    let options = Options {
        config_path: args.config_path,
        restart_epoch: args.restart_epoch,
        base_dir: args.base_dir,
        concurrency: args.concurrency,
        admin_address_path: args.admin_address_path,
        file_flush_interval: Duration::from_millis(args.file_flush_interval_ms.max(100)),
    };

    let mut server = match ServerInstance::new(options) {
        Ok(server) => server,
        Err(error) => {
            error!(%error, "initialization failed");
            return ExitCode::from(1);
        }
    };

    server.run();
    ExitCode::SUCCESS
}
