//! monrelay daemon.
//!
//! Wires the relay control loop to its process boundary: CLI flags, handler
//! configuration, signal handling, pid file, and exit codes. Runs against the
//! in-process loopback broker and in-memory queue; a production deployment
//! links its site broker client and durable queue adapters in their place and
//! reuses everything else here.
//!
//! Exit codes: 0 on a graceful quit, 1 on total handler exhaustion, 2 on a
//! configuration error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use monrelay::config::{load_handler_decls, BrokerTargets, HandlerCatalog, RelayConfig};
use monrelay::envelope::DirSink;
use monrelay::error::RelayError;
use monrelay::queue::MemoryQueue;
use monrelay::registry::LogHandler;
use monrelay::relay::{run, RelayContext};
use monrelay::LoopbackBroker;

#[derive(Debug, Parser)]
#[command(name = "monrelayd", version, about = "Monitoring message relay daemon")]
struct Cli {
    /// Broker URI to connect to.
    #[arg(long, conflicts_with = "broker_list")]
    broker_uri: Option<String>,

    /// File listing broker URIs, one per line; rotated on reconnect.
    #[arg(long)]
    broker_list: Option<PathBuf>,

    /// Handler configuration file (TOML).
    #[arg(long, default_value = "handlers.toml")]
    handlers: PathBuf,

    /// Directory the error sink files envelopes under.
    #[arg(long, default_value = "errors")]
    error_dir: PathBuf,

    /// Idle seconds before the keepalive probe runs.
    #[arg(long, default_value_t = 60)]
    ping_interval: u64,

    /// Broker I/O timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Control file whose existence requests a graceful quit.
    #[arg(long)]
    quit_file: Option<PathBuf>,

    /// Write the process id here at startup, remove it on exit.
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

/// Built-in handler kinds resolvable from configuration.
fn builtin_catalog() -> HandlerCatalog {
    let mut catalog = HandlerCatalog::new();
    catalog.register_factory("log", |_| Ok(Arc::new(LogHandler)));
    catalog
}

fn build_context(cli: &Cli, abort: Arc<AtomicBool>) -> Result<RelayContext, RelayError> {
    let targets = match (&cli.broker_uri, &cli.broker_list) {
        (Some(uri), None) => BrokerTargets::single(uri.clone()),
        (None, Some(list)) => BrokerTargets::from_list_file(list)?,
        _ => return Err(monrelay::ConfigError::MissingBroker.into()),
    };

    let mut config = RelayConfig {
        ping_interval: Duration::from_secs(cli.ping_interval),
        io_timeout: Duration::from_secs(cli.timeout),
        quit_file: cli.quit_file.clone(),
        ..RelayConfig::default()
    };
    // Keep the handler budget under the I/O budget whatever --timeout says.
    config.handler_timeout = config.io_timeout / 2;
    config.validate()?;

    let decls = load_handler_decls(&cli.handlers)?;
    let registry = builtin_catalog().build_registry(&decls, config.scoring)?;
    if registry.is_empty() {
        tracing::warn!("no handlers configured; the relay will exit as exhausted");
    }

    let sink = DirSink::open(&cli.error_dir).map_err(|e| {
        RelayError::Config(monrelay::ConfigError::Io {
            path: cli.error_dir.clone(),
            message: e.to_string(),
        })
    })?;

    Ok(RelayContext {
        registry,
        queue: Box::new(MemoryQueue::new()),
        sink: Box::new(sink),
        connector: Box::new(LoopbackBroker::new()),
        targets,
        config,
        abort,
    })
}

fn write_pid_file(path: &PathBuf) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let abort = Arc::new(AtomicBool::new(false));
    {
        let abort = Arc::clone(&abort);
        if let Err(e) = ctrlc::set_handler(move || {
            abort.store(true, Ordering::Relaxed);
        }) {
            tracing::error!(error = %e, "could not install signal handler");
            return ExitCode::from(2);
        }
    }

    let mut ctx = match build_context(&cli, abort) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::from(2);
        }
    };

    if let Some(pid_file) = &cli.pid_file {
        if let Err(e) = write_pid_file(pid_file) {
            tracing::error!(path = %pid_file.display(), error = %e, "could not write pid file");
            return ExitCode::from(2);
        }
    }

    tracing::info!(handlers = ctx.registry.len(), "monrelay starting");
    let result = run(&mut ctx);

    if let Some(pid_file) = &cli.pid_file {
        if let Err(e) = std::fs::remove_file(pid_file) {
            tracing::warn!(path = %pid_file.display(), error = %e, "could not remove pid file");
        }
    }

    match result {
        Ok(()) => {
            tracing::info!("monrelay stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "monrelay exiting");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
