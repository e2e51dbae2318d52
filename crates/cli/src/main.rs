//! CLI entrypoint and subcommand orchestration.

mod bootstrap;
mod config;
#[cfg(not(test))]
mod shutdown;
#[cfg(test)]
mod test_support;

use clap::{Parser, Subcommand};

#[cfg(not(test))]
use config::Config;
#[cfg(not(test))]
use std::process::ExitCode;
#[cfg(not(test))]
use tracing::{error, info};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments for the devicegate server.
#[derive(Parser)]
#[command(name = "devicegate")]
#[command(about = "Realtime device gateway", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging to ~/.devicegate/logs/
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Override the listen port (beats PORT and the config file)
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands available in the application.
#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Start the gateway (default when no subcommand is given)
    Start,
    /// Print the resolved configuration and exit
    Config,
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> ExitCode {
    let cli = Cli::parse();
    // `.env` never overrides variables already set in the process environment.
    let dotenv = dotenvy::dotenv();

    let command = cli.command.unwrap_or(Commands::Start);

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard = init_tracing(&cli.log_level, cli.debug);

    if cli.debug {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = ?command,
            log_level = %cli.log_level,
            "========== devicegate session start =========="
        );
    }
    match &dotenv {
        Ok(path) => info!(path = %path.display(), "Loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => error!("Failed to read .env: {e}"),
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let err = bootstrap::BootError::from(e);
            error!("{err}");
            eprintln!("devicegate: {}", err.diagnostic());
            return ExitCode::from(bootstrap::EXIT_FAILURE);
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match command {
        Commands::Start => cmd_start(config).await,
        Commands::Config => match cmd_config(&config) {
            Ok(()) => ExitCode::from(bootstrap::EXIT_OK),
            Err(e) => {
                eprintln!("devicegate: {e}");
                ExitCode::from(bootstrap::EXIT_FAILURE)
            }
        },
    }
}

#[cfg(not(test))]
/// Installs the console subscriber, plus a daily debug file when `debug` is set.
fn init_tracing(
    log_level: &str,
    debug: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if !debug {
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
        return None;
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let log_dir = std::path::PathBuf::from(home)
        .join(".devicegate")
        .join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console = fmt::layer().with_target(false).with_filter(console_filter);
    let file = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_filter(EnvFilter::new("debug,hyper=info,hyper_util=info,sqlx=info"));
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Some(guard)
}

#[cfg(not(test))]
/// Runs the gateway until SIGINT/SIGTERM.
async fn cmd_start(config: Config) -> ExitCode {
    info!(port = config.server.port, "Starting devicegate");
    let result = bootstrap::run(config, shutdown::wait_for_shutdown()).await;
    match &result {
        Ok(()) => info!("devicegate stopped"),
        Err(e) => eprintln!("devicegate: {}", e.diagnostic()),
    }
    ExitCode::from(bootstrap::exit_status(&result))
}

#[cfg(not(test))]
/// Prints the resolved configuration with credentials masked.
fn cmd_config(config: &Config) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(&config.redacted())?;
    println!("{rendered}");
    if let Err(e) = config.validate() {
        anyhow::bail!("{e}");
    }
    Ok(())
}
