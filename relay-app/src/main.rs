//! chatrelay main binary.

mod config;
mod config_control;
mod dispatcher;
mod init;
mod pipeline;
mod quota;
mod server;
mod session;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(
    name = "chatrelay",
    version,
    about = "Relays chat messages to a language model with daily quotas"
)]
struct Cli {
    /// Config file (default: ~/.chatrelay/config.toml).
    #[arg(long, global = true, env = "CHATRELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start relaying messages (default).
    Serve,
    /// Write a config template to ~/.chatrelay (never overwrites).
    Init,
    /// Validate config and report what `serve` would run with.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Init => {
            let report = match cli.config {
                Some(path) => init::initialize_at(&path).await?,
                None => init::initialize_default().await?,
            };
            if report.created {
                println!("chatrelay init: created {}", report.path.display());
            } else {
                println!(
                    "chatrelay init: kept existing {}",
                    report.path.display()
                );
            }
            println!("next: set llm.model and a telegram bot token, then run `chatrelay serve`");
            Ok(())
        }
        Command::Doctor => server::doctor(cli.config).await,
    }
}

const DEFAULT_LOG_FILTER: &str = "info,chatrelay=debug,relay_channels=debug,relay_llm=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(anyhow::anyhow!(
                "unsupported CHATRELAY_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            )),
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let log_format =
        LogFormat::parse(&std::env::var("CHATRELAY_LOG_FORMAT").unwrap_or_default())?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);
    match log_format {
        LogFormat::Json => builder.json().flatten_event(true).init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }

    tracing::info!(?log_format, "tracing initialized");
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        tracing::error!(
            location = ?panic_info.location(),
            message,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}
