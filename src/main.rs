mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ppsn-offline")]
#[command(about = "Offline object store and synchronization for PPSn environments")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ppsn/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the environment name from the config file
  #[arg(short, long)]
  environment: Option<String>,

  /// Do not contact the server
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to stderr and to a daily rolling file under the data directory.
/// The returned guard flushes the file writer on drop.
fn init_logging(log_dir: &std::path::Path) -> WorkerGuard {
  let file_appender = tracing_appender::rolling::daily(log_dir, "ppsn-offline.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = ppsn_offline::config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(name) = args.environment {
    config.environment.name = name;
    config.environment.validate()?;
  }
  config.offline |= args.offline;

  let _guard = init_logging(&config.data_root()?.join("logs"));

  commands::run(args.command, config).await
}
