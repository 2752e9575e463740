//! The wes-gateway command line binary.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use tracing_log::AsTrace;

use wes_gateway::Config;

/// A proxy gateway for GA4GH Workflow Execution Service (WES) endpoints.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct App {
    /// Configuration file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbosity flags.
    #[command(flatten)]
    verbose: Verbosity,
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = App::parse();

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(app.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match app.config {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };

    wes_gateway::server::run(config).await
}
