//! marketql CLI: ask questions of market bars, stream the answers.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "marketql",
    version,
    about = "Natural-language analytics over market bars: typed specs, parameterized SQL, streamed narration"
)]
struct Cli {
    #[command(subcommand)]
    command: marketql::cli::Commands,
}

fn main() {
    // stdout carries the event stream; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = marketql::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
