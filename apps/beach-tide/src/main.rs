use beach_tide::telemetry::logging;
use beach_tide::terminal::{app, cli::Cli};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("⚠️  {err}");
    }
    if let Err(err) = app::run(cli).await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}
