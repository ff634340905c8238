use std::process::ExitCode;

use clap::Parser;
use kafka_cli::cli::{logging, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::from(255)
        }
    }
}
