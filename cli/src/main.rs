//! Entry point for the `datalab` binary.

use clap::Parser;
use datalab_cli::Cli;
use datalab_cli::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let exit_code = run_main(cli).await?;
    std::process::exit(exit_code);
}
