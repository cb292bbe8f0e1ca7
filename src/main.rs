use clap::Parser;

use dvpn_monitor::cli::{run_cli, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_cli(cli).await
}
