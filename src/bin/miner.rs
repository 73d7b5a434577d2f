// Miner node

use clap::Parser;
use powchain::cli::{MinerCli, run_miner};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = MinerCli::parse();

    if let Err(e) = run_miner(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
