// Wallet - light client

use clap::Parser;
use powchain::cli::{WalletCli, WalletHandler};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = WalletCli::parse();

    let mut handler = match WalletHandler::new(cli) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Error opening wallet: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = handler.handle().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
