// CLI commands for the miner and wallet binaries

use crate::chain::ChainHandle;
use crate::config::{ConsensusParams, NodeConfig};
use crate::core::Address;
use crate::mining::StrategyKind;
use crate::network::Node;
use crate::storage::{BlockchainDB, ChainStore};
use crate::wallet::{Keystore, LightClient, TransactionBuilder};
use clap::{Parser, Subcommand};
use std::fs;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "miner")]
#[command(about = "Proof-of-work blockchain node", long_about = None)]
pub struct MinerCli {
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_address: IpAddr,

    #[arg(long, default_value_t = 8333)]
    pub listen_port: u16,

    /// Peer to connect to on startup (repeatable)
    #[arg(long = "bootstrap-peer", value_name = "HOST:PORT")]
    pub bootstrap_peers: Vec<String>,

    /// File with the reward address, or a wallet file whose default address is used.
    /// Without it the node relays but does not mine.
    #[arg(long, value_name = "FILE")]
    pub mining_pubkey: Option<PathBuf>,

    /// Directory of the block database; in-memory when omitted
    #[arg(long, value_name = "DIR")]
    pub persist_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = StrategyKind::FeePriority)]
    pub strategy: StrategyKind,

    #[arg(long, default_value_t = 1)]
    pub mining_threads: usize,

    /// Easy, fixed difficulty for local testing
    #[arg(long)]
    pub regtest: bool,
}

impl MinerCli {
    pub fn node_config(&self) -> Result<NodeConfig, String> {
        let mut config = NodeConfig::new(SocketAddr::new(self.listen_address, self.listen_port));
        config.bootstrap_peers = self
            .bootstrap_peers
            .iter()
            .map(|peer| resolve(peer))
            .collect::<Result<_, _>>()?;
        config.reward_address = self.mining_pubkey.as_deref().map(read_reward_address).transpose()?;
        config.persist_path = self.persist_path.clone();
        config.strategy = self.strategy;
        config.mining_threads = self.mining_threads.max(1);
        config.params = params(self.regtest);
        Ok(config)
    }
}

fn params(regtest: bool) -> ConsensusParams {
    if regtest {
        ConsensusParams::regtest()
    } else {
        ConsensusParams::mainnet()
    }
}

fn resolve(peer: &str) -> Result<SocketAddr, String> {
    peer.to_socket_addrs()
        .map_err(|e| format!("Invalid peer address {}: {}", peer, e))?
        .next()
        .ok_or_else(|| format!("Peer address {} did not resolve", peer))
}

/// Reward address from a file holding either the address itself or a wallet
fn read_reward_address(path: &Path) -> Result<Address, String> {
    let contents =
        fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    if let Ok(address) = contents.trim().parse() {
        return Ok(address);
    }

    let keystore = Keystore::load(path)?;
    keystore
        .default_address()
        .copied()
        .ok_or_else(|| format!("Wallet {} has no address", path.display()))
}

/// Open the chain and run the node until Ctrl-C or a persistence failure
pub async fn run_miner(cli: MinerCli) -> Result<(), String> {
    let config = cli.node_config()?;

    let store: Arc<dyn ChainStore> = match &config.persist_path {
        Some(path) => {
            log::info!("Opening block database at {}", path.display());
            Arc::new(BlockchainDB::new(path)?)
        }
        None => Arc::new(BlockchainDB::memory()?),
    };
    let chain = ChainHandle::open(config.params.clone(), store).map_err(|e| e.to_string())?;
    log::info!("Chain loaded at height {}", chain.tip_height());

    let node = Node::new(config, chain);
    let stopper = node.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutting down");
            stopper.shutdown();
        }
    });

    node.run().await
}

#[derive(Parser, Debug)]
#[command(name = "wallet")]
#[command(about = "Wallet for the proof-of-work chain", long_about = None)]
pub struct WalletCli {
    #[arg(long, value_name = "FILE")]
    pub wallet_file: PathBuf,

    /// Node to query and send transactions to
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:8333")]
    pub node: String,

    #[arg(long)]
    pub regtest: bool,

    #[command(subcommand)]
    pub command: WalletCommands,
}

#[derive(Subcommand, Debug)]
pub enum WalletCommands {
    /// Create a new address
    CreateAddress,

    /// List all addresses
    ListAddresses,

    /// Show confirmed balances
    ShowBalance {
        /// Address to check (all wallet addresses if not specified)
        address: Option<String>,
    },

    /// Show confirmed transactions of the wallet's addresses
    ShowTransactions,

    /// Send coins from the default address
    Transfer {
        /// Recipient address
        to: String,
        amount: u64,
        #[arg(long, default_value_t = 1)]
        fee: u64,
    },
}

/// CLI handler for wallet commands
pub struct WalletHandler {
    cli: WalletCli,
    keystore: Keystore,
}

impl WalletHandler {
    pub fn new(cli: WalletCli) -> Result<Self, String> {
        let keystore = Keystore::open(&cli.wallet_file)?;
        Ok(Self { cli, keystore })
    }

    pub async fn handle(&mut self) -> Result<(), String> {
        match &self.cli.command {
            WalletCommands::CreateAddress => {
                let addr = self.keystore.new_address();
                self.keystore.save(&self.cli.wallet_file)?;
                println!("New address: {}", addr);
                Ok(())
            }
            WalletCommands::ListAddresses => {
                let addresses = self.keystore.list_addresses();
                println!("Addresses ({}):", addresses.len());
                for addr in addresses {
                    let marker = if Some(&addr) == self.keystore.default_address() { " (default)" } else { "" };
                    println!("  {}{}", addr, marker);
                }
                Ok(())
            }
            WalletCommands::ShowBalance { address } => {
                let addresses = match address {
                    Some(a) => vec![parse_address(a)?],
                    None => self.keystore.list_addresses(),
                };
                let client = self.synced_client().await?;
                println!("Balances at height {}:", client.chain().tip_height());
                for addr in addresses {
                    println!("  {}: {}", addr, client.balance_of(&addr));
                }
                Ok(())
            }
            WalletCommands::ShowTransactions => {
                let client = self.synced_client().await?;
                for addr in self.keystore.list_addresses() {
                    println!("{}:", addr);
                    for (height, tx) in client.transactions_of(&addr) {
                        let direction = if tx.recipient == addr { "in" } else { "out" };
                        println!("  [{}] {} {} {} (fee {})", height, tx.txid().short(), direction, tx.amount, tx.fee);
                    }
                }
                Ok(())
            }
            WalletCommands::Transfer { to, amount, fee } => {
                let from = *self
                    .keystore
                    .default_address()
                    .ok_or("No default address. Create one with 'wallet create-address'")?;
                let to = parse_address(to)?;

                let mut client = self.synced_client().await?;
                let account = client.account(&from);
                let tx = TransactionBuilder::new(&self.keystore).build(&from, to, *amount, *fee, account)?;
                let txid = client.send_transaction(tx).await?;
                println!("Transaction sent: {}", txid);
                Ok(())
            }
        }
    }

    async fn synced_client(&self) -> Result<LightClient, String> {
        let addr = resolve(&self.cli.node)?;
        let mut client = LightClient::connect(addr, params(self.cli.regtest)).await?;
        client.sync().await?;
        Ok(client)
    }
}

fn parse_address(s: &str) -> Result<Address, String> {
    s.parse().map_err(|e| format!("Invalid address {}: {}", s, e))
}
