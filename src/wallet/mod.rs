// Wallet: keys, transaction building and the light client

mod keystore;
mod tx_builder;
mod client;

pub use keystore::Keystore;
pub use tx_builder::TransactionBuilder;
pub use client::LightClient;
