// Key management

use crate::core::{Address, KeyPair};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// On-disk form of one key
#[derive(Serialize, Deserialize)]
struct StoredKey {
    /// Hex encoded secret key
    secret_key: String,
    address: Address,
}

#[derive(Serialize, Deserialize)]
struct StoredKeystore {
    keys: Vec<StoredKey>,
    default_address: Option<Address>,
}

/// Keystore - manages multiple key pairs
#[derive(Debug, Default)]
pub struct Keystore {
    keys: BTreeMap<Address, KeyPair>,
    default_address: Option<Address>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a new address; the first one becomes the default
    pub fn new_address(&mut self) -> Address {
        let keypair = KeyPair::generate();
        let address = keypair.address;
        self.default_address.get_or_insert(address);
        self.keys.insert(address, keypair);
        address
    }

    pub fn get_keypair(&self, address: &Address) -> Option<&KeyPair> {
        self.keys.get(address)
    }

    pub fn list_addresses(&self) -> Vec<Address> {
        self.keys.keys().copied().collect()
    }

    pub fn default_address(&self) -> Option<&Address> {
        self.default_address.as_ref()
    }

    pub fn set_default(&mut self, address: Address) -> Result<(), String> {
        if !self.keys.contains_key(&address) {
            return Err("Address not found in keystore".to_string());
        }
        self.default_address = Some(address);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    /// Save keystore to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let data = StoredKeystore {
            keys: self
                .keys
                .values()
                .map(|kp| StoredKey {
                    secret_key: hex::encode(kp.secret_bytes()),
                    address: kp.address,
                })
                .collect(),
            default_address: self.default_address,
        };

        let json = serde_json::to_string_pretty(&data)
            .map_err(|e| format!("Failed to serialize keystore: {}", e))?;

        fs::write(path, json).map_err(|e| format!("Failed to write keystore file: {}", e))
    }

    /// Load keystore from a JSON file, checking every stored address against its key
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let json = fs::read_to_string(path).map_err(|e| format!("Failed to read keystore file: {}", e))?;

        let data: StoredKeystore =
            serde_json::from_str(&json).map_err(|e| format!("Failed to deserialize keystore: {}", e))?;

        let mut keys = BTreeMap::new();
        for stored in data.keys {
            let bytes = hex::decode(&stored.secret_key).map_err(|e| format!("Invalid secret key: {}", e))?;
            let keypair = KeyPair::from_secret_bytes(&bytes).map_err(|e| e.to_string())?;
            if keypair.address != stored.address {
                return Err(format!("Key does not match address {}", stored.address));
            }
            keys.insert(keypair.address, keypair);
        }

        if let Some(default) = &data.default_address {
            if !keys.contains_key(default) {
                return Err(format!("Default address {} has no key", default));
            }
        }

        Ok(Self {
            keys,
            default_address: data.default_address,
        })
    }

    /// Load the file if it exists, otherwise start empty
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }
}
