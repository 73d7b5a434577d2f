// Keys, signatures and addresses (secp256k1 ECDSA)

use crate::core::{hash160, hash256};
use rand::rngs::OsRng;
use secp256k1::{All, Message, Secp256k1, SecretKey, ecdsa};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Version byte prefixed to the public key hash in the address string
pub const ADDRESS_VERSION: u8 = 0x00;

fn context() -> &'static Secp256k1<All> {
    static CONTEXT: OnceLock<Secp256k1<All>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::new)
}

/// Errors from decoding key material
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    InvalidPublicKey,
    InvalidSecretKey,
    InvalidSignature,
    InvalidAddress(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CryptoError::InvalidPublicKey => write!(f, "Invalid public key encoding"),
            CryptoError::InvalidSecretKey => write!(f, "Invalid secret key"),
            CryptoError::InvalidSignature => write!(f, "Invalid signature encoding"),
            CryptoError::InvalidAddress(reason) => write!(f, "Invalid address: {}", reason),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Compressed secp256k1 public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(secp256k1::PublicKey);

impl PublicKey {
    pub const LEN: usize = 33;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        secp256k1::PublicKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }

    pub fn serialize(&self) -> [u8; 33] {
        self.0.serialize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }
}

/// Compact (64-byte) ECDSA signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(ecdsa::Signature);

impl Signature {
    pub const LEN: usize = 64;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        ecdsa::Signature::from_compact(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.serialize_compact()
    }
}

/// 20-byte public key hash, shown as Base58Check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const LEN: usize = 20;

    pub fn from_pubkey_hash(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    fn checksum(payload: &[u8]) -> [u8; 4] {
        let digest = hash256(payload);
        let mut check = [0u8; 4];
        check.copy_from_slice(&digest.as_bytes()[..4]);
        check
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut payload = Vec::with_capacity(25);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(&self.0);
        let check = Self::checksum(&payload);
        payload.extend_from_slice(&check);
        write!(f, "{}", bs58::encode(payload).into_string())
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
        if bytes.len() != 25 {
            return Err(CryptoError::InvalidAddress(format!("length {}", bytes.len())));
        }
        if bytes[0] != ADDRESS_VERSION {
            return Err(CryptoError::InvalidAddress(format!("version {}", bytes[0])));
        }
        if Self::checksum(&bytes[..21]) != bytes[21..] {
            return Err(CryptoError::InvalidAddress("checksum mismatch".to_string()));
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[1..21]);
        Ok(Self(hash))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Address of a public key: HASH160 of its compressed encoding
pub fn derive_address(public_key: &PublicKey) -> Address {
    Address::from_pubkey_hash(hash160(&public_key.serialize()))
}

/// Sign hash256(data) with a secret key
pub fn sign(secret_key: &SecretKey, data: &[u8]) -> Signature {
    let digest = hash256(data);
    let message = Message::from_digest(digest.0);
    Signature(context().sign_ecdsa(&message, secret_key))
}

/// Check a signature over hash256(data). Never errors: a bad signature is `false`.
pub fn verify(public_key: &PublicKey, data: &[u8], signature: &Signature) -> bool {
    let digest = hash256(data);
    let message = Message::from_digest(digest.0);
    context()
        .verify_ecdsa(&message, &signature.0, &public_key.0)
        .is_ok()
}

/// Secret key with its derived public key and address
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
    pub address: Address,
}

impl KeyPair {
    /// Generate a new key pair from the OS random source
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey(secret_key.public_key(context()));
        let address = derive_address(&public_key);
        Self {
            secret_key,
            public_key,
            address,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        sign(&self.secret_key, data)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
