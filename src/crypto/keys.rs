//! Keys and addresses
//!
//! secp256k1 keypairs with uncompressed 64-byte public points, and the
//! prefixed address format derived from them.

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{random_32, sha256, CryptoError, CryptoResult};

/// Raw uncompressed public key: the 64-byte x||y point without the 0x04
/// SEC prefix.
pub type PublicKeyBytes = [u8; 64];

/// Hex digits of the hashed public key carried in an address.
pub const ADDRESS_HASH_LEN: usize = 40;

/// Sentinel sender for coinbase transactions.
pub const COINBASE_SENDER: &str = "COINBASE";

/// Network an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Address prefix for this network.
    pub fn prefix(self) -> &'static str {
        match self {
            Network::Mainnet => "XAI",
            Network::Testnet => "TXAI",
        }
    }

    /// The fee-sink sentinel address for this network.
    pub fn trade_fee_address(self) -> Address {
        Address(format!("{}TRADEFEE", self.prefix()))
    }
}

/// An opaque prefixed account identifier.
///
/// Regular addresses are the network prefix followed by the first 40
/// hex digits of SHA-256 over the raw public key. The `COINBASE` and
/// `{PREFIX}TRADEFEE` sentinels are also valid addresses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Derive the address owning a public key on the given network.
    pub fn from_public_key(public_key: &PublicKeyBytes, network: Network) -> Address {
        let digest = hex::encode(sha256(public_key));
        Address(format!("{}{}", network.prefix(), &digest[..ADDRESS_HASH_LEN]))
    }

    /// The coinbase sentinel.
    pub fn coinbase() -> Address {
        Address(COINBASE_SENDER.to_string())
    }

    pub fn is_coinbase(&self) -> bool {
        self.0 == COINBASE_SENDER
    }

    /// Parse and validate an address string.
    pub fn parse(s: &str, network: Network) -> CryptoResult<Address> {
        if s == COINBASE_SENDER || s == network.trade_fee_address().0 {
            return Ok(Address(s.to_string()));
        }
        let prefix = network.prefix();
        let suffix = s
            .strip_prefix(prefix)
            .ok_or_else(|| CryptoError::InvalidAddress(format!("'{s}' lacks {prefix} prefix")))?;
        if suffix.len() != ADDRESS_HASH_LEN {
            return Err(CryptoError::InvalidAddress(format!(
                "'{s}' has wrong length"
            )));
        }
        if !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CryptoError::InvalidAddress(format!(
                "'{s}' has non-hex payload"
            )));
        }
        Ok(Address(s.to_string()))
    }

    /// Well-formedness check without constructing.
    pub fn is_well_formed(s: &str, network: Network) -> bool {
        Address::parse(s, network).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Construct without validation, for keys read back from trusted
    /// storage. Callers own well-formedness.
    pub(crate) fn from_raw(s: &str) -> Address {
        Address(s.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A secp256k1 private scalar with its derived public point.
#[derive(Clone)]
pub struct KeyPair {
    secret: [u8; 32],
    public: PublicKeyBytes,
}

impl KeyPair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> KeyPair {
        let secp = Secp256k1::new();
        loop {
            // Rejection-sample until the bytes land inside the curve order.
            let candidate = random_32();
            if let Ok(secret_key) = SecretKey::from_slice(&candidate) {
                let public = uncompressed_point(&PublicKey::from_secret_key(&secp, &secret_key));
                return KeyPair {
                    secret: candidate,
                    public,
                };
            }
        }
    }

    /// Rebuild a keypair from a 32-byte private scalar.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> CryptoResult<KeyPair> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(secret)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        let public = uncompressed_point(&PublicKey::from_secret_key(&secp, &secret_key));
        Ok(KeyPair {
            secret: *secret,
            public,
        })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn public_bytes(&self) -> &PublicKeyBytes {
        &self.public
    }

    /// The address this keypair controls on the given network.
    pub fn address(&self, network: Network) -> Address {
        Address::from_public_key(&self.public, network)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak the scalar through debug output.
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish()
    }
}

/// Derive the 64-byte public point for a private scalar.
pub fn derive_public_key(secret: &[u8; 32]) -> CryptoResult<PublicKeyBytes> {
    Ok(*KeyPair::from_secret_bytes(secret)?.public_bytes())
}

fn uncompressed_point(key: &PublicKey) -> PublicKeyBytes {
    let sec1 = key.serialize_uncompressed();
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&sec1[1..]);
    raw
}

/// Parse a 64-byte raw point back into a secp256k1 public key.
pub(crate) fn parse_public_key(raw: &PublicKeyBytes) -> CryptoResult<PublicKey> {
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(raw);
    PublicKey::from_slice(&sec1).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_format() {
        let pair = KeyPair::generate();
        let addr = pair.address(Network::Mainnet);

        assert!(addr.as_str().starts_with("XAI"));
        assert_eq!(addr.as_str().len(), 43);

        let expected = format!(
            "XAI{}",
            &hex::encode(sha256(pair.public_bytes()))[..ADDRESS_HASH_LEN]
        );
        assert_eq!(addr.as_str(), expected);
    }

    #[test]
    fn test_testnet_prefix() {
        let pair = KeyPair::generate();
        let addr = pair.address(Network::Testnet);
        assert!(addr.as_str().starts_with("TXAI"));
        assert_eq!(addr.as_str().len(), 44);
    }

    #[test]
    fn test_address_uniqueness() {
        let a = KeyPair::generate().address(Network::Mainnet);
        let b = KeyPair::generate().address(Network::Mainnet);
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_accepts_sentinels() {
        assert!(Address::parse("COINBASE", Network::Mainnet).is_ok());
        assert!(Address::parse("XAITRADEFEE", Network::Mainnet).is_ok());
        assert!(Address::parse("TXAITRADEFEE", Network::Testnet).is_ok());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Address::parse("XAI123", Network::Mainnet).is_err());
        assert!(Address::parse(&format!("XAI{}", "g".repeat(40)), Network::Mainnet).is_err());
        assert!(Address::parse(&format!("BTC{}", "a".repeat(40)), Network::Mainnet).is_err());
        // Mainnet address on testnet has the wrong prefix
        assert!(Address::parse(&format!("XAI{}", "a".repeat(40)), Network::Testnet).is_err());
    }

    #[test]
    fn test_public_key_derivation_consistent() {
        let pair = KeyPair::generate();
        let derived = derive_public_key(pair.secret_bytes()).unwrap();
        assert_eq!(&derived, pair.public_bytes());

        let rebuilt = KeyPair::from_secret_bytes(pair.secret_bytes()).unwrap();
        assert_eq!(rebuilt.public_bytes(), pair.public_bytes());
    }
}
