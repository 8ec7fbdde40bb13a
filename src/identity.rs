//! Coordinator identity: on-disk keypair, addresses, and signing.
//!
//! A coordinator address is the domain-separated BLAKE3 hash of its ed25519
//! public key. The signing seed lives in `identity.key` inside the data
//! directory and is generated on first start.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Errors from identity handling.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed identity key file: {0}")]
    Malformed(String),
}

/// A coordinator address (hash of the signing public key).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub crate::Hash);

impl Address {
    /// Derive the address of an ed25519 public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Address(crate::hash_domain("arbor.address", key.as_bytes()))
    }

    /// Parse a full 64-character hex address.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let raw: crate::Hash = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Address(raw))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &hex::encode(self.0)[..8])
    }
}

/// A detached signature (raw ed25519 bytes).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn empty() -> Self {
        Signature(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// Signing seam consumed by the proposal composer and the consensus engine.
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;
    fn public_key_bytes(&self) -> [u8; 32];
    fn sign(&self, payload: &[u8]) -> Signature;
}

/// Local coordinator identity backed by an on-disk ed25519 seed.
pub struct LocalIdentity {
    signing_key: SigningKey,
    public_key: VerifyingKey,
    address: Address,
}

impl LocalIdentity {
    /// Load the identity seed from `identity.key` in the data directory,
    /// generating and persisting a fresh one if the file does not exist.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, IdentityError> {
        let path = data_dir.join("identity.key");
        let seed: [u8; 32] = if path.exists() {
            let bytes = std::fs::read(&path)?;
            bytes.as_slice().try_into().map_err(|_| {
                IdentityError::Malformed(format!(
                    "expected 32-byte seed, found {} bytes",
                    bytes.len()
                ))
            })?
        } else {
            let seed: [u8; 32] = rand::random();
            std::fs::create_dir_all(data_dir)?;
            std::fs::write(&path, seed)?;
            seed
        };
        Ok(Self::from_seed(seed))
    }

    /// Build an identity from a raw seed. Deterministic; used by tests and
    /// local simulations.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key();
        let address = Address::from_public_key(&public_key);
        LocalIdentity {
            signing_key,
            public_key,
            address,
        }
    }
}

impl Signer for LocalIdentity {
    fn address(&self) -> Address {
        self.address
    }

    fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key.to_bytes()
    }

    fn sign(&self, payload: &[u8]) -> Signature {
        Signature(self.signing_key.sign(payload).to_bytes().to_vec())
    }
}

/// Parse a hex-encoded ed25519 public key (config format) into its raw
/// bytes and derived coordinator address. Rejects byte strings that are not
/// a valid curve point.
pub fn parse_public_key(hex_key: &str) -> Result<([u8; 32], Address), IdentityError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| IdentityError::Malformed(format!("bad hex public key: {e}")))?;
    let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        IdentityError::Malformed(format!(
            "expected 32-byte public key, found {} bytes",
            bytes.len()
        ))
    })?;
    let key = VerifyingKey::from_bytes(&raw)
        .map_err(|e| IdentityError::Malformed(format!("invalid public key: {e}")))?;
    Ok((raw, Address::from_public_key(&key)))
}

/// Verify a detached signature against a raw ed25519 public key.
///
/// Returns false (never errors) for malformed keys or signatures; callers
/// treat any failure as an invalid signature.
pub fn verify_signature(public_key: &[u8; 32], payload: &[u8], signature: &Signature) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(raw) = <[u8; 64]>::try_from(signature.0.as_slice()) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&raw);
    key.verify(payload, &sig).is_ok()
}
