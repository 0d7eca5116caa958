//! Cryptographic operations for the ledger
//!
//! This module provides:
//! - Keccak-256 hashing over packed, fixed-width encodings
//! - Canonical digests for approvals and fills
//! - Ed25519 key pair for the operator's fill attestation

use crate::types::{Address, Amount, Approval, Digest, Fill, Round, Signature};
use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha3::{Digest as _, Keccak256};

/// Packed encoder producing the byte layout the settlement verifier hashes.
///
/// Hashes are written as 32-byte words, amounts and counters as 32-byte
/// big-endian words, addresses as their 20 raw bytes. There is no length
/// prefix anywhere, so field order is the whole format.
#[derive(Debug, Default, Clone)]
pub struct PackedEncoder {
    buffer: Vec<u8>,
}

impl PackedEncoder {
    /// Create new encoder
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(128) }
    }

    /// Append a 32-byte digest
    pub fn digest(mut self, digest: &Digest) -> Self {
        self.buffer.extend_from_slice(digest.as_bytes());
        self
    }

    /// Append a 20-byte address
    pub fn address(mut self, address: &Address) -> Self {
        self.buffer.extend_from_slice(address.as_bytes());
        self
    }

    /// Append a signed amount, sign-extended to 32 bytes
    pub fn int(mut self, value: Amount) -> Self {
        self.buffer.extend_from_slice(&int_word(value));
        self
    }

    /// Append an unsigned counter as a 32-byte word
    pub fn uint(mut self, value: u64) -> Self {
        self.buffer.extend_from_slice(&uint_word(value));
        self
    }

    /// Append raw bytes
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    /// Encoded bytes
    pub fn finalize(self) -> Vec<u8> {
        self.buffer
    }

    /// Keccak-256 of the encoded bytes
    pub fn hash(self) -> Digest {
        keccak256(&self.buffer)
    }
}

/// Signed 32-byte big-endian word
pub fn int_word(value: Amount) -> [u8; 32] {
    let fill = if value < 0 { 0xff } else { 0x00 };
    let mut word = [fill; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Unsigned 32-byte big-endian word
pub fn uint_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Hash arbitrary bytes using Keccak-256
pub fn keccak256(data: &[u8]) -> Digest {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Digest::new(hasher.finalize().into())
}

/// Canonical digest of an approval
pub fn approval_digest(approval: &Approval) -> Digest {
    PackedEncoder::new()
        .raw(approval.approval_id.as_bytes())
        .uint(approval.round)
        .address(&approval.buy.asset)
        .int(approval.buy.amount)
        .address(&approval.sell.asset)
        .int(approval.sell.amount)
        .raw(&[approval.intent as u8])
        .address(&approval.owner)
        .address(&approval.instance_id)
        .hash()
}

/// Canonical digest of a fill
pub fn fill_digest(fill: &Fill) -> Digest {
    PackedEncoder::new()
        .raw(fill.fill_id.as_bytes())
        .raw(fill.approval_id.as_bytes())
        .uint(fill.round)
        .int(fill.buy_amount)
        .address(&fill.buy_asset)
        .int(fill.sell_amount)
        .address(&fill.sell_asset)
        .address(&fill.client_address)
        .address(&fill.instance_id)
        .hash()
}

/// Leaf digest of a wallet's liability in a round
pub fn liability_leaf(wallet: &Address, sum: Amount, round: Round) -> Digest {
    PackedEncoder::new().int(sum).address(wallet).uint(round).hash()
}

/// Ed25519 key pair for signing
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from a hex-encoded seed
    pub fn from_hex_seed(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed.trim_start_matches("0x"))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("signing seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign a digest
    pub fn sign(&self, digest: &Digest) -> Signature {
        let signature = self.signing_key.sign(digest.as_bytes());
        Signature::from_bytes(signature.to_bytes())
    }

    /// Verify a signature over a digest
    pub fn verify(&self, digest: &Digest, signature: &Signature) -> Result<()> {
        let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
        self.verifying_key
            .verify(digest.as_bytes(), &dalek_sig)
            .map_err(|e| Error::SignatureError(format!("Verification failed: {}", e)))
    }
}
