//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode for storage, JSON on the wire)
//! - Exact integer arithmetic in token base units
//! - Bit-for-bit agreement with the on-chain verifier when hashed

use crate::solvency::RootInfo;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Token amount in base units. Signed so that malformed proofs carrying a
/// negative sum can be represented and rejected.
pub type Amount = i128;

/// Commitment epoch
pub type Round = u64;

/// Approval identifier
pub type ApprovalId = Uuid;

/// Fill identifier
pub type FillId = Uuid;

/// Withdrawal identifier
pub type WithdrawalId = Uuid;

/// `a + b`, rejecting overflow
pub fn add_amount(a: Amount, b: Amount) -> crate::Result<Amount> {
    a.checked_add(b)
        .ok_or_else(|| crate::Error::AmountOverflow(format!("{} + {}", a, b)))
}

/// `a - b`, rejecting overflow
pub fn sub_amount(a: Amount, b: Amount) -> crate::Result<Amount> {
    a.checked_sub(b)
        .ok_or_else(|| crate::Error::AmountOverflow(format!("{} - {}", a, b)))
}

fn parse_fixed_hex<const N: usize>(s: &str) -> crate::Result<[u8; N]> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(raw)?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        crate::Error::InvalidEncoding(format!("expected {} bytes, got {}", N, b.len()))
    })
}

macro_rules! hex_bytes_type {
    ($name:ident, $len:expr) => {
        impl $name {
            /// Wrap raw bytes
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Raw bytes
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// `0x`-prefixed lowercase hex
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                parse_fixed_hex::<$len>(s).map(Self)
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// 20-byte account or token address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

hex_bytes_type!(Address, 20);

impl Address {
    /// The zero address
    pub const ZERO: Address = Address([0u8; 20]);
}

/// 32-byte keccak digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest([u8; 32]);

hex_bytes_type!(Digest, 32);

/// One side of an approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
    /// Token address
    pub asset: Address,
    /// Amount in base units
    pub amount: Amount,
}

/// Which side of an approval must be exhausted for it to close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum Intent {
    /// Done once the full buy amount is received
    BuyAll = 0,
    /// Done once the full sell amount is spent
    SellAll = 1,
}

/// Client intent to trade up to a bounded amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    /// Unique approval ID
    pub approval_id: ApprovalId,
    /// Round the approval is valid in
    pub round: Round,
    /// What the owner receives
    pub buy: AssetAmount,
    /// What the owner gives up (locked on insert)
    pub sell: AssetAmount,
    /// Completion rule
    pub intent: Intent,
    /// Owner wallet
    pub owner: Address,
    /// Mediator instance the approval is bound to
    pub instance_id: Address,
}

/// Operator-attested execution of an approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Unique fill ID
    pub fill_id: FillId,
    /// Backing approval
    pub approval_id: ApprovalId,
    /// Round of execution
    pub round: Round,
    /// Amount received by the client
    pub buy_amount: Amount,
    /// Asset received by the client
    pub buy_asset: Address,
    /// Amount given by the client
    pub sell_amount: Amount,
    /// Asset given by the client
    pub sell_asset: Address,
    /// Client wallet
    pub client_address: Address,
    /// Mediator instance
    pub instance_id: Address,
}

/// Matched order approval plus its fee approval, inserted together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Order {
    /// Trade approval
    pub order_approval: Approval,
    /// Fee approval
    pub fee_approval: Approval,
}

/// Withdrawal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum WithdrawalStatus {
    /// Seen but not yet checked or debited
    Unchecked = 1,
    /// Debited, awaiting settlement
    Pending = 2,
    /// Settled (terminal)
    Confirmed = 3,
    /// Canceled (terminal)
    Canceled = 4,
}

impl WithdrawalStatus {
    /// Counts against the one-outstanding-withdrawal rule
    pub fn is_active(&self) -> bool {
        matches!(self, WithdrawalStatus::Unchecked | WithdrawalStatus::Pending)
    }

    /// Check if withdrawal is in terminal state
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// Withdrawal request as submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Request ID
    pub id: WithdrawalId,
    /// Settlement transaction hash (unique)
    pub tx_hash: Digest,
    /// Asset withdrawn
    pub asset: Address,
    /// Withdrawing wallet
    pub wallet: Address,
    /// Amount in base units
    pub amount: Amount,
    /// Round the withdrawal is debited in
    pub round: Round,
}

/// Stored withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Original request
    pub request: WithdrawalRequest,
    /// Life-cycle status
    pub status: WithdrawalStatus,
    /// When the ledger first saw the request
    pub created_at: DateTime<Utc>,
}

/// Registered wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    /// Wallet address
    pub address: Address,
    /// Round of first registration
    pub round_joined: Round,
}

/// Per-(asset, wallet, round) balance record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Total carried in from the previous round
    pub opening_balance: Amount,
    /// Spendable balance
    pub balance: Amount,
    /// Reserved by open approvals
    pub locked: Amount,
    /// Deposited this round
    pub deposited: Amount,
    /// Withdrawn this round
    pub withdrawn: Amount,
    /// Received through fills this round
    pub bought: Amount,
    /// Spent through fills this round
    pub sold: Amount,
}

impl AccountRecord {
    /// Record for a round with no activity yet, following `previous`
    pub fn carried_from(previous: &AccountRecord) -> crate::Result<Self> {
        let total = previous.total()?;
        Ok(Self {
            opening_balance: total,
            balance: total,
            ..Default::default()
        })
    }

    /// Ending total: spendable plus locked
    pub fn total(&self) -> crate::Result<Amount> {
        add_amount(self.balance, self.locked)
    }
}

/// Approval status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ApprovalStatus {
    /// Funds locked, fills accepted
    Open = 1,
    /// Filled or canceled (terminal)
    Closed = 2,
}

/// Stored approval with what is left of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// The approval as inserted
    pub approval: Approval,
    /// Sell amount still locked
    pub remaining_sell: Amount,
    /// Buy amount still expected
    pub remaining_buy: Amount,
    /// Current status
    pub status: ApprovalStatus,
}

impl ApprovalRecord {
    /// Fresh record for a newly inserted approval
    pub fn open(approval: Approval) -> Self {
        Self {
            remaining_sell: approval.sell.amount,
            remaining_buy: approval.buy.amount,
            approval,
            status: ApprovalStatus::Open,
        }
    }

    /// Whether the intent is satisfied
    pub fn is_exhausted(&self) -> bool {
        match self.approval.intent {
            Intent::BuyAll => self.remaining_buy == 0,
            Intent::SellAll => self.remaining_sell == 0,
        }
    }
}

/// Stored fill with its canonical digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    /// The fill as inserted
    pub fill: Fill,
    /// Canonical keccak digest
    pub digest: Digest,
    /// Operator attestation over `digest`, when the ledger holds a key
    pub operator_signature: Option<Signature>,
}

/// Root triple anchored for one asset and round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootCommit {
    /// Token address
    pub asset: Address,
    /// Committed round
    pub round: Round,
    /// Root content, height and width
    pub root: RootInfo,
    /// `H(content, height, width)`
    pub padded_root: Digest,
}

/// Digital signature (Ed25519)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Signature bytes (64 bytes)
    #[serde(with = "serde_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify signature
    pub fn verify(&self, message: &[u8], public_key: &[u8; 32]) -> bool {
        use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

        let signature = DalekSignature::from_bytes(&self.bytes);

        let verifying_key = match VerifyingKey::from_bytes(public_key) {
            Ok(key) => key,
            Err(_) => return false,
        };

        verifying_key.verify(message, &signature).is_ok()
    }
}
