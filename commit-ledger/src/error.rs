//! Error types for the ledger

use crate::types::{Address, Amount, ApprovalId, Digest, FillId, Round, WithdrawalStatus};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Zero or negative amount
    #[error("Amount must be positive, got {amount}")]
    InvalidAmount {
        /// Rejected amount
        amount: Amount,
    },

    /// Wallet is not part of the network
    #[error("Wallet {0} is not registered in the network")]
    NotRegistered(Address),

    /// Asset is not accounted for by this ledger
    #[error("Asset {0} is not registered with the ledger")]
    UnknownAsset(Address),

    /// Asset of an approval or fill does not line up
    #[error("Asset mismatch: {0}")]
    AssetMismatch(String),

    /// Round of a fill does not match its approval
    #[error("Round mismatch: {0}")]
    RoundMismatch(String),

    /// Instance of a fill does not match its approval
    #[error("Instance mismatch: {0}")]
    InstanceMismatch(String),

    /// Wallet of a fill does not match its approval
    #[error("Wallet mismatch: {0}")]
    WalletMismatch(String),

    /// Duplicate identifier
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Approval was already filled or canceled
    #[error("Approval {0} is already closed")]
    AlreadyClosed(ApprovalId),

    /// Fill amount above what the approval still allows
    #[error("Fill {fill_id} {side} amount {amount} exceeds approved amount {remaining}")]
    ExceedsApproved {
        /// Offending fill
        fill_id: FillId,
        /// `buy` or `sell`
        side: &'static str,
        /// Requested amount
        amount: Amount,
        /// Amount left on the approval
        remaining: Amount,
    },

    /// Not enough spendable funds
    #[error("Insufficient balance of {asset}: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Asset being spent
        asset: Address,
        /// Spendable amount
        available: Amount,
        /// Requested amount
        requested: Amount,
    },

    /// A withdrawal is already outstanding for the pair
    #[error("Withdrawal of {asset} for wallet {wallet} is already outstanding")]
    DoubleWithdrawal {
        /// Asset being withdrawn
        asset: Address,
        /// Withdrawing wallet
        wallet: Address,
    },

    /// Fill references an approval the ledger never saw
    #[error("Fill {fill_id} is not backed by an approval: {approval_id} not found")]
    UnbackedFill {
        /// Offending fill
        fill_id: FillId,
        /// Referenced approval
        approval_id: ApprovalId,
    },

    /// Confirmation without a pending withdrawal
    #[error("No pending withdrawal for transaction {0}")]
    NoPendingWithdrawal(Digest),

    /// Cancellation of a missing or terminal withdrawal
    #[error("There is no withdrawal to cancel for transaction {0}")]
    NoWithdrawalToCancel(Digest),

    /// Balance arithmetic would leave the `i128` range
    #[error("Amount overflow: {0}")]
    AmountOverflow(String),

    /// Withdrawal status transition not allowed
    #[error("Invalid withdrawal transition for {tx_hash}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Withdrawal transaction
        tx_hash: Digest,
        /// Current status
        from: WithdrawalStatus,
        /// Requested status
        to: WithdrawalStatus,
    },

    /// Record or tree element not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// No wallets in the snapshot for a round
    #[error("No wallets known to the ledger before round {0}")]
    EmptySnapshot(Round),

    /// Invariant violation (negative balance, sum overflow, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Merkle tree misuse
    #[error("Merkle error: {0}")]
    MerkleError(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Signature verification error
    #[error("Signature error: {0}")]
    SignatureError(String),

    /// Malformed hex, address or amount on the wire
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Caller mistake; the ledger state is untouched and the caller may retry
    /// with corrected input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidAmount { .. }
                | Error::NotRegistered(_)
                | Error::UnknownAsset(_)
                | Error::AssetMismatch(_)
                | Error::RoundMismatch(_)
                | Error::InstanceMismatch(_)
                | Error::WalletMismatch(_)
                | Error::AlreadyExists(_)
                | Error::AlreadyClosed(_)
                | Error::ExceedsApproved { .. }
                | Error::InsufficientBalance { .. }
                | Error::DoubleWithdrawal { .. }
                | Error::UnbackedFill { .. }
                | Error::NoPendingWithdrawal(_)
                | Error::NoWithdrawalToCancel(_)
                | Error::AmountOverflow(_)
                | Error::InvalidTransition { .. }
        )
    }

    /// Lookup miss
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::NotRegistered(_) | Error::EmptySnapshot(_)
        )
    }

    /// Bug signal: state the ledger logic should never produce
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::InvalidEncoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::InsufficientBalance {
            asset: Address::new([1u8; 20]),
            available: 5,
            requested: 10,
        };
        assert!(err.is_validation());
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("available 5, requested 10"));

        assert!(Error::NotFound("leaf".into()).is_not_found());
        assert!(Error::InvariantViolation("negative".into()).is_invariant_violation());
        assert!(!Error::InvariantViolation("negative".into()).is_validation());
        assert!(Error::AmountOverflow("balance".into()).is_validation());
        assert!(!Error::Storage("io".into()).is_validation());
    }
}
