//! Commit-chain Ledger
//!
//! Round-based ledger of client balances with Merkle solvency proofs.
//!
//! # Architecture
//!
//! - **Solvency tree**: Merkle tree whose nodes carry liability sums; a proof
//!   shows inclusion and bounds total liabilities
//! - **Single Writer**: One actor task applies every mutation
//! - **Snapshot reads**: Queries and proof generation never block the writer
//! - **Carry-forward on read**: A round without activity reads as the previous
//!   round's ending balance
//!
//! # Invariants
//!
//! - All-or-nothing: A rejected mutation leaves every table unchanged
//! - Deterministic proofs: Same balances and wallets → same root and proof
//! - History is stable: Wallets joining later never change an earlier round's tree
//! - At most one outstanding withdrawal per (asset, wallet)

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod ledger;
pub mod merkle;
pub mod solvency;
pub mod engine;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod actor;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    AccountRecord, Address, Amount, Approval, ApprovalId, AssetAmount, Digest, Fill, FillId,
    Intent, L2Order, Round, Signature, Withdrawal, WithdrawalRequest, WithdrawalStatus,
};
pub use solvency::{verify_proof, PartialProof, Proof, RootInfo, SolvencyTree};
pub use storage::Storage;
pub use codec::WireFormat;
pub use ledger::Ledger;
pub use config::Config;
