//! Actor-based concurrency for the ledger
//!
//! This module implements the single-writer pattern using Tokio actors:
//! - One task owns the [`LedgerEngine`] and applies mutations in mailbox order
//! - Each mutation commits as one write set, so readers never see half of it
//! - Async message passing with backpressure through a bounded mailbox
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                   │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)               │
//! │      LedgerEngine: check, stage, commit              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//!              Storage::commit(write set)
//! ```

use crate::engine::LedgerEngine;
use crate::metrics::Metrics;
use crate::solvency::SolvencyTree;
use crate::types::{
    AccountRecord, Address, Amount, Approval, ApprovalId, ApprovalRecord, Digest, Fill,
    FillRecord, L2Order, Round, RootCommit, Withdrawal, WithdrawalRequest,
};
use crate::{Error, Result};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Register a wallet
    Register {
        wallet: Address,
        round: Round,
        response: Reply<bool>,
    },

    /// Register an asset
    RegisterAsset {
        asset: Address,
        response: Reply<bool>,
    },

    /// Credit a deposit
    CreditDeposit {
        asset: Address,
        wallet: Address,
        amount: Amount,
        round: Round,
        response: Reply<AccountRecord>,
    },

    /// Insert an approval
    InsertApproval {
        approval: Approval,
        response: Reply<()>,
    },

    /// Insert an order and fee approval pair
    InsertOrder {
        order: L2Order,
        response: Reply<()>,
    },

    /// Cancel an approval
    CancelApproval {
        approval_id: ApprovalId,
        response: Reply<ApprovalRecord>,
    },

    /// Apply a fill
    InsertFill {
        fill: Fill,
        response: Reply<FillRecord>,
    },

    /// Debit a withdrawal
    Withdraw {
        request: WithdrawalRequest,
        response: Reply<Withdrawal>,
    },

    /// Record an unchecked withdrawal
    InsertWithdrawal {
        request: WithdrawalRequest,
        response: Reply<Withdrawal>,
    },

    /// Unchecked to pending
    ApproveWithdrawal {
        tx_hash: Digest,
        response: Reply<Withdrawal>,
    },

    /// Pending to confirmed
    ConfirmWithdrawal {
        tx_hash: Digest,
        response: Reply<Withdrawal>,
    },

    /// Cancel an outstanding withdrawal
    CancelWithdrawal {
        tx_hash: Digest,
        response: Reply<Withdrawal>,
    },

    /// Commit the solvency root of an asset and round
    CommitRound {
        asset: Address,
        round: Round,
        response: Reply<(RootCommit, SolvencyTree)>,
    },

    /// Flush memtables to disk now
    Flush {
        response: Reply<()>,
    },

    /// Shutdown actor
    Shutdown {
        response: Reply<()>,
    },
}

impl LedgerMessage {
    fn operation(&self) -> &'static str {
        match self {
            LedgerMessage::Register { .. } => "register",
            LedgerMessage::RegisterAsset { .. } => "register_asset",
            LedgerMessage::CreditDeposit { .. } => "credit_deposit",
            LedgerMessage::InsertApproval { .. } => "insert_approval",
            LedgerMessage::InsertOrder { .. } => "insert_order",
            LedgerMessage::CancelApproval { .. } => "cancel_approval",
            LedgerMessage::InsertFill { .. } => "insert_fill",
            LedgerMessage::Withdraw { .. } => "withdraw",
            LedgerMessage::InsertWithdrawal { .. } => "insert_withdrawal",
            LedgerMessage::ApproveWithdrawal { .. } => "approve_withdrawal",
            LedgerMessage::ConfirmWithdrawal { .. } => "confirm_withdrawal",
            LedgerMessage::CancelWithdrawal { .. } => "cancel_withdrawal",
            LedgerMessage::CommitRound { .. } => "commit_round",
            LedgerMessage::Flush { .. } => "flush",
            LedgerMessage::Shutdown { .. } => "shutdown",
        }
    }
}

/// Actor that processes ledger messages
#[derive(Debug)]
pub struct LedgerActor {
    /// Mutation engine
    engine: LedgerEngine,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,

    /// Metrics sink
    metrics: Metrics,

    /// Flush memtables to disk when shutting down
    flush_on_shutdown: bool,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        engine: LedgerEngine,
        mailbox: mpsc::Receiver<LedgerMessage>,
        metrics: Metrics,
        flush_on_shutdown: bool,
    ) -> Self {
        Self {
            engine,
            mailbox,
            metrics,
            flush_on_shutdown,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown { response } => {
                    let result = self.close();
                    // Engine releases its storage handle before the caller hears back
                    drop(self);
                    let _ = response.send(result);
                    return;
                }
                msg => self.handle_message(msg),
            }
        }

        // every handle dropped
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "Error closing ledger");
        }
    }

    fn close(&self) -> Result<()> {
        tracing::info!(operator = %self.engine.operator(), "Ledger actor stopping");
        if self.flush_on_shutdown {
            self.engine.storage().flush()?;
        }
        Ok(())
    }

    fn reply<T>(&self, operation: &'static str, response: Reply<T>, result: Result<T>) {
        match &result {
            Ok(_) => self.metrics.record_mutation(operation, true),
            Err(e) => {
                self.metrics.record_mutation(operation, false);
                tracing::debug!(operation, error = %e, "Mutation rejected");
            }
        }
        let _ = response.send(result);
    }

    /// Handle a single message
    fn handle_message(&self, msg: LedgerMessage) {
        let operation = msg.operation();
        let engine = &self.engine;

        match msg {
            LedgerMessage::Register { wallet, round, response } => {
                self.reply(operation, response, engine.register(wallet, round));
            }

            LedgerMessage::RegisterAsset { asset, response } => {
                self.reply(operation, response, engine.register_asset(asset));
            }

            LedgerMessage::CreditDeposit { asset, wallet, amount, round, response } => {
                self.reply(operation, response, engine.credit_deposit(asset, wallet, amount, round));
            }

            LedgerMessage::InsertApproval { approval, response } => {
                self.reply(operation, response, engine.insert_approval(approval));
            }

            LedgerMessage::InsertOrder { order, response } => {
                self.reply(operation, response, engine.insert_order(order));
            }

            LedgerMessage::CancelApproval { approval_id, response } => {
                self.reply(operation, response, engine.cancel_approval(approval_id));
            }

            LedgerMessage::InsertFill { fill, response } => {
                self.reply(operation, response, engine.insert_fill(fill));
            }

            LedgerMessage::Withdraw { request, response } => {
                self.reply(operation, response, engine.withdraw(request));
            }

            LedgerMessage::InsertWithdrawal { request, response } => {
                self.reply(operation, response, engine.insert_withdrawal(request));
            }

            LedgerMessage::ApproveWithdrawal { tx_hash, response } => {
                self.reply(operation, response, engine.approve_withdrawal(tx_hash));
            }

            LedgerMessage::ConfirmWithdrawal { tx_hash, response } => {
                self.reply(operation, response, engine.confirm_withdrawal(tx_hash));
            }

            LedgerMessage::CancelWithdrawal { tx_hash, response } => {
                self.reply(operation, response, engine.cancel_withdrawal(tx_hash));
            }

            LedgerMessage::CommitRound { asset, round, response } => {
                let started = Instant::now();
                let result = engine.commit_round(asset, round);
                if result.is_ok() {
                    self.metrics.record_tree_build(started.elapsed().as_secs_f64());
                    self.metrics.record_round_committed();
                }
                self.reply(operation, response, result);
            }

            LedgerMessage::Flush { response } => {
                let _ = response.send(engine.storage().flush());
            }

            LedgerMessage::Shutdown { .. } => {
                // Handled in run loop
            }
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> LedgerMessage) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Register a wallet
    pub async fn register(&self, wallet: Address, round: Round) -> Result<bool> {
        self.request(|response| LedgerMessage::Register { wallet, round, response })
            .await
    }

    /// Register an asset
    pub async fn register_asset(&self, asset: Address) -> Result<bool> {
        self.request(|response| LedgerMessage::RegisterAsset { asset, response })
            .await
    }

    /// Credit a deposit
    pub async fn credit_deposit(
        &self,
        asset: Address,
        wallet: Address,
        amount: Amount,
        round: Round,
    ) -> Result<AccountRecord> {
        self.request(|response| LedgerMessage::CreditDeposit {
            asset,
            wallet,
            amount,
            round,
            response,
        })
        .await
    }

    /// Insert an approval
    pub async fn insert_approval(&self, approval: Approval) -> Result<()> {
        self.request(|response| LedgerMessage::InsertApproval { approval, response })
            .await
    }

    /// Insert an order and fee approval pair
    pub async fn insert_order(&self, order: L2Order) -> Result<()> {
        self.request(|response| LedgerMessage::InsertOrder { order, response })
            .await
    }

    /// Cancel an approval
    pub async fn cancel_approval(&self, approval_id: ApprovalId) -> Result<ApprovalRecord> {
        self.request(|response| LedgerMessage::CancelApproval { approval_id, response })
            .await
    }

    /// Apply a fill
    pub async fn insert_fill(&self, fill: Fill) -> Result<FillRecord> {
        self.request(|response| LedgerMessage::InsertFill { fill, response })
            .await
    }

    /// Debit a withdrawal
    pub async fn withdraw(&self, request: WithdrawalRequest) -> Result<Withdrawal> {
        self.request(|response| LedgerMessage::Withdraw { request, response })
            .await
    }

    /// Record an unchecked withdrawal
    pub async fn insert_withdrawal(&self, request: WithdrawalRequest) -> Result<Withdrawal> {
        self.request(|response| LedgerMessage::InsertWithdrawal { request, response })
            .await
    }

    /// Unchecked to pending
    pub async fn approve_withdrawal(&self, tx_hash: Digest) -> Result<Withdrawal> {
        self.request(|response| LedgerMessage::ApproveWithdrawal { tx_hash, response })
            .await
    }

    /// Pending to confirmed
    pub async fn confirm_withdrawal(&self, tx_hash: Digest) -> Result<Withdrawal> {
        self.request(|response| LedgerMessage::ConfirmWithdrawal { tx_hash, response })
            .await
    }

    /// Cancel an outstanding withdrawal
    pub async fn cancel_withdrawal(&self, tx_hash: Digest) -> Result<Withdrawal> {
        self.request(|response| LedgerMessage::CancelWithdrawal { tx_hash, response })
            .await
    }

    /// Commit the solvency root of an asset and round
    pub async fn commit_round(&self, asset: Address, round: Round) -> Result<(RootCommit, SolvencyTree)> {
        self.request(|response| LedgerMessage::CommitRound { asset, round, response })
            .await
    }

    /// Flush memtables to disk now
    pub async fn flush(&self) -> Result<()> {
        self.request(|response| LedgerMessage::Flush { response }).await
    }

    /// Shutdown actor, waiting for the final flush
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|response| LedgerMessage::Shutdown { response }).await
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    engine: LedgerEngine,
    metrics: Metrics,
    mailbox_capacity: usize,
    flush_on_shutdown: bool,
) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1)); // Bounded channel for backpressure
    let actor = LedgerActor::new(engine, rx, metrics, flush_on_shutdown);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}
