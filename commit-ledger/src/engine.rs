//! Mutation engine
//!
//! Every mutator stages its checks and writes in one [`Txn`] and commits it
//! only when all checks pass, so a rejected call leaves the store untouched.
//! The engine is owned by the ledger actor and is the only writer.
//!
//! Balances are kept per `(asset, wallet, round)`. A round without a record
//! reads as the previous record's total carried forward; a write at round
//! `r` shifts the opening and spendable balance of records that already
//! exist after `r` by the same total delta, and creates nothing else.

use crate::{
    crypto::{fill_digest, KeyPair},
    error::{Error, Result},
    solvency::{SolvencyAccount, SolvencyTree},
    storage::{keys, RecordRead, Storage, Table, Txn},
    types::{
        add_amount, sub_amount, AccountRecord, Address, Amount, Approval, ApprovalId, ApprovalRecord, ApprovalStatus,
        Digest, Fill, FillRecord, L2Order, Round, RootCommit, WalletRecord, Withdrawal,
        WithdrawalRequest, WithdrawalStatus,
    },
};
use chrono::Utc;
use std::sync::Arc;

/// Single-writer mutation engine
#[derive(Debug)]
pub struct LedgerEngine {
    storage: Arc<Storage>,
    operator: Address,
    signer: Option<KeyPair>,
}

fn ensure_positive(amount: Amount) -> Result<()> {
    if amount <= 0 {
        return Err(Error::InvalidAmount { amount });
    }
    Ok(())
}

fn ensure_asset(view: &impl RecordRead, asset: &Address) -> Result<()> {
    if !view.is_asset(asset)? {
        return Err(Error::UnknownAsset(*asset));
    }
    Ok(())
}

fn ensure_registered(view: &impl RecordRead, wallet: &Address) -> Result<()> {
    if view.wallet(wallet)?.is_none() {
        return Err(Error::NotRegistered(*wallet));
    }
    Ok(())
}

fn ensure_available(view: &impl RecordRead, asset: &Address, wallet: &Address, round: Round, requested: Amount) -> Result<()> {
    let available = view.account_at(asset, wallet, round)?.balance;
    if available < requested {
        return Err(Error::InsufficientBalance {
            asset: *asset,
            available,
            requested,
        });
    }
    Ok(())
}

/// Apply `change` to the effective record at `round` and shift later
/// records by the change in total. Nothing is staged if `change` or any
/// shift overflows.
fn update_account(
    txn: &mut Txn,
    asset: &Address,
    wallet: &Address,
    round: Round,
    change: impl FnOnce(&mut AccountRecord) -> Result<()>,
) -> Result<AccountRecord> {
    let before = txn.account_at(asset, wallet, round)?;
    let mut after = before.clone();
    change(&mut after)?;

    if after.balance < 0 || after.locked < 0 {
        return Err(Error::InvariantViolation(format!(
            "account {}/{} in round {} would hold balance {} and locked {}",
            asset, wallet, round, after.balance, after.locked
        )));
    }

    let delta = sub_amount(after.total()?, before.total()?)?;
    let mut shifted = Vec::new();
    if delta != 0 {
        for (later, mut record) in txn.account_records_after(asset, wallet, round)? {
            let available = record.balance;
            record.opening_balance = add_amount(record.opening_balance, delta)?;
            record.balance = add_amount(record.balance, delta)?;
            // Later totals must stay representable
            record.total()?;
            if record.balance < 0 {
                return Err(Error::InsufficientBalance {
                    asset: *asset,
                    available,
                    requested: sub_amount(0, delta)?,
                });
            }
            shifted.push((later, record));
        }
    }

    for (later, record) in &shifted {
        txn.put(Table::Accounts, keys::account(asset, wallet, *later), record)?;
    }

    txn.put(Table::Accounts, keys::account(asset, wallet, round), &after)?;
    Ok(after)
}

/// Check and stage one approval; shared by single and paired inserts
fn stage_approval(txn: &mut Txn, approval: &Approval) -> Result<()> {
    if txn.approval(&approval.approval_id)?.is_some() {
        return Err(Error::AlreadyExists(format!("Approval {}", approval.approval_id)));
    }
    ensure_positive(approval.buy.amount)?;
    ensure_positive(approval.sell.amount)?;

    for asset in [&approval.buy.asset, &approval.sell.asset] {
        if !txn.is_asset(asset)? {
            return Err(Error::AssetMismatch(format!(
                "approval {} trades asset {} which is not registered with the ledger",
                approval.approval_id, asset
            )));
        }
    }

    ensure_registered(txn, &approval.owner)?;
    ensure_available(txn, &approval.sell.asset, &approval.owner, approval.round, approval.sell.amount)?;

    let amount = approval.sell.amount;
    update_account(txn, &approval.sell.asset, &approval.owner, approval.round, |r| {
        r.balance = sub_amount(r.balance, amount)?;
        r.locked = add_amount(r.locked, amount)?;
        Ok(())
    })?;

    txn.put(
        Table::Approvals,
        keys::id(&approval.approval_id),
        &ApprovalRecord::open(approval.clone()),
    )
}

/// Check that a fill lines up with its approval
fn check_fill(fill: &Fill, record: &ApprovalRecord) -> Result<()> {
    let approval = &record.approval;

    if fill.buy_asset != approval.buy.asset || fill.sell_asset != approval.sell.asset {
        return Err(Error::AssetMismatch(format!(
            "fill {} buys {} and sells {}, approval {} buys {} and sells {}",
            fill.fill_id,
            fill.buy_asset,
            fill.sell_asset,
            approval.approval_id,
            approval.buy.asset,
            approval.sell.asset
        )));
    }
    if fill.round != approval.round {
        return Err(Error::RoundMismatch(format!(
            "fill {} is in round {}, approval {} is in round {}",
            fill.fill_id, fill.round, approval.approval_id, approval.round
        )));
    }
    if fill.instance_id != approval.instance_id {
        return Err(Error::InstanceMismatch(format!(
            "fill {} targets instance {}, approval {} targets instance {}",
            fill.fill_id, fill.instance_id, approval.approval_id, approval.instance_id
        )));
    }
    if fill.client_address != approval.owner {
        return Err(Error::WalletMismatch(format!(
            "fill {} is for wallet {}, approval {} belongs to wallet {}",
            fill.fill_id, fill.client_address, approval.approval_id, approval.owner
        )));
    }
    Ok(())
}

impl LedgerEngine {
    /// Engine over `storage` for `operator`
    pub fn new(storage: Arc<Storage>, operator: Address, signer: Option<KeyPair>) -> Self {
        Self {
            storage,
            operator,
            signer,
        }
    }

    /// Operator wallet
    pub fn operator(&self) -> Address {
        self.operator
    }

    /// Backing store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn transact<T>(&self, f: impl FnOnce(&mut Txn) -> Result<T>) -> Result<T> {
        let mut txn = self.storage.begin();
        let out = f(&mut txn)?;
        self.storage.commit(txn)?;
        Ok(out)
    }

    /// Register the operator at round 0 and the configured assets
    pub fn bootstrap(&self, assets: &[Address]) -> Result<()> {
        self.register(self.operator, 0)?;
        for asset in assets {
            self.register_asset(*asset)?;
        }
        Ok(())
    }

    /// Register a wallet; returns `false` when it was already registered
    pub fn register(&self, wallet: Address, round: Round) -> Result<bool> {
        self.transact(|txn| {
            if txn.wallet(&wallet)?.is_some() {
                return Ok(false);
            }
            txn.put(
                Table::Wallets,
                keys::address(&wallet),
                &WalletRecord {
                    address: wallet,
                    round_joined: round,
                },
            )?;
            tracing::info!(wallet = %wallet, round, "Wallet registered");
            Ok(true)
        })
    }

    /// Register an asset; returns `false` when it was already registered
    pub fn register_asset(&self, asset: Address) -> Result<bool> {
        self.transact(|txn| {
            if txn.is_asset(&asset)? {
                return Ok(false);
            }
            txn.put(Table::Assets, keys::address(&asset), &asset)?;
            tracing::info!(asset = %asset, "Asset registered");
            Ok(true)
        })
    }

    /// Credit an on-chain deposit
    pub fn credit_deposit(&self, asset: Address, wallet: Address, amount: Amount, round: Round) -> Result<AccountRecord> {
        self.transact(|txn| {
            ensure_positive(amount)?;
            ensure_asset(txn, &asset)?;
            ensure_registered(txn, &wallet)?;

            let record = update_account(txn, &asset, &wallet, round, |r| {
                r.balance = add_amount(r.balance, amount)?;
                r.deposited = add_amount(r.deposited, amount)?;
                Ok(())
            })?;
            tracing::info!(asset = %asset, wallet = %wallet, amount = %amount, round, "Deposit credited");
            Ok(record)
        })
    }

    /// Insert an approval and lock its sell amount
    pub fn insert_approval(&self, approval: Approval) -> Result<()> {
        self.transact(|txn| stage_approval(txn, &approval))?;
        tracing::info!(
            approval_id = %approval.approval_id,
            owner = %approval.owner,
            sell_asset = %approval.sell.asset,
            locked = %approval.sell.amount,
            round = approval.round,
            "Approval inserted"
        );
        Ok(())
    }

    /// Insert an order approval and its fee approval, both or neither
    pub fn insert_order(&self, order: L2Order) -> Result<()> {
        self.transact(|txn| {
            stage_approval(txn, &order.order_approval)?;
            stage_approval(txn, &order.fee_approval)
        })?;
        tracing::info!(
            order_approval = %order.order_approval.approval_id,
            fee_approval = %order.fee_approval.approval_id,
            "Order inserted"
        );
        Ok(())
    }

    /// Cancel an open approval and release what is still locked
    pub fn cancel_approval(&self, approval_id: ApprovalId) -> Result<ApprovalRecord> {
        self.transact(|txn| {
            let mut record = txn
                .approval(&approval_id)?
                .ok_or_else(|| Error::NotFound(format!("Approval {}", approval_id)))?;
            if record.status == ApprovalStatus::Closed {
                return Err(Error::AlreadyClosed(approval_id));
            }

            let approval = &record.approval;
            let released = record.remaining_sell;
            update_account(txn, &approval.sell.asset, &approval.owner, approval.round, |r| {
                r.locked = sub_amount(r.locked, released)?;
                r.balance = add_amount(r.balance, released)?;
                Ok(())
            })?;

            record.status = ApprovalStatus::Closed;
            txn.put(Table::Approvals, keys::id(&approval_id), &record)?;
            tracing::info!(approval_id = %approval_id, released = %released, "Approval canceled");
            Ok(record)
        })
    }

    /// Apply a fill against its approval
    pub fn insert_fill(&self, fill: Fill) -> Result<FillRecord> {
        self.transact(|txn| {
            let mut record = txn.approval(&fill.approval_id)?.ok_or(Error::UnbackedFill {
                fill_id: fill.fill_id,
                approval_id: fill.approval_id,
            })?;
            if record.status == ApprovalStatus::Closed {
                return Err(Error::AlreadyClosed(fill.approval_id));
            }
            check_fill(&fill, &record)?;
            ensure_positive(fill.buy_amount)?;
            ensure_positive(fill.sell_amount)?;
            if txn.fill(&fill.fill_id)?.is_some() {
                return Err(Error::AlreadyExists(format!("Fill {}", fill.fill_id)));
            }
            if fill.sell_amount > record.remaining_sell {
                return Err(Error::ExceedsApproved {
                    fill_id: fill.fill_id,
                    side: "sell",
                    amount: fill.sell_amount,
                    remaining: record.remaining_sell,
                });
            }
            if fill.buy_amount > record.remaining_buy {
                return Err(Error::ExceedsApproved {
                    fill_id: fill.fill_id,
                    side: "buy",
                    amount: fill.buy_amount,
                    remaining: record.remaining_buy,
                });
            }

            let (wallet, round) = (fill.client_address, fill.round);
            let (sold, bought) = (fill.sell_amount, fill.buy_amount);
            update_account(txn, &fill.sell_asset, &wallet, round, |r| {
                r.locked = sub_amount(r.locked, sold)?;
                r.sold = add_amount(r.sold, sold)?;
                Ok(())
            })?;
            update_account(txn, &fill.buy_asset, &wallet, round, |r| {
                r.balance = add_amount(r.balance, bought)?;
                r.bought = add_amount(r.bought, bought)?;
                Ok(())
            })?;

            record.remaining_sell = sub_amount(record.remaining_sell, sold)?;
            record.remaining_buy = sub_amount(record.remaining_buy, bought)?;
            if record.is_exhausted() {
                let leftover = record.remaining_sell;
                if leftover > 0 {
                    update_account(txn, &fill.sell_asset, &wallet, round, |r| {
                        r.locked = sub_amount(r.locked, leftover)?;
                        r.balance = add_amount(r.balance, leftover)?;
                        Ok(())
                    })?;
                }
                record.status = ApprovalStatus::Closed;
                tracing::debug!(approval_id = %fill.approval_id, released = %leftover, "Approval exhausted");
            }
            txn.put(Table::Approvals, keys::id(&fill.approval_id), &record)?;

            let digest = fill_digest(&fill);
            let fill_record = FillRecord {
                operator_signature: self.signer.as_ref().map(|k| k.sign(&digest)),
                digest,
                fill: fill.clone(),
            };
            txn.put(Table::Fills, keys::id(&fill.fill_id), &fill_record)?;
            txn.put_raw(Table::FillIndex, keys::fill_index(&fill.approval_id, &fill.fill_id), Vec::new());

            tracing::info!(
                fill_id = %fill.fill_id,
                approval_id = %fill.approval_id,
                wallet = %wallet,
                sold = %sold,
                bought = %bought,
                round,
                "Fill applied"
            );
            Ok(fill_record)
        })
    }

    fn check_new_withdrawal(txn: &Txn, request: &WithdrawalRequest) -> Result<()> {
        ensure_positive(request.amount)?;
        ensure_asset(txn, &request.asset)?;
        ensure_registered(txn, &request.wallet)?;
        if txn.withdrawal(&request.tx_hash)?.is_some() {
            return Err(Error::AlreadyExists(format!("Withdrawal {}", request.tx_hash)));
        }
        if txn.active_withdrawal(&request.asset, &request.wallet)?.is_some() {
            return Err(Error::DoubleWithdrawal {
                asset: request.asset,
                wallet: request.wallet,
            });
        }
        Ok(())
    }

    fn debit_withdrawal(txn: &mut Txn, request: &WithdrawalRequest) -> Result<()> {
        ensure_available(txn, &request.asset, &request.wallet, request.round, request.amount)?;
        let amount = request.amount;
        update_account(txn, &request.asset, &request.wallet, request.round, |r| {
            r.balance = sub_amount(r.balance, amount)?;
            r.withdrawn = add_amount(r.withdrawn, amount)?;
            Ok(())
        })?;
        Ok(())
    }

    fn store_withdrawal(txn: &mut Txn, withdrawal: &Withdrawal) -> Result<()> {
        let request = &withdrawal.request;
        txn.put(Table::Withdrawals, keys::tx_hash(&request.tx_hash), withdrawal)?;
        if withdrawal.status.is_active() {
            txn.put(
                Table::ActiveWithdrawals,
                keys::account_prefix(&request.asset, &request.wallet),
                &request.tx_hash,
            )?;
        } else {
            txn.delete(Table::ActiveWithdrawals, keys::account_prefix(&request.asset, &request.wallet));
        }
        Ok(())
    }

    /// Debit and record a withdrawal as pending
    pub fn withdraw(&self, request: WithdrawalRequest) -> Result<Withdrawal> {
        self.transact(|txn| {
            Self::check_new_withdrawal(txn, &request)?;
            Self::debit_withdrawal(txn, &request)?;

            let withdrawal = Withdrawal {
                request: request.clone(),
                status: WithdrawalStatus::Pending,
                created_at: Utc::now(),
            };
            Self::store_withdrawal(txn, &withdrawal)?;
            tracing::info!(
                tx_hash = %request.tx_hash,
                asset = %request.asset,
                wallet = %request.wallet,
                amount = %request.amount,
                "Withdrawal pending"
            );
            Ok(withdrawal)
        })
    }

    /// Record a withdrawal as unchecked, without debiting
    pub fn insert_withdrawal(&self, request: WithdrawalRequest) -> Result<Withdrawal> {
        self.transact(|txn| {
            Self::check_new_withdrawal(txn, &request)?;

            let withdrawal = Withdrawal {
                request: request.clone(),
                status: WithdrawalStatus::Unchecked,
                created_at: Utc::now(),
            };
            Self::store_withdrawal(txn, &withdrawal)?;
            tracing::info!(tx_hash = %request.tx_hash, wallet = %request.wallet, "Withdrawal recorded unchecked");
            Ok(withdrawal)
        })
    }

    fn load_withdrawal(txn: &Txn, tx_hash: &Digest) -> Result<Option<Withdrawal>> {
        txn.withdrawal(tx_hash)
    }

    /// Move an unchecked withdrawal to pending, debiting it
    pub fn approve_withdrawal(&self, tx_hash: Digest) -> Result<Withdrawal> {
        self.transact(|txn| {
            let mut withdrawal = Self::load_withdrawal(txn, &tx_hash)?
                .ok_or_else(|| Error::NotFound(format!("Withdrawal {}", tx_hash)))?;
            if withdrawal.status != WithdrawalStatus::Unchecked {
                return Err(Error::InvalidTransition {
                    tx_hash,
                    from: withdrawal.status,
                    to: WithdrawalStatus::Pending,
                });
            }

            Self::debit_withdrawal(txn, &withdrawal.request)?;
            withdrawal.status = WithdrawalStatus::Pending;
            Self::store_withdrawal(txn, &withdrawal)?;
            tracing::info!(tx_hash = %tx_hash, "Withdrawal approved");
            Ok(withdrawal)
        })
    }

    /// Mark a pending withdrawal as settled
    pub fn confirm_withdrawal(&self, tx_hash: Digest) -> Result<Withdrawal> {
        self.transact(|txn| {
            let mut withdrawal = Self::load_withdrawal(txn, &tx_hash)?
                .filter(|w| w.status == WithdrawalStatus::Pending)
                .ok_or(Error::NoPendingWithdrawal(tx_hash))?;

            withdrawal.status = WithdrawalStatus::Confirmed;
            Self::store_withdrawal(txn, &withdrawal)?;
            tracing::info!(tx_hash = %tx_hash, "Withdrawal confirmed");
            Ok(withdrawal)
        })
    }

    /// Cancel an outstanding withdrawal, crediting back a pending debit
    pub fn cancel_withdrawal(&self, tx_hash: Digest) -> Result<Withdrawal> {
        self.transact(|txn| {
            let mut withdrawal = Self::load_withdrawal(txn, &tx_hash)?
                .filter(|w| w.status.is_active())
                .ok_or(Error::NoWithdrawalToCancel(tx_hash))?;

            if withdrawal.status == WithdrawalStatus::Pending {
                let request = &withdrawal.request;
                let amount = request.amount;
                update_account(txn, &request.asset, &request.wallet, request.round, |r| {
                    r.balance = add_amount(r.balance, amount)?;
                    r.withdrawn = sub_amount(r.withdrawn, amount)?;
                    Ok(())
                })?;
            }

            let previous = withdrawal.status;
            withdrawal.status = WithdrawalStatus::Canceled;
            Self::store_withdrawal(txn, &withdrawal)?;
            tracing::info!(tx_hash = %tx_hash, from = ?previous, "Withdrawal canceled");
            Ok(withdrawal)
        })
    }

    /// Build the round tree, then store its root and every wallet's proof
    pub fn commit_round(&self, asset: Address, round: Round) -> Result<(RootCommit, SolvencyTree)> {
        self.transact(|txn| {
            let tree = build_solvency_tree(txn, &asset, round)?;
            let root = tree.root_info().map_err(|_| Error::EmptySnapshot(round))?;
            let commit = RootCommit {
                asset,
                round,
                root,
                padded_root: root.padded(),
            };
            txn.put(Table::Commits, keys::commit(&asset, round), &commit)?;

            for account in tree.accounts() {
                let proof = tree
                    .partial_proof(&account.wallet, round)?
                    .complete(account.sum, account.wallet, asset);
                txn.put(Table::Proofs, keys::account(&asset, &account.wallet, round), &proof)?;
            }

            tracing::info!(
                asset = %asset,
                round,
                height = root.height,
                width = root.width,
                padded_root = %commit.padded_root,
                "Round committed"
            );
            Ok((commit, tree))
        })
    }
}

/// Tree elements for `asset` at `round`: opening balances of wallets that
/// joined before `round`, ordered by address
pub fn solvency_accounts(view: &impl RecordRead, asset: &Address, round: Round) -> Result<Vec<SolvencyAccount>> {
    ensure_asset(view, asset)?;
    view.wallets()?
        .into_iter()
        .filter(|w| w.round_joined < round)
        .map(|w| {
            Ok(SolvencyAccount {
                wallet: w.address,
                sum: view.account_at(asset, &w.address, round)?.opening_balance,
                round,
            })
        })
        .collect()
}

/// Solvency tree for `asset` at `round`
pub fn build_solvency_tree(view: &impl RecordRead, asset: &Address, round: Round) -> Result<SolvencyTree> {
    SolvencyTree::new(solvency_accounts(view, asset, round)?)
}
