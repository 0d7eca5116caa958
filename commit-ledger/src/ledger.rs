//! Main ledger orchestration layer
//!
//! This module ties together storage, the mutation engine, the actor and
//! the solvency tree into the public API.
//!
//! Mutations go through the actor and are applied one at a time. Reads take
//! a storage snapshot and run concurrently with each other and with the
//! writer. Tree construction is CPU-bound and runs on the blocking pool.
//!
//! # Example
//!
//! ```no_run
//! use commit_ledger::{Address, Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> commit_ledger::Result<()> {
//!     let asset = Address::new([1u8; 20]);
//!     let mut config = Config::default();
//!     config.data_dir = "/var/lib/commit-ledger".into();
//!     config.assets.push(asset);
//!     let ledger = Ledger::open(config).await?;
//!
//!     let alice = Address::new([0xa1; 20]);
//!     ledger.register(alice, 0).await?;
//!     ledger.credit_deposit(asset, alice, 100, 0).await?;
//!
//!     let proof = ledger.complete_proof(asset, alice, 1).await?;
//!     assert_eq!(proof.client_opening_balance, 100);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    crypto::KeyPair,
    engine::{build_solvency_tree, LedgerEngine},
    metrics::Metrics,
    solvency::{Proof, SolvencyTree},
    storage::{RecordRead, Snapshot, WithdrawalFilter},
    types::{
        AccountRecord, Address, Amount, Approval, ApprovalId, ApprovalRecord, Digest, Fill,
        FillId, FillRecord, L2Order, Round, RootCommit, WalletRecord, Withdrawal,
        WithdrawalRequest,
    },
    Config, Error, Result, Storage,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    /// Actor handle for mutations
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Metrics shared with the actor
    metrics: Metrics,

    /// Operator attestation key (public half)
    operator_key: Option<[u8; 32]>,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    ///
    /// The operator is registered at round 0 and the configured assets are
    /// registered before the actor starts.
    pub async fn open(config: Config) -> Result<Self> {
        let keypair = config
            .signing_seed
            .as_deref()
            .map(KeyPair::from_hex_seed)
            .transpose()?;
        Self::open_with_keypair(config, keypair).await
    }

    /// Open ledger that attests fills with `keypair`
    pub async fn open_with_keypair(config: Config, keypair: Option<KeyPair>) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new().map_err(|e| Error::Config(format!("metrics registry: {}", e)))?;
        let operator_key = keypair.as_ref().map(KeyPair::public_key);

        let engine = LedgerEngine::new(Arc::clone(&storage), config.operator, keypair);
        engine.bootstrap(&config.assets)?;

        let handle = spawn_ledger_actor(
            engine,
            metrics.clone(),
            config.actor.mailbox_capacity,
            config.rocksdb.flush_on_shutdown,
        );

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            operator = %config.operator,
            assets = config.assets.len(),
            path = %storage.path().display(),
            "Ledger opened"
        );

        Ok(Self {
            handle,
            storage,
            metrics,
            operator_key,
            config,
        })
    }

    /// Operator wallet
    pub fn operator(&self) -> Address {
        self.config.operator
    }

    /// Configuration the ledger was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Cloneable handle for submitting mutations from other tasks
    pub fn handle(&self) -> LedgerHandle {
        self.handle.clone()
    }

    /// Point-in-time read view
    pub fn snapshot(&self) -> Snapshot {
        self.storage.snapshot()
    }

    // Mutations

    /// Register a wallet; re-registering keeps the original join round
    pub async fn register(&self, wallet: Address, round: Round) -> Result<bool> {
        self.handle.register(wallet, round).await
    }

    /// Register an asset
    pub async fn register_asset(&self, asset: Address) -> Result<bool> {
        self.handle.register_asset(asset).await
    }

    /// Credit a deposit to `round` and every later round
    pub async fn credit_deposit(&self, asset: Address, wallet: Address, amount: Amount, round: Round) -> Result<AccountRecord> {
        self.handle.credit_deposit(asset, wallet, amount, round).await
    }

    /// Insert an approval, locking its sell amount
    pub async fn insert_approval(&self, approval: Approval) -> Result<()> {
        self.handle.insert_approval(approval).await
    }

    /// Insert an order approval and its fee approval atomically
    pub async fn insert_order(&self, order: L2Order) -> Result<()> {
        self.handle.insert_order(order).await
    }

    /// Cancel an open approval
    pub async fn cancel_approval(&self, approval_id: ApprovalId) -> Result<ApprovalRecord> {
        self.handle.cancel_approval(approval_id).await
    }

    /// Apply a fill against its approval
    pub async fn insert_fill(&self, fill: Fill) -> Result<FillRecord> {
        self.handle.insert_fill(fill).await
    }

    /// Debit a withdrawal and record it as pending
    pub async fn withdraw(&self, request: WithdrawalRequest) -> Result<Withdrawal> {
        self.handle.withdraw(request).await
    }

    /// Record a withdrawal as unchecked
    pub async fn insert_withdrawal(&self, request: WithdrawalRequest) -> Result<Withdrawal> {
        self.handle.insert_withdrawal(request).await
    }

    /// Unchecked to pending, debiting the amount
    pub async fn approve_withdrawal(&self, tx_hash: Digest) -> Result<Withdrawal> {
        self.handle.approve_withdrawal(tx_hash).await
    }

    /// Pending to confirmed
    pub async fn confirm_withdrawal(&self, tx_hash: Digest) -> Result<Withdrawal> {
        self.handle.confirm_withdrawal(tx_hash).await
    }

    /// Cancel an outstanding withdrawal
    pub async fn cancel_withdrawal(&self, tx_hash: Digest) -> Result<Withdrawal> {
        self.handle.cancel_withdrawal(tx_hash).await
    }

    /// Build, store and return the anchored root of `asset` at `round`,
    /// together with every wallet's proof for that round
    pub async fn commit_round(&self, asset: Address, round: Round) -> Result<RootCommit> {
        let (commit, _) = self.handle.commit_round(asset, round).await?;
        Ok(commit)
    }

    // Queries

    fn registered(snapshot: &Snapshot, wallet: &Address) -> Result<()> {
        if snapshot.wallet(wallet)?.is_none() {
            return Err(Error::NotRegistered(*wallet));
        }
        Ok(())
    }

    /// Effective account record at `round`
    pub fn account(&self, asset: &Address, wallet: &Address, round: Round) -> Result<AccountRecord> {
        let snapshot = self.snapshot();
        Self::registered(&snapshot, wallet)?;
        if !snapshot.is_asset(asset)? {
            return Err(Error::UnknownAsset(*asset));
        }
        snapshot.account_at(asset, wallet, round)
    }

    /// Spendable balance
    pub fn balance(&self, asset: &Address, wallet: &Address, round: Round) -> Result<Amount> {
        Ok(self.account(asset, wallet, round)?.balance)
    }

    /// Balance carried in from the previous round
    pub fn opening_balance(&self, asset: &Address, wallet: &Address, round: Round) -> Result<Amount> {
        Ok(self.account(asset, wallet, round)?.opening_balance)
    }

    /// Amount locked by open approvals
    pub fn locked(&self, asset: &Address, wallet: &Address, round: Round) -> Result<Amount> {
        Ok(self.account(asset, wallet, round)?.locked)
    }

    /// Account records of every registered asset
    pub fn balances(&self, wallet: &Address, round: Round) -> Result<BTreeMap<Address, AccountRecord>> {
        let snapshot = self.snapshot();
        Self::registered(&snapshot, wallet)?;
        snapshot
            .assets()?
            .into_iter()
            .map(|asset| Ok((asset, snapshot.account_at(&asset, wallet, round)?)))
            .collect()
    }

    /// Whether the wallet is registered
    pub fn is_registered(&self, wallet: &Address) -> Result<bool> {
        Ok(self.snapshot().wallet(wallet)?.is_some())
    }

    /// Registered wallets, ordered by address
    pub fn wallets(&self) -> Result<Vec<WalletRecord>> {
        self.snapshot().wallets()
    }

    /// Registered assets, ordered by address
    pub fn assets(&self) -> Result<Vec<Address>> {
        self.snapshot().assets()
    }

    /// Approval by ID
    pub fn approval(&self, approval_id: &ApprovalId) -> Result<ApprovalRecord> {
        self.snapshot()
            .approval(approval_id)?
            .ok_or_else(|| Error::NotFound(format!("Approval {}", approval_id)))
    }

    /// Fill by ID
    pub fn fill(&self, fill_id: &FillId) -> Result<FillRecord> {
        self.snapshot()
            .fill(fill_id)?
            .ok_or_else(|| Error::NotFound(format!("Fill {}", fill_id)))
    }

    /// Fills recorded against an approval
    pub fn fills_for_approval(&self, approval_id: &ApprovalId) -> Result<Vec<FillRecord>> {
        self.snapshot().fills_for_approval(approval_id)
    }

    /// Whether a fill carries a valid operator attestation
    pub fn verify_fill(&self, record: &FillRecord) -> bool {
        match (&record.operator_signature, &self.operator_key) {
            (Some(signature), Some(key)) => {
                crate::crypto::fill_digest(&record.fill) == record.digest
                    && signature.verify(record.digest.as_bytes(), key)
            }
            _ => false,
        }
    }

    /// Withdrawal by transaction hash
    pub fn withdrawal(&self, tx_hash: &Digest) -> Result<Withdrawal> {
        self.snapshot()
            .withdrawal(tx_hash)?
            .ok_or_else(|| Error::NotFound(format!("Withdrawal {}", tx_hash)))
    }

    /// Withdrawals matching every set field of `filter`
    pub fn withdrawals(&self, filter: &WithdrawalFilter) -> Result<Vec<Withdrawal>> {
        self.snapshot().withdrawals(filter)
    }

    /// Anchored root of `asset` at `round`
    pub fn commitment(&self, asset: &Address, round: Round) -> Result<RootCommit> {
        self.snapshot()
            .commit(asset, round)?
            .ok_or_else(|| Error::NotFound(format!("Commitment of {} in round {}", asset, round)))
    }

    /// Proof stored by [`Ledger::commit_round`]
    pub fn stored_proof(&self, asset: &Address, wallet: &Address, round: Round) -> Result<Proof> {
        self.snapshot()
            .proof(asset, wallet, round)?
            .ok_or_else(|| Error::NotFound(format!("Proof of {} for {} in round {}", wallet, asset, round)))
    }

    /// Full dump of every table
    pub fn to_json(&self) -> Result<serde_json::Value> {
        self.snapshot().to_json()
    }

    // Solvency

    async fn with_tree<T, F>(&self, asset: Address, round: Round, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Snapshot, SolvencyTree) -> Result<T> + Send + 'static,
    {
        let snapshot = self.snapshot();
        let metrics = self.metrics.clone();
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let tree = build_solvency_tree(&snapshot, &asset, round)?;
            metrics.record_tree_build(started.elapsed().as_secs_f64());
            f(&snapshot, tree)
        })
        .await
        .map_err(|e| Error::Concurrency(format!("Tree build task failed: {}", e)))?
    }

    /// Solvency tree of `asset` at `round` over wallets that joined before
    /// `round`
    pub async fn solvency_tree(&self, asset: Address, round: Round) -> Result<SolvencyTree> {
        self.with_tree(asset, round, |_, tree| Ok(tree)).await
    }

    /// Proof of `wallet`'s opening balance in `round`
    pub async fn complete_proof(&self, asset: Address, wallet: Address, round: Round) -> Result<Proof> {
        let proof = self
            .with_tree(asset, round, move |snapshot, tree| {
                if tree.width() == 0 {
                    return Err(Error::EmptySnapshot(round));
                }
                let opening = snapshot.account_at(&asset, &wallet, round)?.opening_balance;
                Ok(tree.partial_proof(&wallet, round)?.complete(opening, wallet, asset))
            })
            .await?;

        self.metrics.record_proof_served();
        tracing::debug!(asset = %asset, wallet = %wallet, round, "Proof served");
        Ok(proof)
    }

    /// Flush memtables to disk now
    pub async fn flush(&self) -> Result<()> {
        self.handle.flush().await
    }

    /// Shutdown ledger
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetAmount, Intent};
    use tempfile::TempDir;
    use uuid::Uuid;

    const OPERATOR: Address = Address::new([0xff; 20]);
    const USD: Address = Address::new([0x01; 20]);
    const ALICE: Address = Address::new([0xa1; 20]);

    async fn create_test_ledger() -> (TempDir, Ledger) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.operator = OPERATOR;
        config.assets = vec![USD];
        let ledger = Ledger::open(config).await.unwrap();
        (temp_dir, ledger)
    }

    #[tokio::test]
    async fn test_ledger_open() {
        let (_dir, ledger) = create_test_ledger().await;
        assert!(ledger.is_registered(&OPERATOR).unwrap());
        assert_eq!(ledger.assets().unwrap(), vec![USD]);
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_queries_reject_unknown_wallet() {
        let (_dir, ledger) = create_test_ledger().await;
        let err = ledger.balance(&USD, &ALICE, 0).unwrap_err();
        assert!(matches!(err, Error::NotRegistered(_)));
        assert!(err.to_string().contains("is not registered in the network"));
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_balances_cover_every_asset() {
        let (_dir, ledger) = create_test_ledger().await;
        let btc = Address::new([0x02; 20]);
        ledger.register_asset(btc).await.unwrap();
        ledger.register(ALICE, 0).await.unwrap();
        ledger.credit_deposit(USD, ALICE, 3, 0).await.unwrap();

        let balances = ledger.balances(&ALICE, 4).unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[&USD].opening_balance, 3);
        assert_eq!(balances[&btc].balance, 0);
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_signed_fill() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.operator = OPERATOR;
        config.assets = vec![USD, Address::new([0x02; 20])];
        config.signing_seed = Some("07".repeat(32));
        let ledger = Ledger::open(config).await.unwrap();

        ledger.register(ALICE, 0).await.unwrap();
        ledger.credit_deposit(USD, ALICE, 10, 0).await.unwrap();
        let approval = Approval {
            approval_id: Uuid::new_v4(),
            round: 0,
            buy: AssetAmount { asset: Address::new([0x02; 20]), amount: 1 },
            sell: AssetAmount { asset: USD, amount: 10 },
            intent: Intent::SellAll,
            owner: ALICE,
            instance_id: OPERATOR,
        };
        ledger.insert_approval(approval.clone()).await.unwrap();

        let record = ledger
            .insert_fill(Fill {
                fill_id: Uuid::new_v4(),
                approval_id: approval.approval_id,
                round: 0,
                buy_amount: 1,
                buy_asset: approval.buy.asset,
                sell_amount: 10,
                sell_asset: USD,
                client_address: ALICE,
                instance_id: OPERATOR,
            })
            .await
            .unwrap();

        assert!(ledger.verify_fill(&record));
        assert_eq!(ledger.fills_for_approval(&approval.approval_id).unwrap(), vec![record.clone()]);

        let mut tampered = record;
        tampered.fill.buy_amount = 2;
        assert!(!ledger.verify_fill(&tampered));
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_proof_counts_metrics() {
        let (_dir, ledger) = create_test_ledger().await;
        ledger.register(ALICE, 0).await.unwrap();
        ledger.credit_deposit(USD, ALICE, 5, 0).await.unwrap();

        let proof = ledger.complete_proof(USD, ALICE, 1).await.unwrap();
        assert_eq!(proof.client_opening_balance, 5);
        assert_eq!(ledger.metrics().proofs_served.get(), 1);

        let tree = ledger.solvency_tree(USD, 1).await.unwrap();
        assert!(proof.verify(tree.root().unwrap()));
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_proof_for_empty_round() {
        let (_dir, ledger) = create_test_ledger().await;
        let err = ledger.complete_proof(USD, OPERATOR, 0).await.unwrap_err();
        assert!(matches!(err, Error::EmptySnapshot(0)));
        assert!(err.is_not_found());
        ledger.shutdown().await.unwrap();
    }
}
