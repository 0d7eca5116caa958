//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `wallets` - Registered wallets (key: address)
//! - `assets` - Registered assets (key: address)
//! - `accounts` - Balance records (key: asset || wallet || round)
//! - `approvals` - Approvals with remaining amounts (key: approval_id)
//! - `fills` - Fills (key: fill_id)
//! - `fill_index` - Fills per approval (key: approval_id || fill_id)
//! - `withdrawals` - Withdrawals (key: tx_hash)
//! - `active_withdrawals` - Outstanding withdrawal per pair (key: asset || wallet)
//! - `commits` - Anchored roots (key: asset || round)
//! - `proofs` - Stored proofs (key: asset || wallet || round)
//!
//! The writer stages changes in a [`Txn`] that reads through to the database
//! and lands as one `WriteBatch`. Once a batch is written it is also applied
//! to a copy-on-write image of the tables; queries take a [`Snapshot`] of
//! that image, so they never see a partial commit and never block the writer.

use crate::{
    config::Config,
    error::{Error, Result},
    solvency::Proof,
    types::{
        AccountRecord, Address, ApprovalId, ApprovalRecord, Digest, FillId, FillRecord, Round,
        RootCommit, WalletRecord, Withdrawal, WithdrawalStatus,
    },
};
use parking_lot::RwLock;
use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction,
    IteratorMode, Options, WriteBatch, WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Named table, stored as one column family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// Registered wallets
    Wallets,
    /// Registered assets
    Assets,
    /// Balance records
    Accounts,
    /// Approvals
    Approvals,
    /// Fills
    Fills,
    /// Fills per approval
    FillIndex,
    /// Withdrawals
    Withdrawals,
    /// Outstanding withdrawal per (asset, wallet)
    ActiveWithdrawals,
    /// Anchored roots
    Commits,
    /// Stored proofs
    Proofs,
}

impl Table {
    /// Every table, in dump order
    pub const ALL: [Table; 10] = [
        Table::Wallets,
        Table::Assets,
        Table::Accounts,
        Table::Approvals,
        Table::Fills,
        Table::FillIndex,
        Table::Withdrawals,
        Table::ActiveWithdrawals,
        Table::Commits,
        Table::Proofs,
    ];

    /// Table and column family name
    pub fn name(&self) -> &'static str {
        match self {
            Table::Wallets => "wallets",
            Table::Assets => "assets",
            Table::Accounts => "accounts",
            Table::Approvals => "approvals",
            Table::Fills => "fills",
            Table::FillIndex => "fill_index",
            Table::Withdrawals => "withdrawals",
            Table::ActiveWithdrawals => "active_withdrawals",
            Table::Commits => "commits",
            Table::Proofs => "proofs",
        }
    }

    fn cf_options(&self) -> Options {
        let mut opts = Options::default();
        match self {
            // Point lookups on every balance check and fill
            Table::Accounts | Table::FillIndex | Table::ActiveWithdrawals => {
                opts.set_compression_type(DBCompressionType::Lz4);
                let mut block_opts = BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            // Write-once history
            Table::Fills | Table::Commits | Table::Proofs => {
                opts.set_compression_type(DBCompressionType::Zstd);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }
        opts
    }
}

type Rows = BTreeMap<Vec<u8>, Vec<u8>>;

/// Published image of every table
#[derive(Debug, Clone, Default)]
struct Tables {
    tables: BTreeMap<Table, Rows>,
}

/// Key encodings
pub mod keys {
    use super::*;

    /// Wallet or asset key
    pub fn address(address: &Address) -> Vec<u8> {
        address.as_bytes().to_vec()
    }

    /// Prefix of every account record of a pair
    pub fn account_prefix(asset: &Address, wallet: &Address) -> Vec<u8> {
        let mut key = Vec::with_capacity(48);
        key.extend_from_slice(asset.as_bytes());
        key.extend_from_slice(wallet.as_bytes());
        key
    }

    /// Account record key; rounds sort numerically
    pub fn account(asset: &Address, wallet: &Address, round: Round) -> Vec<u8> {
        let mut key = account_prefix(asset, wallet);
        key.extend_from_slice(&round.to_be_bytes());
        key
    }

    /// Round encoded in the trailing 8 bytes of a key
    pub fn trailing_round(key: &[u8]) -> Result<Round> {
        let tail = key
            .len()
            .checked_sub(8)
            .map(|start| &key[start..])
            .ok_or_else(|| Error::InvalidEncoding(format!("key of {} bytes has no round", key.len())))?;
        let bytes: [u8; 8] = tail
            .try_into()
            .map_err(|_| Error::InvalidEncoding("round suffix".to_string()))?;
        Ok(Round::from_be_bytes(bytes))
    }

    /// Approval, fill or withdrawal ID key
    pub fn id(id: &uuid::Uuid) -> Vec<u8> {
        id.as_bytes().to_vec()
    }

    /// Fill index key
    pub fn fill_index(approval_id: &ApprovalId, fill_id: &FillId) -> Vec<u8> {
        let mut key = id(approval_id);
        key.extend_from_slice(fill_id.as_bytes());
        key
    }

    /// Withdrawal key
    pub fn tx_hash(tx_hash: &Digest) -> Vec<u8> {
        tx_hash.as_bytes().to_vec()
    }

    /// Commit key
    pub fn commit(asset: &Address, round: Round) -> Vec<u8> {
        let mut key = address(asset);
        key.extend_from_slice(&round.to_be_bytes());
        key
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Raw read access to the tables
pub trait KvRead {
    /// Value under `key`
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All rows whose key starts with `prefix`, in key order
    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Greatest row with key in `[prefix, upper)` that starts with `prefix`
    fn last_before(&self, table: Table, prefix: &[u8], upper: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// Live view of the database
#[derive(Clone)]
pub struct DbView {
    db: Arc<DB>,
}

impl fmt::Debug for DbView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbView").field("path", &self.db.path()).finish()
    }
}

impl DbView {
    fn cf(&self, table: Table) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", table.name())))
    }
}

impl KvRead for DbView {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(table)?, key)?)
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let iter = self
            .db
            .iterator_cf(self.cf(table)?, IteratorMode::From(prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.into_vec(), value.into_vec()));
        }
        Ok(rows)
    }

    fn last_before(&self, table: Table, prefix: &[u8], upper: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if upper <= prefix {
            return Ok(None);
        }

        // Reverse seek lands on the last key <= upper
        let iter = self
            .db
            .iterator_cf(self.cf(table)?, IteratorMode::From(upper, Direction::Reverse));
        for item in iter {
            let (key, value) = item?;
            if &*key >= upper {
                continue;
            }
            if !key.starts_with(prefix) {
                return Ok(None);
            }
            return Ok(Some((key.into_vec(), value.into_vec())));
        }
        Ok(None)
    }
}

/// Point-in-time view of the tables
#[derive(Debug, Clone)]
pub struct Snapshot {
    tables: Arc<Tables>,
}

impl Snapshot {
    fn rows(&self, table: Table) -> Option<&Rows> {
        self.tables.tables.get(&table)
    }

    /// Dump every table with hex keys and decoded values
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let mut out = serde_json::Map::new();
        for table in Table::ALL {
            let mut rows = serde_json::Map::new();
            for (key, value) in self.scan_prefix(table, &[])? {
                rows.insert(format!("0x{}", hex::encode(&key)), decode_json(table, &value)?);
            }
            out.insert(table.name().to_string(), serde_json::Value::Object(rows));
        }
        Ok(serde_json::Value::Object(out))
    }
}

fn decode_json(table: Table, bytes: &[u8]) -> Result<serde_json::Value> {
    let value = match table {
        Table::Wallets => serde_json::to_value(decode::<WalletRecord>(bytes)?)?,
        Table::Assets => serde_json::to_value(decode::<Address>(bytes)?)?,
        Table::Accounts => serde_json::to_value(decode::<AccountRecord>(bytes)?)?,
        Table::Approvals => serde_json::to_value(decode::<ApprovalRecord>(bytes)?)?,
        Table::Fills => serde_json::to_value(decode::<FillRecord>(bytes)?)?,
        Table::FillIndex => serde_json::Value::Null,
        Table::Withdrawals => serde_json::to_value(decode::<Withdrawal>(bytes)?)?,
        Table::ActiveWithdrawals => serde_json::to_value(decode::<Digest>(bytes)?)?,
        Table::Commits => serde_json::to_value(decode::<RootCommit>(bytes)?)?,
        Table::Proofs => serde_json::to_value(decode::<Proof>(bytes)?)?,
    };
    Ok(value)
}

impl KvRead for Snapshot {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.rows(table).and_then(|rows| rows.get(key).cloned()))
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(rows) = self.rows(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn last_before(&self, table: Table, prefix: &[u8], upper: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if upper <= prefix {
            return Ok(None);
        }
        Ok(self.rows(table).and_then(|rows| {
            rows.range(prefix.to_vec()..upper.to_vec())
                .next_back()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
        }))
    }
}

/// Staged write set over the database
#[derive(Debug)]
pub struct Txn {
    base: DbView,
    writes: BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>,
}

impl Txn {
    /// Stage a raw value
    pub fn put_raw(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert((table, key), Some(value));
    }

    /// Stage a serialized record
    pub fn put<T: Serialize>(&mut self, table: Table, key: Vec<u8>, value: &T) -> Result<()> {
        self.put_raw(table, key, encode(value)?);
        Ok(())
    }

    /// Stage a deletion
    pub fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.writes.insert((table, key), None);
    }
}

impl KvRead for Txn {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.writes.get(&(table, key.to_vec())) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.get(table, key),
        }
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: Rows = self.base.scan_prefix(table, prefix)?.into_iter().collect();
        let staged = self
            .writes
            .range((table, prefix.to_vec())..)
            .take_while(|((t, key), _)| *t == table && key.starts_with(prefix));
        for ((_, key), value) in staged {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }

    fn last_before(&self, table: Table, prefix: &[u8], upper: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if upper <= prefix {
            return Ok(None);
        }
        Ok(self
            .scan_prefix(table, prefix)?
            .into_iter()
            .take_while(|(key, _)| key.as_slice() < upper)
            .last())
    }
}

/// Optional partial-match filter over withdrawals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WithdrawalFilter {
    /// Match asset
    pub asset: Option<Address>,
    /// Match wallet
    pub wallet: Option<Address>,
    /// Match round
    pub round: Option<Round>,
    /// Match status
    pub status: Option<WithdrawalStatus>,
}

impl WithdrawalFilter {
    /// Whether `withdrawal` matches every set field
    pub fn matches(&self, withdrawal: &Withdrawal) -> bool {
        let request = &withdrawal.request;
        self.asset.map_or(true, |a| a == request.asset)
            && self.wallet.map_or(true, |w| w == request.wallet)
            && self.round.map_or(true, |r| r == request.round)
            && self.status.map_or(true, |s| s == withdrawal.status)
    }
}

/// Typed record accessors over any [`KvRead`]
pub trait RecordRead: KvRead {
    /// Registered wallet
    fn wallet(&self, address: &Address) -> Result<Option<WalletRecord>> {
        self.get(Table::Wallets, &keys::address(address))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// All registered wallets, ordered by address
    fn wallets(&self) -> Result<Vec<WalletRecord>> {
        self.scan_prefix(Table::Wallets, &[])?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    /// Whether the asset is registered
    fn is_asset(&self, asset: &Address) -> Result<bool> {
        Ok(self.get(Table::Assets, &keys::address(asset))?.is_some())
    }

    /// All registered assets, ordered by address
    fn assets(&self) -> Result<Vec<Address>> {
        self.scan_prefix(Table::Assets, &[])?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    /// Record stored exactly at `round`
    fn account_record(&self, asset: &Address, wallet: &Address, round: Round) -> Result<Option<AccountRecord>> {
        self.get(Table::Accounts, &keys::account(asset, wallet, round))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// Latest record strictly before `round`
    fn account_record_before(
        &self,
        asset: &Address,
        wallet: &Address,
        round: Round,
    ) -> Result<Option<(Round, AccountRecord)>> {
        let prefix = keys::account_prefix(asset, wallet);
        self.last_before(Table::Accounts, &prefix, &keys::account(asset, wallet, round))?
            .map(|(k, v)| Ok((keys::trailing_round(&k)?, decode(&v)?)))
            .transpose()
    }

    /// Records strictly after `round`, in round order
    fn account_records_after(
        &self,
        asset: &Address,
        wallet: &Address,
        round: Round,
    ) -> Result<Vec<(Round, AccountRecord)>> {
        let prefix = keys::account_prefix(asset, wallet);
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix(Table::Accounts, &prefix)? {
            let r = keys::trailing_round(&key)?;
            if r > round {
                out.push((r, decode(&value)?));
            }
        }
        Ok(out)
    }

    /// Effective record at `round`: stored, or carried forward from the
    /// latest earlier round, or empty
    fn account_at(&self, asset: &Address, wallet: &Address, round: Round) -> Result<AccountRecord> {
        if let Some(record) = self.account_record(asset, wallet, round)? {
            return Ok(record);
        }
        Ok(self
            .account_record_before(asset, wallet, round)?
            .map(|(_, previous)| AccountRecord::carried_from(&previous))
            .transpose()?
            .unwrap_or_default())
    }

    /// Approval by ID
    fn approval(&self, id: &ApprovalId) -> Result<Option<ApprovalRecord>> {
        self.get(Table::Approvals, &keys::id(id))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// Fill by ID
    fn fill(&self, id: &FillId) -> Result<Option<FillRecord>> {
        self.get(Table::Fills, &keys::id(id))?.map(|b| decode(&b)).transpose()
    }

    /// Fills recorded against an approval, ordered by fill ID
    fn fills_for_approval(&self, approval_id: &ApprovalId) -> Result<Vec<FillRecord>> {
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(Table::FillIndex, &keys::id(approval_id))? {
            let fill_bytes: [u8; 16] = key[16..]
                .try_into()
                .map_err(|_| Error::InvalidEncoding("fill index key".to_string()))?;
            let fill_id = uuid::Uuid::from_bytes(fill_bytes);
            let fill = self
                .fill(&fill_id)?
                .ok_or_else(|| Error::InvariantViolation(format!("fill index points at missing fill {}", fill_id)))?;
            out.push(fill);
        }
        Ok(out)
    }

    /// Withdrawal by settlement transaction hash
    fn withdrawal(&self, tx_hash: &Digest) -> Result<Option<Withdrawal>> {
        self.get(Table::Withdrawals, &keys::tx_hash(tx_hash))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// Outstanding withdrawal for a pair
    fn active_withdrawal(&self, asset: &Address, wallet: &Address) -> Result<Option<Digest>> {
        self.get(Table::ActiveWithdrawals, &keys::account_prefix(asset, wallet))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// Withdrawals matching a filter, ordered by transaction hash
    fn withdrawals(&self, filter: &WithdrawalFilter) -> Result<Vec<Withdrawal>> {
        let mut out = Vec::new();
        for (_, value) in self.scan_prefix(Table::Withdrawals, &[])? {
            let withdrawal: Withdrawal = decode(&value)?;
            if filter.matches(&withdrawal) {
                out.push(withdrawal);
            }
        }
        Ok(out)
    }

    /// Root committed for an asset and round
    fn commit(&self, asset: &Address, round: Round) -> Result<Option<RootCommit>> {
        self.get(Table::Commits, &keys::commit(asset, round))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// Stored proof
    fn proof(&self, asset: &Address, wallet: &Address, round: Round) -> Result<Option<Proof>> {
        self.get(Table::Proofs, &keys::account(asset, wallet, round))?
            .map(|b| decode(&b))
            .transpose()
    }
}

impl<T: KvRead + ?Sized> RecordRead for T {}

/// RocksDB-backed tables with a published copy-on-write image
pub struct Storage {
    db: DbView,
    published: RwLock<Arc<Tables>>,
    sync_writes: bool,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create the database under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let descriptors: Vec<ColumnFamilyDescriptor> = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), table.cf_options()))
            .collect();

        let db = DbView {
            db: Arc::new(DB::open_cf_descriptors(&opts, &config.data_dir, descriptors)?),
        };

        let mut tables = Tables::default();
        let mut rows_loaded = 0usize;
        for table in Table::ALL {
            let rows: Rows = db.scan_prefix(table, &[])?.into_iter().collect();
            rows_loaded += rows.len();
            tables.tables.insert(table, rows);
        }

        tracing::info!(
            path = %config.data_dir.display(),
            rows = rows_loaded,
            sync_writes = config.rocksdb.sync_writes,
            "Opened storage"
        );

        Ok(Self {
            db,
            published: RwLock::new(Arc::new(tables)),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    /// Database directory
    pub fn path(&self) -> &Path {
        self.db.db.path()
    }

    /// Current committed state
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tables: self.published.read().clone(),
        }
    }

    /// Start a write set over the database
    pub fn begin(&self) -> Txn {
        Txn {
            base: self.db.clone(),
            writes: BTreeMap::new(),
        }
    }

    /// Write every staged change as one batch, then publish it.
    /// Returns the number of rows written or deleted.
    pub fn commit(&self, txn: Txn) -> Result<usize> {
        let mut batch = WriteBatch::default();
        for ((table, key), value) in &txn.writes {
            let cf = self.db.cf(*table)?;
            match value {
                Some(value) => batch.put_cf(cf, key, value),
                None => batch.delete_cf(cf, key),
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.db.write_opt(batch, &write_opts)?;

        let count = txn.writes.len();
        let mut published = self.published.write();
        let tables = Arc::make_mut(&mut published);
        for ((table, key), value) in txn.writes {
            let rows = tables.tables.entry(table).or_default();
            match value {
                Some(value) => rows.insert(key, value),
                None => rows.remove(&key),
            };
        }

        tracing::trace!(rows = count, "Committed batch");
        Ok(count)
    }

    /// Flush every column family's memtable to disk
    pub fn flush(&self) -> Result<()> {
        for table in Table::ALL {
            self.db.db.flush_cf(self.db.cf(table)?)?;
        }
        tracing::debug!(path = %self.path().display(), "Flushed storage");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_at(dir: &TempDir) -> Config {
        Config {
            data_dir: dir.path().join("ledger"),
            ..Config::default()
        }
    }

    fn test_storage() -> (TempDir, Storage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(&config_at(&temp_dir)).unwrap();
        (temp_dir, storage)
    }

    fn addr(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    fn record(balance: i128, locked: i128) -> AccountRecord {
        AccountRecord {
            balance,
            locked,
            ..AccountRecord::default()
        }
    }

    #[test]
    fn test_storage_open() {
        let (_dir, storage) = test_storage();
        for table in Table::ALL {
            assert!(storage.db.cf(table).is_ok(), "missing {}", table.name());
        }
        assert!(storage.snapshot().wallets().unwrap().is_empty());
    }

    #[test]
    fn test_txn_invisible_until_commit() {
        let (_dir, storage) = test_storage();
        let mut txn = storage.begin();
        txn.put(Table::Assets, keys::address(&addr(1)), &addr(1)).unwrap();

        assert!(txn.is_asset(&addr(1)).unwrap());
        assert!(!storage.snapshot().is_asset(&addr(1)).unwrap());
        assert!(!storage.db.is_asset(&addr(1)).unwrap());

        assert_eq!(storage.commit(txn).unwrap(), 1);
        assert!(storage.snapshot().is_asset(&addr(1)).unwrap());
        assert!(storage.db.is_asset(&addr(1)).unwrap());
    }

    #[test]
    fn test_dropped_txn_writes_nothing() {
        let (_dir, storage) = test_storage();
        {
            let mut txn = storage.begin();
            txn.put(Table::Assets, keys::address(&addr(1)), &addr(1)).unwrap();
        }
        assert!(storage.snapshot().assets().unwrap().is_empty());
        assert!(storage.db.assets().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_isolation() {
        let (_dir, storage) = test_storage();
        let before = storage.snapshot();

        let mut txn = storage.begin();
        txn.put(Table::Assets, keys::address(&addr(1)), &addr(1)).unwrap();
        storage.commit(txn).unwrap();

        assert!(!before.is_asset(&addr(1)).unwrap());
        assert!(storage.snapshot().is_asset(&addr(1)).unwrap());
    }

    #[test]
    fn test_delete_removes_row() {
        let (_dir, storage) = test_storage();
        let (asset, wallet) = (addr(1), addr(2));
        let key = keys::account_prefix(&asset, &wallet);

        let mut txn = storage.begin();
        txn.put(Table::ActiveWithdrawals, key.clone(), &Digest::new([7; 32])).unwrap();
        storage.commit(txn).unwrap();
        assert!(storage.snapshot().active_withdrawal(&asset, &wallet).unwrap().is_some());

        let mut txn = storage.begin();
        txn.delete(Table::ActiveWithdrawals, key);
        assert!(txn.active_withdrawal(&asset, &wallet).unwrap().is_none());
        storage.commit(txn).unwrap();

        assert!(storage.snapshot().active_withdrawal(&asset, &wallet).unwrap().is_none());
        assert!(storage.db.active_withdrawal(&asset, &wallet).unwrap().is_none());
    }

    #[test]
    fn test_account_carry_forward() {
        let (_dir, storage) = test_storage();
        let (asset, wallet) = (addr(1), addr(2));

        let mut txn = storage.begin();
        txn.put(Table::Accounts, keys::account(&asset, &wallet, 2), &record(100, 30))
            .unwrap();
        storage.commit(txn).unwrap();

        let snapshot = storage.snapshot();
        let carried = snapshot.account_at(&asset, &wallet, 5).unwrap();
        assert_eq!(carried.balance, 100);
        assert_eq!(carried.locked, 30);
        assert_eq!(carried.opening_balance, 130);

        assert_eq!(snapshot.account_at(&asset, &wallet, 1).unwrap(), AccountRecord::default());
        assert_eq!(storage.db.account_at(&asset, &wallet, 5).unwrap(), carried);
    }

    #[test]
    fn test_last_before_respects_prefix() {
        let (_dir, storage) = test_storage();
        let asset = addr(1);

        let mut txn = storage.begin();
        txn.put(Table::Accounts, keys::account(&asset, &addr(2), 3), &record(10, 0))
            .unwrap();
        txn.put(Table::Accounts, keys::account(&asset, &addr(4), 1), &record(20, 0))
            .unwrap();
        storage.commit(txn).unwrap();

        // Wallet 3 sorts between 2 and 4 and has no records of its own
        let snapshot = storage.snapshot();
        assert!(snapshot.account_record_before(&asset, &addr(3), 9).unwrap().is_none());
        assert!(storage.db.account_record_before(&asset, &addr(3), 9).unwrap().is_none());

        let (round, found) = storage.db.account_record_before(&asset, &addr(2), 9).unwrap().unwrap();
        assert_eq!(round, 3);
        assert_eq!(found.balance, 10);
        assert!(storage.db.account_record_before(&asset, &addr(2), 3).unwrap().is_none());
    }

    #[test]
    fn test_txn_scan_merges_staged_rows() {
        let (_dir, storage) = test_storage();
        let (asset, wallet) = (addr(1), addr(2));

        let mut txn = storage.begin();
        txn.put(Table::Accounts, keys::account(&asset, &wallet, 1), &record(10, 0))
            .unwrap();
        txn.put(Table::Accounts, keys::account(&asset, &wallet, 3), &record(30, 0))
            .unwrap();
        storage.commit(txn).unwrap();

        let mut txn = storage.begin();
        txn.put(Table::Accounts, keys::account(&asset, &wallet, 2), &record(20, 0))
            .unwrap();
        txn.delete(Table::Accounts, keys::account(&asset, &wallet, 3));

        let after: Vec<Round> = txn
            .account_records_after(&asset, &wallet, 0)
            .unwrap()
            .into_iter()
            .map(|(round, _)| round)
            .collect();
        assert_eq!(after, vec![1, 2]);

        let (round, _) = txn.account_record_before(&asset, &wallet, 5).unwrap().unwrap();
        assert_eq!(round, 2);
    }

    #[test]
    fn test_committed_writes_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_at(&temp_dir);
        {
            let storage = Storage::open(&config).unwrap();
            let mut txn = storage.begin();
            txn.put(Table::Assets, keys::address(&addr(9)), &addr(9)).unwrap();
            storage.commit(txn).unwrap();
            // No flush: the write-ahead log carries the batch
        }

        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.snapshot().assets().unwrap(), vec![addr(9)]);
    }

    #[test]
    fn test_to_json_has_every_table() {
        let (_dir, storage) = test_storage();
        let mut txn = storage.begin();
        txn.put(Table::Assets, keys::address(&addr(1)), &addr(1)).unwrap();
        storage.commit(txn).unwrap();

        let dump = storage.snapshot().to_json().unwrap();
        for table in Table::ALL {
            assert!(dump.get(table.name()).is_some(), "missing {}", table.name());
        }
        assert_eq!(dump["assets"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_trailing_round_rejects_short_key() {
        assert!(keys::trailing_round(&[1, 2, 3]).is_err());
        assert_eq!(keys::trailing_round(&keys::account(&addr(1), &addr(2), 42)).unwrap(), 42);
    }
}
