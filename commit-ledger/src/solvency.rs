//! Solvency tree: a Merkle tree whose nodes carry liability sums
//!
//! Leaves hash `(sum, wallet, round)`; every internal node hashes the sum of
//! its children together with their hashes. A partial proof therefore
//! attests both that a wallet's balance is included and an upper bound on
//! total liabilities. The padded root `H(H(root.hash, root.sum), height,
//! width)` is the value anchored by the settlement verifier.

use crate::crypto::{liability_leaf, PackedEncoder};
use crate::merkle::{fold_path, MerkleStrategy, MerkleTree};
use crate::types::{Address, Amount, Digest, Round};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Tree node: hash plus accumulated sum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liability {
    /// Node hash
    pub hash: Digest,
    /// Sum of all leaves below
    pub sum: Amount,
}

/// Raw tree element: a wallet's opening balance in a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolvencyAccount {
    /// Wallet address
    pub wallet: Address,
    /// Opening balance
    pub sum: Amount,
    /// Round
    pub round: Round,
}

/// Hashing rules of the solvency tree
#[derive(Debug, Clone, Copy, Default)]
pub struct SolvencyStrategy;

impl MerkleStrategy for SolvencyStrategy {
    type Element = SolvencyAccount;
    type Node = Liability;

    fn hash(&self, account: &SolvencyAccount) -> Liability {
        Liability {
            hash: liability_leaf(&account.wallet, account.sum, account.round),
            sum: account.sum,
        }
    }

    fn combine(&self, first: &Liability, second: &Liability) -> Result<Liability> {
        let sum = first.sum.checked_add(second.sum).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "liability sum {} + {} overflows",
                first.sum, second.sum
            ))
        })?;
        let hash = PackedEncoder::new()
            .int(sum)
            .digest(&first.hash)
            .digest(&second.hash)
            .hash();
        Ok(Liability { hash, sum })
    }

    fn compare(&self, a: &Liability, b: &Liability) -> Ordering {
        a.hash.cmp(&b.hash)
    }

    fn equals(&self, a: &Liability, b: &Liability) -> bool {
        a.hash == b.hash && a.sum == b.sum
    }

    fn is_valid(&self, node: &Liability) -> bool {
        node.sum >= 0
    }
}

/// Root content with the tree's shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootInfo {
    /// `H(root.hash, root.sum)`
    pub content: Digest,
    /// Number of levels
    pub height: u64,
    /// Number of leaves
    pub width: u64,
}

impl RootInfo {
    /// Root info for a root node and tree shape
    pub fn new(root: &Liability, height: u64, width: u64) -> Self {
        let content = PackedEncoder::new().digest(&root.hash).int(root.sum).hash();
        Self {
            content,
            height,
            width,
        }
    }

    /// Anchored value `H(content, height, width)`
    pub fn padded(&self) -> Digest {
        PackedEncoder::new()
            .digest(&self.content)
            .uint(self.height)
            .uint(self.width)
            .hash()
    }
}

/// Proof without the claimant's own leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialProof {
    /// Siblings from leaf to root
    pub liabilities: Vec<Liability>,
    /// Tree height
    pub height: u64,
    /// Tree width
    pub width: u64,
    /// Round the tree was built for
    pub round: Round,
}

impl PartialProof {
    /// Attach the claimant's own data
    pub fn complete(self, client_opening_balance: Amount, client_address: Address, token_address: Address) -> Proof {
        Proof {
            liabilities: self.liabilities,
            height: self.height,
            width: self.width,
            round: self.round,
            client_opening_balance,
            client_address,
            token_address,
        }
    }
}

/// Proof completed for a specific client and token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Siblings from leaf to root
    pub liabilities: Vec<Liability>,
    /// Tree height
    pub height: u64,
    /// Tree width
    pub width: u64,
    /// Round the tree was built for
    pub round: Round,
    /// Claimant's opening balance in `round`
    pub client_opening_balance: Amount,
    /// Claimant wallet
    pub client_address: Address,
    /// Token the tree was built for
    pub token_address: Address,
}

impl Proof {
    /// The claimant's tree element
    pub fn account(&self) -> SolvencyAccount {
        SolvencyAccount {
            wallet: self.client_address,
            sum: self.client_opening_balance,
            round: self.round,
        }
    }

    /// Root this proof folds up to
    pub fn root(&self) -> Result<Liability> {
        let leaf = SolvencyStrategy.hash(&self.account());
        fold_path(&SolvencyStrategy, leaf, &self.liabilities)
    }

    /// Check the proof against a root node
    pub fn verify(&self, root: &Liability) -> bool {
        verify_proof(&self.liabilities, Some(root), &self.account())
    }

    /// Check the proof against an anchored padded root
    pub fn verify_commitment(&self, padded_root: &Digest) -> bool {
        let Ok(root) = self.root() else {
            return false;
        };
        self.verify(&root) && RootInfo::new(&root, self.height, self.width).padded() == *padded_root
    }
}

/// Solvency tree over a fixed set of accounts
#[derive(Debug, Clone)]
pub struct SolvencyTree {
    tree: MerkleTree<SolvencyStrategy>,
    accounts: Vec<SolvencyAccount>,
}

impl SolvencyTree {
    /// Build the tree in the given account order
    pub fn new(accounts: Vec<SolvencyAccount>) -> Result<Self> {
        let tree = MerkleTree::new(SolvencyStrategy, &accounts)?;
        Ok(Self { tree, accounts })
    }

    /// Tree with no accounts
    pub fn empty() -> Self {
        Self {
            tree: MerkleTree::empty(SolvencyStrategy),
            accounts: Vec::new(),
        }
    }

    /// Root node, absent for the empty tree
    pub fn root(&self) -> Option<&Liability> {
        self.tree.root()
    }

    /// Number of levels
    pub fn height(&self) -> u64 {
        self.tree.height() as u64
    }

    /// Number of leaves
    pub fn width(&self) -> u64 {
        self.tree.width() as u64
    }

    /// Accounts the tree was built from
    pub fn accounts(&self) -> &[SolvencyAccount] {
        &self.accounts
    }

    /// Root content with height and width
    pub fn root_info(&self) -> Result<RootInfo> {
        let root = self
            .root()
            .ok_or_else(|| Error::MerkleError("solvency tree has no root".to_string()))?;
        Ok(RootInfo::new(root, self.height(), self.width()))
    }

    /// Anchored value `H(H(root.hash, root.sum), height, width)`
    pub fn root_with_padding(&self) -> Result<Digest> {
        Ok(self.root_info()?.padded())
    }

    /// Partial proof for `wallet`'s leaf in `round`
    pub fn partial_proof(&self, wallet: &Address, round: Round) -> Result<PartialProof> {
        let account = self
            .accounts
            .iter()
            .find(|a| a.wallet == *wallet && a.round == round)
            .ok_or_else(|| {
                Error::NotFound(format!("wallet {} is not in the round {} tree", wallet, round))
            })?;

        Ok(PartialProof {
            liabilities: self.tree.liabilities(account)?,
            height: self.height(),
            width: self.width(),
            round,
        })
    }

    /// Validate a proof against a root with this tree's hashing rules
    pub fn validate_proof(
        &self,
        proof: &[Liability],
        root: Option<&Liability>,
        account: &SolvencyAccount,
    ) -> bool {
        self.tree.validate_proof(proof, root, account)
    }
}

/// Validate a proof without a populated tree
pub fn verify_proof(proof: &[Liability], root: Option<&Liability>, account: &SolvencyAccount) -> bool {
    SolvencyTree::empty().validate_proof(proof, root, account)
}
