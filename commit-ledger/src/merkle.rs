//! Generic Merkle tree for membership proofs
//!
//! The tree is parameterised by a [`MerkleStrategy`] that turns raw elements
//! into leaf nodes and combines pairs of nodes. It is built once from a list
//! of elements and never mutated afterwards.
//!
//! # Design
//!
//! - Pairs are sorted with [`MerkleStrategy::compare`] before combining, so a
//!   proof is a plain list of siblings with no left/right markers
//! - A node without a sibling is promoted to the next level unchanged
//! - The empty tree is a single empty level and has no root

use crate::{Error, Result};
use std::cmp::Ordering;
use std::fmt::Debug;

/// Hashing rules a tree is built with
pub trait MerkleStrategy {
    /// Raw element a leaf is derived from
    type Element;
    /// Tree node
    type Node: Clone + Debug;

    /// Hash a raw element into a leaf
    fn hash(&self, element: &Self::Element) -> Self::Node;

    /// Combine two nodes already sorted by [`MerkleStrategy::compare`]
    fn combine(&self, first: &Self::Node, second: &Self::Node) -> Result<Self::Node>;

    /// Canonical order of a pair
    fn compare(&self, a: &Self::Node, b: &Self::Node) -> Ordering;

    /// Node equality used when locating leaves and checking roots
    fn equals(&self, a: &Self::Node, b: &Self::Node) -> bool;

    /// Whether a node may take part in a proof
    fn is_valid(&self, _node: &Self::Node) -> bool {
        true
    }
}

/// Combine a pair in canonical order
fn combine_sorted<S: MerkleStrategy>(strategy: &S, a: &S::Node, b: &S::Node) -> Result<S::Node> {
    match strategy.compare(a, b) {
        Ordering::Greater => strategy.combine(b, a),
        _ => strategy.combine(a, b),
    }
}

/// Fold a leaf with its proof siblings up to a candidate root
pub fn fold_path<S: MerkleStrategy>(strategy: &S, leaf: S::Node, proof: &[S::Node]) -> Result<S::Node> {
    proof
        .iter()
        .try_fold(leaf, |acc, sibling| combine_sorted(strategy, &acc, sibling))
}

/// Immutable list-of-levels Merkle tree
#[derive(Debug, Clone)]
pub struct MerkleTree<S: MerkleStrategy> {
    strategy: S,
    levels: Vec<Vec<S::Node>>,
}

impl<S: MerkleStrategy> MerkleTree<S> {
    /// Build a tree from raw elements
    pub fn new(strategy: S, elements: &[S::Element]) -> Result<Self> {
        let leaves: Vec<S::Node> = elements.iter().map(|e| strategy.hash(e)).collect();
        let mut levels = vec![leaves];

        while levels.last().map_or(false, |level| level.len() > 1) {
            let next: Vec<S::Node> = levels[levels.len() - 1]
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => combine_sorted(&strategy, a, b),
                    [single] => Ok(single.clone()),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect::<Result<_>>()?;
            levels.push(next);
        }

        Ok(Self { strategy, levels })
    }

    /// Tree with no elements, usable for proof validation only
    pub fn empty(strategy: S) -> Self {
        Self {
            strategy,
            levels: vec![Vec::new()],
        }
    }

    /// Strategy the tree was built with
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Root node, absent for the empty tree
    pub fn root(&self) -> Option<&S::Node> {
        self.levels.last().and_then(|level| level.first())
    }

    /// Number of levels
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Number of leaves
    pub fn width(&self) -> usize {
        self.levels[0].len()
    }

    /// All levels, leaves first
    pub fn levels(&self) -> &[Vec<S::Node>] {
        &self.levels
    }

    /// Siblings of `element`'s leaf from the bottom up, excluding the root
    pub fn liabilities(&self, element: &S::Element) -> Result<Vec<S::Node>> {
        let leaf = self.strategy.hash(element);
        let mut index = self.levels[0]
            .iter()
            .position(|node| self.strategy.equals(node, &leaf))
            .ok_or_else(|| Error::NotFound(format!("leaf {:?} is not in the tree", leaf)))?;

        let mut proof = Vec::with_capacity(self.height().saturating_sub(1));
        for level in &self.levels[..self.levels.len() - 1] {
            if let Some(sibling) = level.get(index ^ 1) {
                proof.push(sibling.clone());
            }
            index /= 2;
        }

        Ok(proof)
    }

    /// Check that `proof` folds `item` up to `root`
    pub fn validate_proof(
        &self,
        proof: &[S::Node],
        root: Option<&S::Node>,
        item: &S::Element,
    ) -> bool {
        let Some(root) = root else {
            return false;
        };

        let leaf = self.strategy.hash(item);
        if !self.strategy.is_valid(&leaf) || !proof.iter().all(|n| self.strategy.is_valid(n)) {
            return false;
        }

        match fold_path(&self.strategy, leaf, proof) {
            Ok(computed) => self.strategy.equals(&computed, root),
            Err(_) => false,
        }
    }
}
