//! Merkle tree over canonical assertion lines
//!
//! Leaf `i` is `H(H(line_i) || be256(i))`. Parents hash the sorted pair of
//! children, and a trailing odd node is promoted to the next level unchanged.
//! `H` is SHA-256.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub type Hash = [u8; 32];

fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn hash_pair(a: &Hash, b: &Hash) -> Hash {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(second);
    hasher.finalize().into()
}

/// Hash canonical lines into indexed leaves
///
/// The caller is responsible for passing lines in canonical (sorted) order.
pub fn hash_leaves(lines: &[String]) -> Vec<Hash> {
    lines
        .iter()
        .enumerate()
        .map(|(index, line)| {
            let mut packed = Vec::with_capacity(64);
            packed.extend_from_slice(&sha256(line.as_bytes()));
            let mut position = [0u8; 32];
            position[24..].copy_from_slice(&(index as u64).to_be_bytes());
            packed.extend_from_slice(&position);
            sha256(&packed)
        })
        .collect()
}

/// Render a hash as `0x`-prefixed lowercase hex
pub fn to_hex(hash: &Hash) -> String {
    format!("0x{}", hex::encode(hash))
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] are the leaves, the last level holds the root
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    pub fn new(leaves: Vec<Hash>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(Error::MalformedGraph(
                "cannot build a Merkle tree without leaves".to_string(),
            ));
        }

        let mut levels = vec![leaves];
        while let Some(level) = levels.last() {
            if level.len() == 1 {
                break;
            }
            let next: Vec<Hash> = level
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_pair(a, b),
                    promoted => promoted[0],
                })
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn leaves(&self) -> &[Hash] {
        &self.levels[0]
    }

    /// Sibling path for the leaf at `index`, bottom-up
    pub fn proof(&self, index: usize) -> Result<Vec<Hash>> {
        if index >= self.leaves().len() {
            return Err(Error::InvalidInput(format!(
                "leaf {} is not part of a tree with {} leaves",
                index,
                self.leaves().len()
            )));
        }

        let mut proof = Vec::new();
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            if let Some(sibling) = level.get(position ^ 1) {
                proof.push(*sibling);
            }
            position /= 2;
        }

        Ok(proof)
    }

    /// Check a proof produced by [`MerkleTree::proof`] against a root
    pub fn verify(proof: &[Hash], leaf: &Hash, root: &Hash) -> bool {
        let computed = proof
            .iter()
            .fold(*leaf, |acc, sibling| hash_pair(&acc, sibling));
        &computed == root
    }
}
