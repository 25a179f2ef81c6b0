//! Assertions: immutable, content-addressed bundles of statements
//!
//! # Architecture
//!
//! - **Graph input**: [`Graph`] accepts N-Quads text, compact JSON graphs or
//!   prebuilt [`Triple`]s
//! - **Normalizer**: [`Normalizer`] lowers, sorts and deduplicates statements
//! - **Digest**: the root of a [`MerkleTree`] over the canonical lines
//!
//! The digest never depends on input statement order or on the creation
//! timestamp, so it can be compared against the value recorded on-chain.

pub mod graph;
pub mod merkle;
pub mod normalizer;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use graph::{Graph, Term, Triple};
pub use merkle::MerkleTree;
pub use normalizer::{Normalizer, normalize};

/// Content digest of an assertion (`0x` + 64 lowercase hex characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssertionDigest(String);

impl AssertionDigest {
    pub fn parse(value: &str) -> Result<Self> {
        let valid = value
            .strip_prefix("0x")
            .map(|hex| {
                hex.len() == 64
                    && hex
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            })
            .unwrap_or(false);

        if !valid {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a 0x-prefixed lowercase 32-byte digest",
                value
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub(crate) fn from_hash(hash: &merkle::Hash) -> Self {
        Self(merkle::to_hex(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssertionDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AssertionDigest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<AssertionDigest> for String {
    fn from(digest: AssertionDigest) -> Self {
        digest.0
    }
}

/// Size figures used for bid estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionMetadata {
    /// Byte length of the compact JSON array of canonical lines
    pub size_bytes: u64,
    pub triples: u64,
    pub chunks: u64,
}

/// An immutable, canonicalized set of statements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    digest: AssertionDigest,
    statements: Vec<String>,
    metadata: AssertionMetadata,
    context: Option<String>,
    created_at: DateTime<Utc>,
}

impl Assertion {
    pub fn digest(&self) -> &AssertionDigest {
        &self.digest
    }

    /// Canonical N-Quads lines, sorted and deduplicated
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn metadata(&self) -> AssertionMetadata {
        self.metadata
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Byte-exact canonical serialization (one statement per line)
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for line in &self.statements {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Merkle tree over this assertion's statements
    pub fn merkle_tree(&self) -> Result<MerkleTree> {
        MerkleTree::new(merkle::hash_leaves(&self.statements))
    }

    /// Inclusion proof for the statement at `index`
    pub fn proof(&self, index: usize) -> Result<Vec<merkle::Hash>> {
        self.merkle_tree()?.proof(index)
    }
}

impl PartialEq for Assertion {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.statements == other.statements
    }
}

impl Eq for Assertion {}
