//! Content normalizer
//!
//! Turns an input [`Graph`] into an [`Assertion`]: statements are rendered as
//! N-Quads lines, sorted and deduplicated, then hashed into a Merkle root.
//! Normalization is pure and deterministic.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::debug;

use super::graph::{Graph, Triple};
use super::merkle::{self, MerkleTree};
use super::{Assertion, AssertionDigest, AssertionMetadata};
use crate::error::{Error, Result};

/// Stateless normalizer, cheap to clone and share
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize an input graph into an assertion
    pub fn normalize(&self, graph: &Graph) -> Result<Assertion> {
        let parsed = graph.parse()?;
        let lines: BTreeSet<String> = parsed.triples.iter().map(Triple::to_nquad).collect();

        if lines.is_empty() {
            return Err(Error::MalformedGraph(
                "graph contains no statements".to_string(),
            ));
        }

        let statements: Vec<String> = lines.into_iter().collect();
        let (digest, metadata) = Self::digest_lines(&statements)?;

        debug!(
            digest = %digest,
            triples = metadata.triples,
            size_bytes = metadata.size_bytes,
            "Normalized assertion"
        );

        Ok(Assertion {
            digest,
            statements,
            metadata,
            context: parsed.context,
            created_at: Utc::now(),
        })
    }

    /// Recompute the digest of a payload fetched from the network
    ///
    /// The payload is re-parsed and re-canonicalized, so a node cannot pass
    /// off differently ordered or formatted content as a match.
    pub fn digest_of_payload(&self, lines: &[String]) -> Result<AssertionDigest> {
        let assertion = self.normalize(&Graph::NQuads(lines.join("\n")))?;
        Ok(assertion.digest)
    }

    fn digest_lines(statements: &[String]) -> Result<(AssertionDigest, AssertionMetadata)> {
        let tree = MerkleTree::new(merkle::hash_leaves(statements))?;
        let size_bytes = serde_json::to_vec(statements)
            .map_err(|e| Error::Other(format!("failed to measure assertion size: {}", e)))?
            .len() as u64;
        let count = statements.len() as u64;

        Ok((
            AssertionDigest::from_hash(&tree.root()),
            AssertionMetadata {
                size_bytes,
                triples: count,
                chunks: count,
            },
        ))
    }
}

/// Normalize with the default normalizer
pub fn normalize(graph: &Graph) -> Result<Assertion> {
    Normalizer::new().normalize(graph)
}
