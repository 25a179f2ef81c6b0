//! Query and verification
//!
//! The read path. Resolving a UAL reads the digest the chain records for the
//! asset, fetches the content behind it from a node and recomputes the digest
//! locally. Content is only trusted when the two digests agree; a mismatch is
//! always reported, never papered over.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::assertion::{AssertionDigest, Normalizer};
use crate::error::{Error, Result};
use crate::gateway::{
    ChainGateway, GatewayError, NodeGateway, ReadRetryPolicy, UalStream, retry_read,
};
use crate::ual::Ual;

/// Which recorded state of an asset to resolve
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StateSelector {
    /// The state the chain currently records
    #[default]
    Latest,
    /// Position in the asset's history, oldest first
    Index(usize),
    /// A specific digest from the asset's history
    Digest(AssertionDigest),
}

/// Outcome of checking fetched content against the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    /// The content does not hash to the recorded digest. `actual` is `None`
    /// when the payload could not be canonicalized at all.
    DigestMismatch {
        expected: AssertionDigest,
        actual: Option<AssertionDigest>,
    },
    /// The chain or the node has no record of the asset or state
    NotFound,
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Content of one asset state together with its verification
#[derive(Debug, Clone)]
pub struct Resolution {
    pub ual: Ual,
    /// Digest recorded on chain for the resolved state
    pub expected: Option<AssertionDigest>,
    /// Canonical lines as returned by the node
    pub lines: Vec<String>,
    pub verification: Verification,
}

impl Resolution {
    fn not_found(ual: &Ual, expected: Option<AssertionDigest>) -> Self {
        Self {
            ual: ual.clone(),
            expected,
            lines: Vec::new(),
            verification: Verification::NotFound,
        }
    }
}

/// Resolves UALs to verified content and searches the network
#[derive(Clone)]
pub struct QueryEngine {
    chain: Arc<dyn ChainGateway>,
    node: Arc<dyn NodeGateway>,
    read_retry: ReadRetryPolicy,
    normalizer: Normalizer,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("network", &self.chain.network())
            .field("read_retry", &self.read_retry)
            .finish()
    }
}

impl QueryEngine {
    pub fn new(chain: Arc<dyn ChainGateway>, node: Arc<dyn NodeGateway>) -> Self {
        Self {
            chain,
            node,
            read_retry: ReadRetryPolicy::default(),
            normalizer: Normalizer::new(),
        }
    }

    pub fn with_read_retry(mut self, policy: ReadRetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    /// Resolve the latest state of an asset
    pub async fn resolve(&self, ual: &Ual) -> Result<Resolution> {
        self.resolve_state(ual, StateSelector::Latest).await
    }

    /// Resolve a chosen state of an asset
    ///
    /// Fails with `InvalidInput` when the selector names a state the asset
    /// never had. Missing assets or content resolve to
    /// [`Verification::NotFound`].
    pub async fn resolve_state(&self, ual: &Ual, selector: StateSelector) -> Result<Resolution> {
        ual.validate_for(self.chain.network(), self.chain.asset_contract())?;
        let token_id = ual.token_id();

        let expected = match self.expected_digest(ual, &selector).await? {
            Some(digest) => digest,
            None => {
                debug!(ual = %ual, "Asset not found on chain");
                return Ok(Resolution::not_found(ual, None));
            }
        };

        let fetched = retry_read(&self.read_retry, "fetch_assertion", || {
            self.node.fetch_assertion(ual, &expected)
        })
        .await;
        let lines = match fetched {
            Ok(lines) => lines,
            Err(GatewayError::NotFound(_)) => {
                debug!(ual = %ual, digest = %expected, "Content not found on the node");
                return Ok(Resolution::not_found(ual, Some(expected)));
            }
            Err(e) => return Err(fetch_error("fetch_assertion", e)),
        };

        let verification = match self.normalizer.digest_of_payload(&lines) {
            Ok(actual) if actual == expected => {
                debug!(ual = %ual, digest = %expected, "Content verified");
                Verification::Verified
            }
            Ok(actual) => {
                warn!(
                    token_id = token_id,
                    expected = %expected,
                    actual = %actual,
                    "Fetched content does not match the on-chain digest"
                );
                Verification::DigestMismatch {
                    expected: expected.clone(),
                    actual: Some(actual),
                }
            }
            Err(e) => {
                warn!(token_id = token_id, expected = %expected, error = %e, "Fetched content is not a valid graph");
                Verification::DigestMismatch {
                    expected: expected.clone(),
                    actual: None,
                }
            }
        };

        Ok(Resolution {
            ual: ual.clone(),
            expected: Some(expected),
            lines,
            verification,
        })
    }

    /// Resolve the latest state and fail unless it verifies
    pub async fn resolve_verified(&self, ual: &Ual) -> Result<Vec<String>> {
        let resolution = self.resolve(ual).await?;
        match resolution.verification {
            Verification::Verified => Ok(resolution.lines),
            Verification::DigestMismatch { expected, actual } => Err(Error::DigestMismatch {
                expected: expected.to_string(),
                actual: actual
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unparseable payload".to_string()),
            }),
            Verification::NotFound => Err(Error::NotFound(format!("content of {}", ual))),
        }
    }

    /// Search the network for assets whose content matches `pattern`
    ///
    /// Hits are produced lazily and are not verified one by one; resolve a
    /// hit to check its content.
    pub fn query(&self, pattern: &str) -> UalStream {
        debug!(pattern = %pattern, "Starting topic search");
        self.node.search_topic(pattern)
    }

    /// Digest recorded for the selected state, or `None` if the asset is unknown
    async fn expected_digest(
        &self,
        ual: &Ual,
        selector: &StateSelector,
    ) -> Result<Option<AssertionDigest>> {
        let token_id = ual.token_id();
        if let StateSelector::Latest = selector {
            let state = retry_read(&self.read_retry, "get_asset_state", || {
                self.chain.get_asset_state(token_id)
            })
            .await;
            return match state {
                Ok(digest) => Ok(Some(digest)),
                Err(GatewayError::NotFound(_)) => Ok(None),
                Err(e) => Err(fetch_error("get_asset_state", e)),
            };
        }

        let record = retry_read(&self.read_retry, "get_asset_record", || {
            self.chain.get_asset_record(token_id)
        })
        .await;
        let history = match record {
            Ok(record) => record.history,
            Err(GatewayError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(fetch_error("get_asset_record", e)),
        };

        match selector {
            StateSelector::Index(index) => history.get(*index).cloned().map(Some).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "state index {} out of range; {} has {} states",
                    index,
                    ual,
                    history.len()
                ))
            }),
            StateSelector::Digest(digest) => {
                if history.contains(digest) {
                    Ok(Some(digest.clone()))
                } else {
                    Err(Error::InvalidInput(format!(
                        "{} never held state {}",
                        ual, digest
                    )))
                }
            }
            StateSelector::Latest => Ok(history.last().cloned()),
        }
    }
}

fn fetch_error(operation: &str, error: GatewayError) -> Error {
    match error {
        GatewayError::Timeout(_) => Error::Timeout {
            stage: operation.to_string(),
            key: None,
            ual: None,
        },
        GatewayError::NotFound(what) => Error::NotFound(what),
        other => Error::Gateway(other),
    }
}
