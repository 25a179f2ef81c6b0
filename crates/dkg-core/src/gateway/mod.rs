//! Gateway interfaces to the chain and the node network
//!
//! Both gateways are stateless request/response collaborators. Every call
//! ends in success or one of the few outcomes in [`GatewayError`]:
//!
//! - **Rejected**: definitive refusal (revert, declined bid), never retried
//! - **Conflict**: the chain state moved under a compare-and-swap write
//! - **NotFound**: the token, transaction or content does not exist
//! - **Transient / Timeout**: network blips, safe to retry for reads only
//!
//! Implementations in this crate:
//! - [`memory`]: in-process chain and node network for tests and local runs
//! - [`http`]: node gateway speaking the node's JSON HTTP API

pub mod chain;
pub mod http;
pub mod memory;
pub mod node;
pub mod retry;

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assertion::{AssertionDigest, AssertionMetadata};
use crate::ual::{Address, TokenId, Ual};

pub use chain::ChainGateway;
pub use node::NodeGateway;
pub use retry::{ReadRetryPolicy, retry_read, with_deadline};

/// Token amount in the smallest unit
pub type Amount = u128;

/// Result of a single gateway call
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Lazy sequence of UALs returned by topic search
pub type UalStream = Pin<Box<dyn Stream<Item = GatewayResult<Ual>> + Send>>;

/// Outcome of a failed gateway call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Whether a read failing this way may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Handle of a submitted chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle(pub String);

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receipt a node returns for a submitted assertion
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeReceipt(pub String);

impl fmt::Display for NodeReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chain-side status of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed { confirmations: u64 },
    Reverted { reason: String },
}

/// Which point of the network's bid range to ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidRange {
    #[default]
    Low,
    Medium,
    High,
}

impl BidRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for BidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for a storage bid estimate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidRequest {
    pub digest: AssertionDigest,
    pub size_bytes: u64,
    pub epochs: u64,
    pub range: BidRange,
}

/// Estimated payment for storing content of a given size for some epochs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub amount: Amount,
    pub size_bytes: u64,
    pub epochs: u64,
}

/// Arguments of the asset-creation transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetCreation {
    pub digest: AssertionDigest,
    pub metadata: AssertionMetadata,
    pub token_amount: Amount,
    pub epochs: u64,
}

/// Arguments of the asset-update transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUpdate {
    /// State the caller read before deciding to update
    pub expected_state: AssertionDigest,
    pub digest: AssertionDigest,
    pub metadata: AssertionMetadata,
    pub token_amount: Amount,
}

/// A paid asset write as the ledger logs it
///
/// Recorded before submission so that a write whose response was lost can be
/// looked up afterwards with [`ChainGateway::find_write`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "write", rename_all = "snake_case")]
pub enum ChainWrite {
    Create { digest: AssertionDigest },
    Update { token_id: TokenId, digest: AssertionDigest },
    Transfer { token_id: TokenId, new_owner: Address },
    Burn { token_id: TokenId },
    AddTokens { token_id: TokenId, amount: Amount },
    ExtendStorage { token_id: TokenId, epochs: u64, amount: Amount },
}

/// A logged write found on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandedWrite {
    pub tx: TxHandle,
    /// Token the write touched; for a create, the minted one
    pub token_id: TokenId,
}

/// On-chain record of a Knowledge Asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub token_id: TokenId,
    pub owner: Address,
    /// Current assertion digest
    pub state: AssertionDigest,
    /// All digests ever recorded, oldest first, including the current one
    pub history: Vec<AssertionDigest>,
    /// Size of the current state, for bid estimation
    pub state_size_bytes: u64,
    pub end_epoch: u64,
    pub token_balance: Amount,
}

/// Node-side replication progress of a submitted assertion
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Number of nodes that acknowledged storing the assertion
    pub acknowledged: u32,
    /// The node declared the operation complete by its own threshold
    pub complete: bool,
    /// Definitive rejection reason, if the node refused the assertion
    pub rejected: Option<String>,
}
