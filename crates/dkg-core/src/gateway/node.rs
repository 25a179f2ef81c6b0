//! Node gateway trait

use async_trait::async_trait;

use super::{Bid, BidRequest, GatewayResult, NodeReceipt, ReplicationStatus, UalStream};
use crate::assertion::{Assertion, AssertionDigest};
use crate::ual::Ual;

/// Access to the network of graph-database nodes
#[async_trait]
pub trait NodeGateway: Send + Sync {
    /// Ask the network what storing content of this size would cost
    async fn estimate_bid(&self, request: &BidRequest) -> GatewayResult<Bid>;

    /// Hand an assertion to the network for storage and replication
    async fn submit_assertion(&self, ual: &Ual, assertion: &Assertion) -> GatewayResult<NodeReceipt>;

    async fn get_replication_status(&self, receipt: &NodeReceipt) -> GatewayResult<ReplicationStatus>;

    /// Fetch the canonical lines a node holds for one state of an asset
    async fn fetch_assertion(&self, ual: &Ual, digest: &AssertionDigest) -> GatewayResult<Vec<String>>;

    /// Search for assets whose content matches `pattern`
    ///
    /// Results are produced lazily; nothing is fetched until polled.
    fn search_topic(&self, pattern: &str) -> UalStream;
}
