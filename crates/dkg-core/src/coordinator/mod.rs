//! Publish/update coordinator
//!
//! Drives one logical operation across the chain and the node network as a
//! resumable saga. Each operation keeps a ledger of committed steps in the
//! [`OperationTable`]; retrying with the same [`IdempotencyKey`] resumes from
//! the first missing step instead of starting over, so a paid chain write is
//! never submitted twice.
//!
//! Write order for content operations is strict:
//!
//! 1. normalize
//! 2. bid estimate and allowance read (concurrently)
//! 3. allowance raise, if needed and allowed
//! 4. chain write (create or compare-and-swap update)
//! 5. node submission
//! 6. finalization
//!
//! Cancellation before step 4 has no chain effect. After step 4 it only stops
//! waiting.
//!
//! A paid chain write is recorded as pending, together with the block height
//! it was sent after, before it goes out. When its response is lost the next
//! attempt looks the write up on chain and adopts it, and sends it again only
//! when the chain never saw it.

mod allowance;
mod asset_ops;
pub mod operation;
mod publish;
pub mod table;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assertion::Normalizer;
use crate::error::{Error, Result};
use crate::finalization::{
    Clock, FailureSource, FinalizationConfig, FinalizationPoller, FinalizationState,
    FinalizationTarget,
};
use crate::gateway::{
    Amount, BidRange, ChainGateway, ChainWrite, GatewayError, GatewayResult, NodeGateway,
    ReadRetryPolicy, retry_read,
};
use crate::ual::Ual;

pub use operation::{
    IdempotencyKey, OperationHandle, OperationKind, OperationRecord, OperationStep, PendingWrite,
    WaitMode,
};
pub use table::OperationTable;

use table::Attempt;

/// Coordinator policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Storage epochs used when a publish does not name them
    pub default_epochs: u64,
    pub default_bid_range: BidRange,
    /// Raise a short allowance to the bid without asking
    pub auto_raise_allowance: bool,
    /// Deadline for each chain or node write call
    pub write_timeout: Duration,
    /// How long a second attempt on a busy key waits
    pub lock_timeout: Duration,
    pub read_retry: ReadRetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_epochs: 2,
            default_bid_range: BidRange::Low,
            auto_raise_allowance: true,
            write_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(5),
            read_retry: ReadRetryPolicy::default(),
        }
    }
}

/// Options for `publish` and `update`
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub epochs: Option<u64>,
    /// Explicit payment; skips the bid estimate
    pub token_amount: Option<Amount>,
    /// Most the caller allows this operation to spend
    pub spend_limit: Option<Amount>,
    pub bid_range: Option<BidRange>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub wait: WaitMode,
    pub auto_raise_allowance: Option<bool>,
    pub cancel: Option<CancellationToken>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishOptions {
    pub fn new() -> Self {
        Self {
            epochs: None,
            token_amount: None,
            spend_limit: None,
            bid_range: None,
            idempotency_key: None,
            wait: WaitMode::Finalize,
            auto_raise_allowance: None,
            cancel: None,
        }
    }

    pub fn with_epochs(mut self, epochs: u64) -> Self {
        self.epochs = Some(epochs);
        self
    }

    pub fn with_token_amount(mut self, amount: Amount) -> Self {
        self.token_amount = Some(amount);
        self
    }

    pub fn with_spend_limit(mut self, limit: Amount) -> Self {
        self.spend_limit = Some(limit);
        self
    }

    pub fn with_bid_range(mut self, range: BidRange) -> Self {
        self.bid_range = Some(range);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_wait(mut self, wait: WaitMode) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_auto_raise_allowance(mut self, enabled: bool) -> Self {
        self.auto_raise_allowance = Some(enabled);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Options for chain-only operations
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    pub idempotency_key: Option<IdempotencyKey>,
    pub wait: WaitMode,
    pub spend_limit: Option<Amount>,
    pub cancel: Option<CancellationToken>,
}

impl OperationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_wait(mut self, wait: WaitMode) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_spend_limit(mut self, limit: Amount) -> Self {
        self.spend_limit = Some(limit);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Builder for creating a Coordinator
pub struct CoordinatorBuilder {
    chain: Option<Arc<dyn ChainGateway>>,
    node: Option<Arc<dyn NodeGateway>>,
    config: CoordinatorConfig,
    finalization: FinalizationConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            chain: None,
            node: None,
            config: CoordinatorConfig::default(),
            finalization: FinalizationConfig::default(),
            clock: None,
        }
    }

    pub fn chain(mut self, chain: Arc<dyn ChainGateway>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn node(mut self, node: Arc<dyn NodeGateway>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn finalization(mut self, config: FinalizationConfig) -> Self {
        self.finalization = config;
        self
    }

    /// Time source for finalization polling
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        let chain = self
            .chain
            .ok_or_else(|| Error::ConfigError("chain gateway is required".to_string()))?;
        let node = self
            .node
            .ok_or_else(|| Error::ConfigError("node gateway is required".to_string()))?;

        let mut poller = FinalizationPoller::new(chain.clone(), node.clone(), self.finalization);
        if let Some(clock) = self.clock {
            poller = poller.with_clock(clock);
        }

        Ok(Coordinator {
            chain,
            node,
            poller,
            table: Arc::new(OperationTable::new(self.config.lock_timeout)),
            config: self.config,
            normalizer: Normalizer::new(),
        })
    }
}

/// Entry point for every write against the network
#[derive(Clone)]
pub struct Coordinator {
    chain: Arc<dyn ChainGateway>,
    node: Arc<dyn NodeGateway>,
    poller: FinalizationPoller,
    table: Arc<OperationTable>,
    config: CoordinatorConfig,
    normalizer: Normalizer,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("account", self.chain.account())
            .field("network", &self.chain.network())
            .field("config", &self.config)
            .finish()
    }
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Account that signs every chain write
    pub fn account(&self) -> &crate::ual::Address {
        self.chain.account()
    }

    // ========== Inspection ==========

    /// Snapshot of an operation's committed steps
    pub async fn status(&self, key: &IdempotencyKey) -> Option<OperationRecord> {
        self.table.snapshot(key).await
    }

    /// Ask the running attempt of `key` to stop
    ///
    /// Returns false when the key is unknown.
    pub async fn cancel(&self, key: &IdempotencyKey) -> bool {
        info!(key = %key, "Cancellation requested");
        self.table.cancel(key).await
    }

    /// Wait for a submitted operation to reach a terminal state
    pub async fn wait(&self, key: &IdempotencyKey) -> Result<OperationHandle> {
        let attempt = self.table.resume(key).await?;
        let record = attempt.record().await;

        if let Some(handle) = finished_handle(&record) {
            return Ok(handle);
        }
        if record.chain_tx.is_none()
            || (record.kind.has_node_leg() && record.node_receipt.is_none())
        {
            return Err(Error::InvalidInput(format!(
                "operation '{}' has unsubmitted steps after {}; retry it with the same key",
                key, record.step
            )));
        }

        let result = self.finish(&attempt, WaitMode::Finalize).await;
        self.conclude(&attempt, result).await
    }

    // ========== Shared steps ==========

    /// Run an idempotent read with bounded retries
    async fn read<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<T>>,
    {
        retry_read(&self.config.read_retry, operation, call)
            .await
            .map_err(|e| read_error(operation, e))
    }

    /// Check that this coordinator's account owns `token_id`
    async fn ensure_owner(&self, token_id: crate::ual::TokenId) -> Result<()> {
        let owner = self.read("get_owner", || self.chain.get_owner(token_id)).await?;
        if &owner != self.chain.account() {
            warn!(token_id = token_id, owner = %owner, "Caller does not own the asset");
            return Err(Error::Unauthorized {
                token_id,
                owner: owner.to_string(),
                caller: self.chain.account().to_string(),
            });
        }
        Ok(())
    }

    /// Record the paid write about to be sent
    async fn mark_pending_write(&self, attempt: &Attempt, write: ChainWrite) -> Result<()> {
        let since_block = self.read("block_number", || self.chain.block_number()).await?;
        debug!(key = %attempt.key(), since_block = since_block, write = ?write, "Sending chain write");
        attempt
            .update(|r| r.pending_write = Some(PendingWrite { write, since_block }))
            .await;
        Ok(())
    }

    /// Keep the pending marker only when the write's outcome is unknown
    async fn settle_sent_write<T>(&self, attempt: &Attempt, result: &GatewayResult<T>) {
        let unknown = matches!(result, Err(e) if e.is_transient());
        if unknown {
            warn!(key = %attempt.key(), "Chain write outcome unknown, it will be looked up on retry");
        } else {
            attempt.update(|r| r.pending_write = None).await;
        }
    }

    /// Resolve a chain write whose response was lost
    ///
    /// Adopts the write when the chain logged it and forgets it when the
    /// chain never saw it, so the caller sends it again. Fails with
    /// `OutcomeUnknown` when the chain cannot be asked.
    async fn resolve_pending_write(&self, attempt: &Attempt) -> Result<()> {
        let record = attempt.record().await;
        let Some(pending) = record.pending_write else {
            return Ok(());
        };
        let key = attempt.key().clone();

        let found = retry_read(&self.config.read_retry, "find_write", || {
            self.chain.find_write(&pending.write, pending.since_block)
        })
        .await
        .map_err(|e| Error::OutcomeUnknown {
            key: key.clone(),
            stage: "chain submission".to_string(),
            reason: e.to_string(),
        })?;

        match found {
            Some(landed) => {
                let ual = Ual::new(
                    self.chain.network(),
                    self.chain.asset_contract().clone(),
                    landed.token_id,
                )?;
                info!(key = %key, tx = %landed.tx, ual = %ual, "Lost chain write found on chain, adopting it");
                attempt
                    .update(|r| {
                        r.pending_write = None;
                        r.chain_tx = Some(landed.tx.clone());
                        r.ual = Some(ual.clone());
                        r.commit(OperationStep::ChainSubmitted);
                    })
                    .await;
            }
            None => {
                info!(key = %key, since_block = pending.since_block, "Lost chain write never reached the chain, sending it again");
                attempt.update(|r| r.pending_write = None).await;
            }
        }
        Ok(())
    }

    /// Drop a chain leg that will never land, giving back any allowance
    /// this attempt raised for it
    async fn abandon_chain_leg(&self, attempt: &Attempt) {
        self.restore_allowance(attempt).await;
        attempt.update(|r| r.reset_chain_leg()).await;
    }

    /// Decide whether a recorded chain write landed
    ///
    /// Returns false when the transaction reverted or vanished, after
    /// clearing the chain leg so the attempt starts over.
    async fn recorded_write_landed(&self, attempt: &Attempt) -> Result<bool> {
        self.resolve_pending_write(attempt).await?;
        let record = attempt.record().await;
        let Some(tx) = record.chain_tx else {
            return Ok(false);
        };

        let status = retry_read(&self.config.read_retry, "get_transaction_status", || {
            self.chain.get_transaction_status(&tx)
        })
        .await;

        match status {
            Ok(crate::gateway::TxStatus::Reverted { reason }) => {
                info!(key = %attempt.key(), tx = %tx, reason = %reason, "Recorded chain write reverted, restarting");
                self.abandon_chain_leg(attempt).await;
                Ok(false)
            }
            Err(GatewayError::NotFound(_)) => {
                info!(key = %attempt.key(), tx = %tx, "Recorded chain write unknown to the chain, restarting");
                self.abandon_chain_leg(attempt).await;
                Ok(false)
            }
            Ok(status) => {
                info!(key = %attempt.key(), tx = %tx, status = ?status, "Resuming after committed chain write");
                Ok(true)
            }
            Err(e) => Err(read_error("get_transaction_status", e)),
        }
    }

    /// Poll a submitted operation to its end, or hand back a handle
    async fn finish(&self, attempt: &Attempt, wait: WaitMode) -> Result<OperationHandle> {
        let key = attempt.key().clone();
        let record = attempt.record().await;
        let chain_tx = record.chain_tx.clone().ok_or_else(|| {
            Error::Other(format!("operation '{}' has no chain transaction", key))
        })?;

        if wait == WaitMode::Submitted {
            attempt
                .update(|r| r.state = Some(FinalizationState::Submitted))
                .await;
            return submitted_handle(&record, FinalizationState::Submitted);
        }

        let target = FinalizationTarget {
            chain_tx,
            node_receipt: record.node_receipt.clone(),
        };
        let report = self.poller.run(&target, attempt.cancel_token()).await;

        if report.abandoned {
            attempt.update(|r| r.state = Some(report.state)).await;
            return Err(Error::Abandoned {
                key,
                step: record.step,
            });
        }

        attempt.update(|r| r.state = Some(report.state)).await;
        match report.state {
            FinalizationState::Finalized => {
                attempt.update(|r| r.commit(OperationStep::Finalized)).await;
                info!(
                    key = %key,
                    kind = %record.kind,
                    ual = ?record.ual.as_ref().map(ToString::to_string),
                    "Operation finalized"
                );
                submitted_handle(&record, FinalizationState::Finalized)
            }
            FinalizationState::Failed => {
                let reason = report
                    .failure_reason()
                    .unwrap_or("definitive rejection")
                    .to_string();
                let step = match report.failure {
                    Some((FailureSource::Chain, _)) => {
                        self.abandon_chain_leg(attempt).await;
                        record.step
                    }
                    _ => {
                        attempt.update(|r| r.reset_node_leg()).await;
                        OperationStep::ChainSubmitted
                    }
                };
                Err(Error::OperationFailed { key, step, reason })
            }
            FinalizationState::TimedOut => Err(Error::Timeout {
                stage: "finalization".to_string(),
                key: Some(key),
                ual: record.ual.as_ref().map(ToString::to_string),
            }),
            other => Err(Error::Other(format!(
                "finalization of '{}' stopped in state {}",
                key, other
            ))),
        }
    }

    /// Record the outcome of an attempt and pass it through
    async fn conclude<T>(&self, attempt: &Attempt, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => attempt.update(|r| r.last_error = None).await,
            Err(e) => {
                warn!(
                    key = %attempt.key(),
                    code = e.code(),
                    error = %e,
                    "Operation attempt failed"
                );
                let message = e.to_string();
                attempt.update(|r| r.last_error = Some(message)).await;
            }
        }
        result
    }
}

/// Handle for an operation that already finalized
fn finished_handle(record: &OperationRecord) -> Option<OperationHandle> {
    if record.is_finalized() {
        record.handle(FinalizationState::Finalized)
    } else {
        None
    }
}

fn submitted_handle(record: &OperationRecord, state: FinalizationState) -> Result<OperationHandle> {
    record.handle(state).ok_or_else(|| {
        Error::Other(format!(
            "operation '{}' is missing its UAL or chain transaction",
            record.key
        ))
    })
}

/// Map a failed read to a domain error
fn read_error(operation: &str, error: GatewayError) -> Error {
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

/// Map a failed chain write to a domain error
fn chain_write_error(key: &IdempotencyKey, step: OperationStep, stage: &str, error: GatewayError) -> Error {
    match error {
        GatewayError::Timeout(_) => Error::Timeout {
            stage: stage.to_string(),
            key: Some(key.clone()),
            ual: None,
        },
        GatewayError::NotFound(what) => Error::NotFound(what),
        other => Error::ChainSubmission {
            key: key.clone(),
            step,
            reason: other.to_string(),
        },
    }
}
