//! Finalization poller
//!
//! Drives one submitted operation to a terminal [`FinalizationState`]. Each
//! tick polls the chain for the transaction's confirmation depth and the node
//! for replication acknowledgements, concurrently. The poller only reads; it
//! never resubmits anything.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::{Backoff, Clock, TokioClock};
use super::state::FinalizationState;
use crate::gateway::{
    ChainGateway, GatewayError, GatewayResult, NodeGateway, NodeReceipt, ReplicationStatus,
    TxHandle, TxStatus, with_deadline,
};

/// Protocol parameters and time bounds for finalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizationConfig {
    /// Confirmation depth a chain transaction needs
    pub required_confirmations: u64,
    /// Node acknowledgements needed when the node does not report completion
    pub min_replicas: u32,
    /// Bound on the whole wait
    pub deadline: Duration,
    /// Poll interval schedule
    pub backoff: Backoff,
    /// Deadline for each status read
    pub call_timeout: Duration,
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            required_confirmations: 1,
            min_replicas: 3,
            deadline: Duration::from_secs(300),
            backoff: Backoff::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// What the poller waits on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationTarget {
    pub chain_tx: TxHandle,
    /// Absent for chain-only operations
    pub node_receipt: Option<NodeReceipt>,
}

impl FinalizationTarget {
    pub fn chain_only(chain_tx: TxHandle) -> Self {
        Self {
            chain_tx,
            node_receipt: None,
        }
    }

    pub fn with_receipt(chain_tx: TxHandle, receipt: NodeReceipt) -> Self {
        Self {
            chain_tx,
            node_receipt: Some(receipt),
        }
    }
}

/// Which side definitively refused the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    /// The transaction reverted; nothing was committed on chain
    Chain,
    /// The node network refused the content
    Node,
}

/// How a polling run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationReport {
    /// Last state reached
    pub state: FinalizationState,
    /// Every state entered, in order, starting with `Submitted`
    pub transitions: Vec<FinalizationState>,
    pub confirmations: u64,
    pub acknowledged: u32,
    pub ticks: u32,
    pub failure: Option<(FailureSource, String)>,
    /// Polling stopped because the caller cancelled
    pub abandoned: bool,
}

impl FinalizationReport {
    fn new() -> Self {
        Self {
            state: FinalizationState::Submitted,
            transitions: vec![FinalizationState::Submitted],
            confirmations: 0,
            acknowledged: 0,
            ticks: 0,
            failure: None,
            abandoned: false,
        }
    }

    fn enter(&mut self, state: FinalizationState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Finalization state transition");
            self.state = state;
            self.transitions.push(state);
        }
    }

    fn fail(&mut self, source: FailureSource, reason: String) {
        self.failure = Some((source, reason));
        self.enter(FinalizationState::Failed);
    }

    pub fn is_finalized(&self) -> bool {
        self.state == FinalizationState::Finalized
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_ref().map(|(_, reason)| reason.as_str())
    }
}

/// Progress signal from one side during one tick
enum Signal {
    Done,
    Waiting,
    Rejected(String),
}

/// Bounded polling state machine over both gateways
#[derive(Clone)]
pub struct FinalizationPoller {
    chain: Arc<dyn ChainGateway>,
    node: Arc<dyn NodeGateway>,
    config: FinalizationConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FinalizationPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizationPoller")
            .field("config", &self.config)
            .finish()
    }
}

impl FinalizationPoller {
    pub fn new(
        chain: Arc<dyn ChainGateway>,
        node: Arc<dyn NodeGateway>,
        config: FinalizationConfig,
    ) -> Self {
        Self {
            chain,
            node,
            config,
            clock: Arc::new(TokioClock),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &FinalizationConfig {
        &self.config
    }

    /// Poll until the target reaches a terminal state, the deadline passes,
    /// or `cancel` fires
    pub async fn run(
        &self,
        target: &FinalizationTarget,
        cancel: &CancellationToken,
    ) -> FinalizationReport {
        let started = self.clock.now();
        let deadline = started + self.config.deadline;
        let mut report = FinalizationReport::new();
        let mut chain_done = false;
        let mut node_done = target.node_receipt.is_none();

        loop {
            if cancel.is_cancelled() {
                return self.abandon(report, target);
            }

            report.ticks += 1;

            // No single read may outlive the deadline
            let budget = self
                .config
                .call_timeout
                .min(deadline.saturating_duration_since(self.clock.now()));
            let chain_poll = async {
                if chain_done {
                    None
                } else {
                    Some(self.poll_chain(&target.chain_tx, budget).await)
                }
            };
            let node_poll = async {
                match (&target.node_receipt, node_done) {
                    (Some(receipt), false) => Some(self.poll_node(receipt, budget).await),
                    _ => None,
                }
            };
            let (chain_result, node_result) = tokio::join!(chain_poll, node_poll);

            if let Some(result) = chain_result {
                match self.chain_signal(result, &mut report) {
                    Signal::Done => chain_done = true,
                    Signal::Waiting => {}
                    Signal::Rejected(reason) => {
                        warn!(tx = %target.chain_tx, reason = %reason, "Chain transaction reverted");
                        report.fail(FailureSource::Chain, reason);
                        return report;
                    }
                }
            }

            if let Some(result) = node_result {
                match self.node_signal(result, &mut report) {
                    Signal::Done => node_done = true,
                    Signal::Waiting => {}
                    Signal::Rejected(reason) => {
                        warn!(tx = %target.chain_tx, reason = %reason, "Node rejected assertion");
                        report.fail(FailureSource::Node, reason);
                        return report;
                    }
                }
            }

            if chain_done {
                report.enter(FinalizationState::ChainConfirmed);
                if node_done {
                    if target.node_receipt.is_some() {
                        report.enter(FinalizationState::NodeReplicated);
                    }
                    report.enter(FinalizationState::Finalized);
                    info!(
                        tx = %target.chain_tx,
                        ticks = report.ticks,
                        confirmations = report.confirmations,
                        acknowledged = report.acknowledged,
                        "Operation finalized"
                    );
                    return report;
                }
            }

            let now = self.clock.now();
            if now >= deadline {
                warn!(
                    tx = %target.chain_tx,
                    state = %report.state,
                    waited_ms = (now - started).as_millis() as u64,
                    "Finalization deadline reached"
                );
                report.enter(FinalizationState::TimedOut);
                return report;
            }

            let delay = self.config.backoff.delay(report.ticks).min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return self.abandon(report, target),
                _ = self.clock.sleep(delay) => {}
            }
        }
    }

    fn abandon(&self, mut report: FinalizationReport, target: &FinalizationTarget) -> FinalizationReport {
        info!(tx = %target.chain_tx, state = %report.state, "Finalization polling abandoned");
        report.abandoned = true;
        report
    }

    async fn poll_chain(&self, tx: &TxHandle, budget: Duration) -> GatewayResult<TxStatus> {
        with_deadline(budget, self.chain.get_transaction_status(tx)).await
    }

    async fn poll_node(&self, receipt: &NodeReceipt, budget: Duration) -> GatewayResult<ReplicationStatus> {
        with_deadline(budget, self.node.get_replication_status(receipt)).await
    }

    fn chain_signal(&self, result: GatewayResult<TxStatus>, report: &mut FinalizationReport) -> Signal {
        match result {
            Ok(TxStatus::Confirmed { confirmations }) => {
                report.confirmations = confirmations;
                if confirmations >= self.config.required_confirmations {
                    Signal::Done
                } else {
                    Signal::Waiting
                }
            }
            Ok(TxStatus::Pending) => Signal::Waiting,
            Ok(TxStatus::Reverted { reason }) => Signal::Rejected(reason),
            Err(GatewayError::Rejected(reason)) => Signal::Rejected(reason),
            Err(e) => {
                debug!(error = %e, "Chain status read made no progress");
                Signal::Waiting
            }
        }
    }

    fn node_signal(
        &self,
        result: GatewayResult<ReplicationStatus>,
        report: &mut FinalizationReport,
    ) -> Signal {
        match result {
            Ok(status) => {
                if let Some(reason) = status.rejected {
                    return Signal::Rejected(reason);
                }
                report.acknowledged = status.acknowledged;
                if status.complete || status.acknowledged >= self.config.min_replicas {
                    Signal::Done
                } else {
                    Signal::Waiting
                }
            }
            Err(GatewayError::Rejected(reason)) => Signal::Rejected(reason),
            Err(e) => {
                debug!(error = %e, "Replication status read made no progress");
                Signal::Waiting
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::{Graph, normalize};
    use crate::gateway::memory::InMemoryNetwork;
    use crate::gateway::{AssetCreation, ChainGateway, NodeGateway};
    use crate::ual::{Address, Ual};

    const NQUADS: &str = "<urn:a> <http://schema.org/name> \"Alice\" .\n";

    fn account() -> Address {
        Address::parse("0x00000000000000000000000000000000000000a1").unwrap()
    }

    fn config() -> FinalizationConfig {
        FinalizationConfig {
            required_confirmations: 1,
            min_replicas: 3,
            deadline: Duration::from_secs(60),
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 2),
            call_timeout: Duration::from_secs(5),
        }
    }

    async fn submitted(network: &InMemoryNetwork) -> FinalizationTarget {
        let chain = network.chain(account());
        let node = network.node();
        let assertion = normalize(&Graph::NQuads(NQUADS.to_string())).unwrap();
        network.seed_allowance(&account(), 100).await;

        let (tx, token_id) = chain
            .create_asset(&AssetCreation {
                digest: assertion.digest().clone(),
                metadata: assertion.metadata(),
                token_amount: 10,
                epochs: 2,
            })
            .await
            .unwrap();
        let ual = Ual::new(chain.network(), chain.asset_contract().clone(), token_id).unwrap();
        let receipt = node.submit_assertion(&ual, &assertion).await.unwrap();
        FinalizationTarget::with_receipt(tx, receipt)
    }

    fn poller(network: &InMemoryNetwork) -> FinalizationPoller {
        FinalizationPoller::new(
            Arc::new(network.chain(account())),
            Arc::new(network.node()),
            config(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_finalized_through_every_state() {
        let network = InMemoryNetwork::builder().replica_count(3).acks_per_poll(1).build();
        let target = submitted(&network).await;

        let report = poller(&network).run(&target, &CancellationToken::new()).await;

        assert!(report.is_finalized());
        assert_eq!(
            report.transitions,
            vec![
                FinalizationState::Submitted,
                FinalizationState::ChainConfirmed,
                FinalizationState::NodeReplicated,
                FinalizationState::Finalized,
            ]
        );
        assert_eq!(report.acknowledged, 3);
        assert_eq!(report.ticks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_only_skips_replication() {
        let network = InMemoryNetwork::builder().build();
        let target = submitted(&network).await;

        let report = poller(&network)
            .run(&FinalizationTarget::chain_only(target.chain_tx), &CancellationToken::new())
            .await;

        assert_eq!(
            report.transitions,
            vec![
                FinalizationState::Submitted,
                FinalizationState::ChainConfirmed,
                FinalizationState::Finalized,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_replication_times_out() {
        let network = InMemoryNetwork::builder().build();
        let target = submitted(&network).await;
        network.stall_replication(true).await;

        let start = tokio::time::Instant::now();
        let report = poller(&network).run(&target, &CancellationToken::new()).await;

        assert_eq!(report.state, FinalizationState::TimedOut);
        assert!(report.transitions.contains(&FinalizationState::ChainConfirmed));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(70));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_status_read_cannot_outlast_deadline() {
        let network = InMemoryNetwork::builder().build();
        let target = submitted(&network).await;
        network.hang_status_reads(true).await;
        let config = FinalizationConfig {
            deadline: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            ..config()
        };
        let poller = FinalizationPoller::new(
            Arc::new(network.chain(account())),
            Arc::new(network.node()),
            config,
        );

        let start = tokio::time::Instant::now();
        let report = poller.run(&target, &CancellationToken::new()).await;

        assert_eq!(report.state, FinalizationState::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_transaction_fails_immediately() {
        let network = InMemoryNetwork::builder().build();
        network.revert_next_tx("out of gas").await;
        let target = submitted(&network).await;

        let report = poller(&network).run(&target, &CancellationToken::new()).await;

        assert_eq!(report.state, FinalizationState::Failed);
        assert_eq!(report.failure, Some((FailureSource::Chain, "out of gas".to_string())));
        assert_eq!(report.ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_reads_count_as_no_progress() {
        let network = InMemoryNetwork::builder().replica_count(1).build();
        let target = submitted(&network).await;
        network.fail_next_reads(2).await;

        let report = poller(&network).run(&target, &CancellationToken::new()).await;

        assert!(report.is_finalized());
        assert!(report.ticks >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_without_terminal_state() {
        let network = InMemoryNetwork::builder().build();
        let target = submitted(&network).await;
        network.stall_replication(true).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let report = poller(&network).run(&target, &cancel).await;

        assert!(report.abandoned);
        assert!(!report.state.is_terminal());
    }
}
