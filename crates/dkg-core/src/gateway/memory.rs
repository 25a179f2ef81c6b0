//! In-memory chain and node network
//!
//! [`InMemoryNetwork`] simulates both halves of the network in one process:
//! a ledger with allowances, assets and transactions, and a node network that
//! stores content and reports replication progress. Handles returned by
//! [`InMemoryNetwork::chain`] and [`InMemoryNetwork::node`] share the same
//! state, so several clients (and several accounts) can race against it.
//!
//! Every call is recorded in a call log, and faults can be injected to
//! exercise partial failures: stalled replication, failing submissions,
//! transient read errors, reverted transactions and tampered content.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    Amount, AssetCreation, AssetRecord, AssetUpdate, Bid, BidRange, BidRequest, ChainGateway,
    ChainWrite, GatewayError, GatewayResult, LandedWrite, NodeGateway, NodeReceipt,
    ReplicationStatus, TxHandle, TxStatus, UalStream,
};
use crate::assertion::{Assertion, AssertionDigest};
use crate::ual::{Address, TokenId, Ual};

const DEFAULT_NETWORK: &str = "hardhat1:31337";
const DEFAULT_CONTRACT: &str = "0x5cac41237127f94c2d21dae0b14bfefa99880630";
const LOST_RESPONSE: Duration = Duration::from_secs(30);

/// A call received by the simulated network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetAllowance { owner: Address },
    SetAllowance { account: Address, amount: Amount },
    IncreaseAllowance { account: Address, delta: Amount },
    DecreaseAllowance { account: Address, delta: Amount },
    CreateAsset { account: Address, digest: AssertionDigest, token_amount: Amount },
    UpdateAsset { account: Address, token_id: TokenId, digest: AssertionDigest },
    TransferAsset { account: Address, token_id: TokenId, new_owner: Address },
    BurnAsset { account: Address, token_id: TokenId },
    AddTokens { account: Address, token_id: TokenId, amount: Amount },
    ExtendStorage { account: Address, token_id: TokenId, epochs: u64, amount: Amount },
    GetOwner { token_id: TokenId },
    GetAssetState { token_id: TokenId },
    GetAssetRecord { token_id: TokenId },
    GetTransactionStatus { tx: TxHandle },
    CurrentEpoch,
    BlockNumber,
    FindWrite { write: ChainWrite, since: u64 },
    EstimateBid { size_bytes: u64, epochs: u64 },
    SubmitAssertion { token_id: TokenId, digest: AssertionDigest },
    GetReplicationStatus { receipt: NodeReceipt },
    FetchAssertion { token_id: TokenId, digest: AssertionDigest },
    SearchTopic { pattern: String },
}

impl Call {
    /// Whether the call changes chain state
    pub fn is_chain_write(&self) -> bool {
        matches!(
            self,
            Self::SetAllowance { .. }
                | Self::IncreaseAllowance { .. }
                | Self::DecreaseAllowance { .. }
                | Self::CreateAsset { .. }
                | Self::UpdateAsset { .. }
                | Self::TransferAsset { .. }
                | Self::BurnAsset { .. }
                | Self::AddTokens { .. }
                | Self::ExtendStorage { .. }
        )
    }

    /// Whether the call changes chain or node state
    pub fn is_write(&self) -> bool {
        self.is_chain_write() || matches!(self, Self::SubmitAssertion { .. })
    }
}

#[derive(Debug, Clone)]
struct Settings {
    network: String,
    contract: Address,
    latency: Duration,
    confirm_after_polls: u32,
    acks_per_poll: u32,
    replica_count: u32,
    price_per_kib_epoch: Amount,
    fixed_bid: Option<Amount>,
}

#[derive(Debug, Default)]
struct Faults {
    stall_replication: bool,
    failing_node_submissions: u32,
    failing_reads: u32,
    bid_rejection: Option<String>,
    next_revert: Option<String>,
    next_asset_revert: Option<String>,
    next_submission_rejection: Option<String>,
    next_submission_refusal: Option<String>,
    /// Lose the next asset write's response; `true` once the write applied
    write_timeout: Option<bool>,
    hang_status_reads: bool,
}

#[derive(Debug, Clone)]
struct StoredAsset {
    owner: Address,
    history: Vec<AssertionDigest>,
    state_size_bytes: u64,
    end_epoch: u64,
    token_balance: Amount,
    burned: bool,
}

#[derive(Debug)]
struct StoredTx {
    block: u64,
    sender: Address,
    /// Asset write this transaction carries, with the token it touched
    logged: Option<(ChainWrite, TokenId)>,
    polls: u32,
    reverted: Option<String>,
}

#[derive(Debug)]
struct StoredReceipt {
    polls: u32,
    rejected: Option<String>,
}

#[derive(Debug)]
struct NetworkState {
    epoch: u64,
    allowances: HashMap<Address, Amount>,
    assets: BTreeMap<TokenId, StoredAsset>,
    next_token_id: TokenId,
    transactions: HashMap<TxHandle, StoredTx>,
    tx_counter: u64,
    content: HashMap<(TokenId, AssertionDigest), Vec<String>>,
    receipts: HashMap<NodeReceipt, StoredReceipt>,
    tampered: HashMap<TokenId, Vec<String>>,
    faults: Faults,
    calls: Vec<Call>,
}

impl NetworkState {
    fn new() -> Self {
        Self {
            epoch: 0,
            allowances: HashMap::new(),
            assets: BTreeMap::new(),
            next_token_id: 1,
            transactions: HashMap::new(),
            tx_counter: 0,
            content: HashMap::new(),
            receipts: HashMap::new(),
            tampered: HashMap::new(),
            faults: Faults::default(),
            calls: Vec::new(),
        }
    }

    /// Consume one injected transient read failure, if any
    fn read_fault(&mut self) -> GatewayResult<()> {
        if self.faults.failing_reads > 0 {
            self.faults.failing_reads -= 1;
            return Err(GatewayError::Transient("simulated read failure".to_string()));
        }
        Ok(())
    }

    /// Record a new transaction in its own block; a pending revert fault
    /// applies to it
    fn new_tx(&mut self, sender: &Address, logged: Option<(ChainWrite, TokenId)>) -> (TxHandle, Option<String>) {
        self.tx_counter += 1;
        let handle = TxHandle(format!("0x{:064x}", self.tx_counter));
        let mut reverted = self.faults.next_revert.take();
        if reverted.is_none() && logged.is_some() {
            reverted = self.faults.next_asset_revert.take();
        }
        self.transactions.insert(
            handle.clone(),
            StoredTx {
                block: self.tx_counter,
                sender: sender.clone(),
                logged,
                polls: 0,
                reverted: reverted.clone(),
            },
        );
        (handle, reverted)
    }

    /// Consume an injected lost response on one side of an asset write
    fn write_timeout(&mut self, applied: bool) -> GatewayResult<()> {
        if self.faults.write_timeout == Some(applied) {
            self.faults.write_timeout = None;
            return Err(GatewayError::Timeout(LOST_RESPONSE));
        }
        Ok(())
    }

    fn live_asset(&self, token_id: TokenId) -> GatewayResult<&StoredAsset> {
        match self.assets.get(&token_id) {
            Some(asset) if !asset.burned => Ok(asset),
            _ => Err(GatewayError::NotFound(format!("token {}", token_id))),
        }
    }

    fn owned_asset(&mut self, token_id: TokenId, account: &Address) -> GatewayResult<&mut StoredAsset> {
        self.live_asset(token_id)?;
        let asset = self
            .assets
            .get_mut(&token_id)
            .ok_or_else(|| GatewayError::NotFound(format!("token {}", token_id)))?;
        if &asset.owner != account {
            return Err(GatewayError::Rejected(format!(
                "{} is not the owner of token {}",
                account, token_id
            )));
        }
        Ok(asset)
    }

    /// Take `amount` from the account's allowance
    fn spend(&mut self, account: &Address, amount: Amount) -> GatewayResult<()> {
        let allowance = self.allowances.entry(account.clone()).or_insert(0);
        if *allowance < amount {
            return Err(GatewayError::Rejected(format!(
                "insufficient allowance: {} required, {} approved",
                amount, allowance
            )));
        }
        *allowance -= amount;
        Ok(())
    }
}

impl StoredAsset {
    fn record(&self, token_id: TokenId) -> GatewayResult<AssetRecord> {
        let state = self
            .history
            .last()
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("token {} has no state", token_id)))?;
        Ok(AssetRecord {
            token_id,
            owner: self.owner.clone(),
            state,
            history: self.history.clone(),
            state_size_bytes: self.state_size_bytes,
            end_epoch: self.end_epoch,
            token_balance: self.token_balance,
        })
    }
}

struct Shared {
    settings: Settings,
    state: Mutex<NetworkState>,
}

impl Shared {
    async fn pause(&self) {
        if !self.settings.latency.is_zero() {
            tokio::time::sleep(self.settings.latency).await;
        }
    }

    fn ual(&self, token_id: TokenId) -> Option<Ual> {
        Ual::new(&self.settings.network, self.settings.contract.clone(), token_id).ok()
    }
}

/// Builder for an [`InMemoryNetwork`]
#[derive(Debug, Clone)]
pub struct InMemoryNetworkBuilder {
    settings: Settings,
}

impl Default for InMemoryNetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNetworkBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings {
                network: DEFAULT_NETWORK.to_string(),
                contract: Address::parse(DEFAULT_CONTRACT).unwrap_or_else(|_| Address::zero()),
                latency: Duration::ZERO,
                confirm_after_polls: 1,
                acks_per_poll: 1,
                replica_count: 3,
                price_per_kib_epoch: 1,
                fixed_bid: None,
            },
        }
    }

    /// Network identifier used in UALs
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.settings.network = network.into();
        self
    }

    pub fn contract(mut self, contract: Address) -> Self {
        self.settings.contract = contract;
        self
    }

    /// Delay applied to every call before it touches state
    pub fn latency(mut self, latency: Duration) -> Self {
        self.settings.latency = latency;
        self
    }

    /// Status polls before a transaction reports its first confirmation
    pub fn confirm_after_polls(mut self, polls: u32) -> Self {
        self.settings.confirm_after_polls = polls.max(1);
        self
    }

    /// Node acknowledgements gained per replication status poll
    pub fn acks_per_poll(mut self, acks: u32) -> Self {
        self.settings.acks_per_poll = acks;
        self
    }

    /// Acknowledgements after which the node reports completion
    pub fn replica_count(mut self, replicas: u32) -> Self {
        self.settings.replica_count = replicas;
        self
    }

    pub fn price_per_kib_epoch(mut self, price: Amount) -> Self {
        self.settings.price_per_kib_epoch = price;
        self
    }

    /// Quote this amount for every low-range bid
    pub fn fixed_bid(mut self, amount: Amount) -> Self {
        self.settings.fixed_bid = Some(amount);
        self
    }

    pub fn build(self) -> InMemoryNetwork {
        InMemoryNetwork {
            shared: Arc::new(Shared {
                settings: self.settings,
                state: Mutex::new(NetworkState::new()),
            }),
        }
    }
}

/// Shared simulated network; clone freely
#[derive(Clone)]
pub struct InMemoryNetwork {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("network", &self.shared.settings.network)
            .field("latency", &self.shared.settings.latency)
            .finish()
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        InMemoryNetworkBuilder::new().build()
    }
}

impl InMemoryNetwork {
    pub fn builder() -> InMemoryNetworkBuilder {
        InMemoryNetworkBuilder::new()
    }

    /// Chain handle signing as `account`
    pub fn chain(&self, account: Address) -> InMemoryChain {
        InMemoryChain {
            account,
            shared: self.shared.clone(),
        }
    }

    pub fn node(&self) -> InMemoryNode {
        InMemoryNode {
            shared: self.shared.clone(),
        }
    }

    // ========== Inspection ==========

    /// Every call received so far, in arrival order
    pub async fn calls(&self) -> Vec<Call> {
        self.shared.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.shared.state.lock().await.calls.clear();
    }

    pub async fn allowance_of(&self, account: &Address) -> Amount {
        let state = self.shared.state.lock().await;
        state.allowances.get(account).copied().unwrap_or(0)
    }

    /// Current on-chain record of a live asset
    pub async fn asset(&self, token_id: TokenId) -> Option<AssetRecord> {
        let state = self.shared.state.lock().await;
        state.live_asset(token_id).ok()?.record(token_id).ok()
    }

    // ========== Seeding ==========

    /// Set an allowance directly, without a transaction
    pub async fn seed_allowance(&self, account: &Address, amount: Amount) {
        let mut state = self.shared.state.lock().await;
        state.allowances.insert(account.clone(), amount);
    }

    pub async fn advance_epoch(&self, epochs: u64) {
        self.shared.state.lock().await.epoch += epochs;
    }

    // ========== Faults ==========

    /// Nodes stop acknowledging replication
    pub async fn stall_replication(&self, stalled: bool) {
        self.shared.state.lock().await.faults.stall_replication = stalled;
    }

    /// The next `count` assertion submissions fail transiently
    pub async fn fail_next_node_submissions(&self, count: u32) {
        self.shared.state.lock().await.faults.failing_node_submissions = count;
    }

    /// The next submission is definitively refused
    pub async fn reject_next_submission(&self, reason: impl Into<String>) {
        self.shared.state.lock().await.faults.next_submission_rejection = Some(reason.into());
    }

    /// The next submission call is refused outright, before any receipt
    pub async fn refuse_next_submission(&self, reason: impl Into<String>) {
        self.shared.state.lock().await.faults.next_submission_refusal = Some(reason.into());
    }

    /// The next asset write times out
    ///
    /// With `applied` the write takes effect on chain and only its response
    /// is lost; otherwise it never reaches the chain.
    pub async fn time_out_next_write(&self, applied: bool) {
        self.shared.state.lock().await.faults.write_timeout = Some(applied);
    }

    /// Transaction status reads never answer while set
    pub async fn hang_status_reads(&self, hang: bool) {
        self.shared.state.lock().await.faults.hang_status_reads = hang;
    }

    /// The next `count` reads of either side fail transiently
    pub async fn fail_next_reads(&self, count: u32) {
        self.shared.state.lock().await.faults.failing_reads = count;
    }

    /// Refuse every bid estimate while set
    pub async fn reject_bids(&self, reason: Option<String>) {
        self.shared.state.lock().await.faults.bid_rejection = reason;
    }

    /// The next transaction is accepted but reverts without effect
    pub async fn revert_next_tx(&self, reason: impl Into<String>) {
        self.shared.state.lock().await.faults.next_revert = Some(reason.into());
    }

    /// The next asset write (not an allowance write) reverts without effect
    pub async fn revert_next_asset_write(&self, reason: impl Into<String>) {
        self.shared.state.lock().await.faults.next_asset_revert = Some(reason.into());
    }

    /// Nodes serve these lines for the token instead of what was stored
    pub async fn tamper_content(&self, token_id: TokenId, lines: Vec<String>) {
        self.shared.state.lock().await.tampered.insert(token_id, lines);
    }
}

/// Chain handle bound to one signing account
#[derive(Clone)]
pub struct InMemoryChain {
    account: Address,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChain")
            .field("account", &self.account)
            .field("network", &self.shared.settings.network)
            .finish()
    }
}

#[async_trait]
impl ChainGateway for InMemoryChain {
    fn account(&self) -> &Address {
        &self.account
    }

    fn network(&self) -> &str {
        &self.shared.settings.network
    }

    fn asset_contract(&self) -> &Address {
        &self.shared.settings.contract
    }

    async fn get_allowance(&self, owner: &Address) -> GatewayResult<Amount> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::GetAllowance { owner: owner.clone() });
        state.read_fault()?;
        Ok(state.allowances.get(owner).copied().unwrap_or(0))
    }

    async fn set_allowance(&self, amount: Amount) -> GatewayResult<TxHandle> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::SetAllowance {
            account: self.account.clone(),
            amount,
        });
        let (tx, reverted) = state.new_tx(&self.account, None);
        if reverted.is_none() {
            state.allowances.insert(self.account.clone(), amount);
        }
        Ok(tx)
    }

    async fn increase_allowance(&self, delta: Amount) -> GatewayResult<TxHandle> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::IncreaseAllowance {
            account: self.account.clone(),
            delta,
        });
        let (tx, reverted) = state.new_tx(&self.account, None);
        if reverted.is_none() {
            let allowance = state.allowances.entry(self.account.clone()).or_insert(0);
            *allowance = allowance.saturating_add(delta);
        }
        Ok(tx)
    }

    async fn decrease_allowance(&self, delta: Amount) -> GatewayResult<TxHandle> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::DecreaseAllowance {
            account: self.account.clone(),
            delta,
        });
        let current = state.allowances.get(&self.account).copied().unwrap_or(0);
        if delta > current {
            return Err(GatewayError::Rejected(format!(
                "decrease of {} exceeds allowance {}",
                delta, current
            )));
        }
        let (tx, reverted) = state.new_tx(&self.account, None);
        if reverted.is_none() {
            state.allowances.insert(self.account.clone(), current - delta);
        }
        Ok(tx)
    }

    async fn create_asset(&self, request: &AssetCreation) -> GatewayResult<(TxHandle, TokenId)> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::CreateAsset {
            account: self.account.clone(),
            digest: request.digest.clone(),
            token_amount: request.token_amount,
        });

        state.write_timeout(false)?;
        if request.epochs == 0 {
            return Err(GatewayError::Rejected("epochs must be positive".to_string()));
        }
        state.spend(&self.account, request.token_amount)?;

        let token_id = state.next_token_id;
        state.next_token_id += 1;
        let write = ChainWrite::Create {
            digest: request.digest.clone(),
        };
        let (tx, reverted) = state.new_tx(&self.account, Some((write, token_id)));

        match reverted {
            Some(_) => {
                // Reverted transactions spend nothing
                let allowance = state.allowances.entry(self.account.clone()).or_insert(0);
                *allowance += request.token_amount;
            }
            None => {
                let end_epoch = state.epoch + request.epochs;
                state.assets.insert(
                    token_id,
                    StoredAsset {
                        owner: self.account.clone(),
                        history: vec![request.digest.clone()],
                        state_size_bytes: request.metadata.size_bytes,
                        end_epoch,
                        token_balance: request.token_amount,
                        burned: false,
                    },
                );
                debug!(token_id = token_id, tx = %tx, "Simulated asset created");
            }
        }

        state.write_timeout(true)?;
        Ok((tx, token_id))
    }

    async fn update_asset(&self, token_id: TokenId, request: &AssetUpdate) -> GatewayResult<TxHandle> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::UpdateAsset {
            account: self.account.clone(),
            token_id,
            digest: request.digest.clone(),
        });
        state.write_timeout(false)?;

        let current = state.owned_asset(token_id, &self.account)?.history.last().cloned();
        if current.as_ref() != Some(&request.expected_state) {
            return Err(GatewayError::Conflict(format!(
                "token {} state is {}, expected {}",
                token_id,
                current.map(|d| d.to_string()).unwrap_or_default(),
                request.expected_state
            )));
        }
        state.spend(&self.account, request.token_amount)?;

        let write = ChainWrite::Update {
            token_id,
            digest: request.digest.clone(),
        };
        let (tx, reverted) = state.new_tx(&self.account, Some((write, token_id)));
        if reverted.is_some() {
            let allowance = state.allowances.entry(self.account.clone()).or_insert(0);
            *allowance += request.token_amount;
            return Ok(tx);
        }

        let asset = state.owned_asset(token_id, &self.account)?;
        asset.history.push(request.digest.clone());
        asset.state_size_bytes = request.metadata.size_bytes;
        asset.token_balance += request.token_amount;
        state.write_timeout(true)?;
        Ok(tx)
    }

    async fn transfer_asset(&self, token_id: TokenId, new_owner: &Address) -> GatewayResult<TxHandle> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::TransferAsset {
            account: self.account.clone(),
            token_id,
            new_owner: new_owner.clone(),
        });
        state.write_timeout(false)?;

        state.owned_asset(token_id, &self.account)?;
        let write = ChainWrite::Transfer {
            token_id,
            new_owner: new_owner.clone(),
        };
        let (tx, reverted) = state.new_tx(&self.account, Some((write, token_id)));
        if reverted.is_none() {
            state.owned_asset(token_id, &self.account)?.owner = new_owner.clone();
        }
        state.write_timeout(true)?;
        Ok(tx)
    }

    async fn burn_asset(&self, token_id: TokenId) -> GatewayResult<TxHandle> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::BurnAsset {
            account: self.account.clone(),
            token_id,
        });
        state.write_timeout(false)?;

        state.owned_asset(token_id, &self.account)?;
        let (tx, reverted) = state.new_tx(&self.account, Some((ChainWrite::Burn { token_id }, token_id)));
        if reverted.is_none() {
            state.owned_asset(token_id, &self.account)?.burned = true;
        }
        state.write_timeout(true)?;
        Ok(tx)
    }

    async fn add_tokens(&self, token_id: TokenId, amount: Amount) -> GatewayResult<TxHandle> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::AddTokens {
            account: self.account.clone(),
            token_id,
            amount,
        });
        state.write_timeout(false)?;

        state.live_asset(token_id)?;
        state.spend(&self.account, amount)?;
        let write = ChainWrite::AddTokens { token_id, amount };
        let (tx, reverted) = state.new_tx(&self.account, Some((write, token_id)));
        match reverted {
            Some(_) => {
                *state.allowances.entry(self.account.clone()).or_insert(0) += amount;
            }
            None => {
                if let Some(asset) = state.assets.get_mut(&token_id) {
                    asset.token_balance += amount;
                }
            }
        }
        state.write_timeout(true)?;
        Ok(tx)
    }

    async fn extend_storage(
        &self,
        token_id: TokenId,
        epochs: u64,
        amount: Amount,
    ) -> GatewayResult<TxHandle> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::ExtendStorage {
            account: self.account.clone(),
            token_id,
            epochs,
            amount,
        });
        state.write_timeout(false)?;

        state.live_asset(token_id)?;
        state.spend(&self.account, amount)?;
        let write = ChainWrite::ExtendStorage {
            token_id,
            epochs,
            amount,
        };
        let (tx, reverted) = state.new_tx(&self.account, Some((write, token_id)));
        match reverted {
            Some(_) => {
                *state.allowances.entry(self.account.clone()).or_insert(0) += amount;
            }
            None => {
                if let Some(asset) = state.assets.get_mut(&token_id) {
                    asset.end_epoch += epochs;
                    asset.token_balance += amount;
                }
            }
        }
        state.write_timeout(true)?;
        Ok(tx)
    }

    async fn get_owner(&self, token_id: TokenId) -> GatewayResult<Address> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::GetOwner { token_id });
        state.read_fault()?;
        Ok(state.live_asset(token_id)?.owner.clone())
    }

    async fn get_asset_state(&self, token_id: TokenId) -> GatewayResult<AssertionDigest> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::GetAssetState { token_id });
        state.read_fault()?;
        state
            .live_asset(token_id)?
            .history
            .last()
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("token {} has no state", token_id)))
    }

    async fn get_asset_record(&self, token_id: TokenId) -> GatewayResult<AssetRecord> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::GetAssetRecord { token_id });
        state.read_fault()?;
        state.live_asset(token_id)?.record(token_id)
    }

    async fn get_transaction_status(&self, tx: &TxHandle) -> GatewayResult<TxStatus> {
        self.shared.pause().await;
        let hang = {
            let mut state = self.shared.state.lock().await;
            state.calls.push(Call::GetTransactionStatus { tx: tx.clone() });
            state.faults.hang_status_reads
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.shared.state.lock().await;
        state.read_fault()?;

        let confirm_after = self.shared.settings.confirm_after_polls;
        let stored = state
            .transactions
            .get_mut(tx)
            .ok_or_else(|| GatewayError::NotFound(format!("transaction {}", tx)))?;

        if let Some(reason) = &stored.reverted {
            return Ok(TxStatus::Reverted {
                reason: reason.clone(),
            });
        }

        stored.polls += 1;
        if stored.polls >= confirm_after {
            Ok(TxStatus::Confirmed {
                confirmations: u64::from(stored.polls - confirm_after + 1),
            })
        } else {
            Ok(TxStatus::Pending)
        }
    }

    async fn current_epoch(&self) -> GatewayResult<u64> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::CurrentEpoch);
        state.read_fault()?;
        Ok(state.epoch)
    }

    async fn block_number(&self) -> GatewayResult<u64> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::BlockNumber);
        state.read_fault()?;
        Ok(state.tx_counter)
    }

    async fn find_write(&self, write: &ChainWrite, since: u64) -> GatewayResult<Option<LandedWrite>> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::FindWrite {
            write: write.clone(),
            since,
        });
        state.read_fault()?;

        Ok(state
            .transactions
            .iter()
            .filter(|(_, stored)| stored.block > since && stored.sender == self.account)
            .filter_map(|(tx, stored)| match &stored.logged {
                Some((logged, token_id)) if logged == write => Some((stored.block, tx, *token_id)),
                _ => None,
            })
            .min_by_key(|(block, _, _)| *block)
            .map(|(_, tx, token_id)| LandedWrite {
                tx: tx.clone(),
                token_id,
            }))
    }
}

/// Node handle on the simulated network
#[derive(Clone)]
pub struct InMemoryNode {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNode").finish()
    }
}

#[async_trait]
impl NodeGateway for InMemoryNode {
    async fn estimate_bid(&self, request: &BidRequest) -> GatewayResult<Bid> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::EstimateBid {
            size_bytes: request.size_bytes,
            epochs: request.epochs,
        });
        state.read_fault()?;

        if let Some(reason) = &state.faults.bid_rejection {
            return Err(GatewayError::Rejected(reason.clone()));
        }

        let settings = &self.shared.settings;
        let base = match settings.fixed_bid {
            Some(amount) => amount,
            None => {
                let kib = Amount::from(request.size_bytes.div_ceil(1024).max(1));
                (kib * Amount::from(request.epochs) * settings.price_per_kib_epoch).max(1)
            }
        };
        let amount = match request.range {
            BidRange::Low => base,
            BidRange::Medium => base + base / 2,
            BidRange::High => base * 2,
        };

        Ok(Bid {
            amount,
            size_bytes: request.size_bytes,
            epochs: request.epochs,
        })
    }

    async fn submit_assertion(&self, ual: &Ual, assertion: &Assertion) -> GatewayResult<NodeReceipt> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::SubmitAssertion {
            token_id: ual.token_id(),
            digest: assertion.digest().clone(),
        });

        if state.faults.failing_node_submissions > 0 {
            state.faults.failing_node_submissions -= 1;
            return Err(GatewayError::Transient("node unavailable".to_string()));
        }
        if let Some(reason) = state.faults.next_submission_refusal.take() {
            return Err(GatewayError::Rejected(reason));
        }

        let rejected = state.faults.next_submission_rejection.take();
        let receipt = NodeReceipt(Uuid::new_v4().to_string());
        if rejected.is_none() {
            state.content.insert(
                (ual.token_id(), assertion.digest().clone()),
                assertion.statements().to_vec(),
            );
        }
        state
            .receipts
            .insert(receipt.clone(), StoredReceipt { polls: 0, rejected });
        Ok(receipt)
    }

    async fn get_replication_status(&self, receipt: &NodeReceipt) -> GatewayResult<ReplicationStatus> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::GetReplicationStatus {
            receipt: receipt.clone(),
        });
        state.read_fault()?;

        let stalled = state.faults.stall_replication;
        let acks_per_poll = self.shared.settings.acks_per_poll;
        let replicas = self.shared.settings.replica_count;
        let stored = state
            .receipts
            .get_mut(receipt)
            .ok_or_else(|| GatewayError::NotFound(format!("receipt {}", receipt)))?;

        if let Some(reason) = &stored.rejected {
            return Ok(ReplicationStatus {
                acknowledged: 0,
                complete: false,
                rejected: Some(reason.clone()),
            });
        }
        if stalled {
            return Ok(ReplicationStatus::default());
        }

        stored.polls += 1;
        let acknowledged = stored.polls.saturating_mul(acks_per_poll).min(replicas);
        Ok(ReplicationStatus {
            acknowledged,
            complete: acknowledged >= replicas,
            rejected: None,
        })
    }

    async fn fetch_assertion(&self, ual: &Ual, digest: &AssertionDigest) -> GatewayResult<Vec<String>> {
        self.shared.pause().await;
        let mut state = self.shared.state.lock().await;
        state.calls.push(Call::FetchAssertion {
            token_id: ual.token_id(),
            digest: digest.clone(),
        });
        state.read_fault()?;

        if let Some(lines) = state.tampered.get(&ual.token_id()) {
            return Ok(lines.clone());
        }
        state
            .content
            .get(&(ual.token_id(), digest.clone()))
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("content {} of token {}", digest, ual.token_id())))
    }

    fn search_topic(&self, pattern: &str) -> UalStream {
        let shared = self.shared.clone();
        let pattern = pattern.to_string();

        Box::pin(async_stream::stream! {
            shared.pause().await;
            let hits: Vec<Ual> = {
                let mut state = shared.state.lock().await;
                state.calls.push(Call::SearchTopic { pattern: pattern.clone() });
                state
                    .assets
                    .iter()
                    .filter(|(_, asset)| !asset.burned)
                    .filter_map(|(token_id, asset)| {
                        let digest = asset.history.last()?;
                        let lines = state.content.get(&(*token_id, digest.clone()))?;
                        if lines.iter().any(|line| line.contains(&pattern)) {
                            shared.ual(*token_id)
                        } else {
                            None
                        }
                    })
                    .collect()
            };

            for ual in hits {
                yield Ok(ual);
            }
        })
    }
}
