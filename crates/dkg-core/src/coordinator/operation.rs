//! Operation records and handles

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::finalization::FinalizationState;
use crate::gateway::{Bid, ChainWrite, NodeReceipt, TxHandle};
use crate::ual::Ual;

/// Caller-visible key that makes retries of one logical operation safe
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Fresh random key for callers that did not supply one
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for IdempotencyKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// What an operation does to an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Publish,
    Update,
    Transfer,
    Burn,
    AddTokens,
    ExtendStorage,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Update => "update",
            Self::Transfer => "transfer",
            Self::Burn => "burn",
            Self::AddTokens => "add_tokens",
            Self::ExtendStorage => "extend_storage",
        }
    }

    /// Whether the operation also hands content to the node network
    pub fn has_node_leg(&self) -> bool {
        matches!(self, Self::Publish | Self::Update)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last step an operation durably committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStep {
    Started,
    AllowanceRaised,
    ChainSubmitted,
    NodeSubmitted,
    Finalized,
}

impl OperationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AllowanceRaised => "allowance_raised",
            Self::ChainSubmitted => "chain_submitted",
            Self::NodeSubmitted => "node_submitted",
            Self::Finalized => "finalized",
        }
    }
}

impl fmt::Display for OperationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a write call blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Return once the operation reaches a terminal finalization state
    #[default]
    Finalize,
    /// Return once every write is submitted; finish with `Coordinator::wait`
    Submitted,
}

/// Paid chain write sent without a known outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub write: ChainWrite,
    /// Block height read just before sending; the write can only land after it
    pub since_block: u64,
}

/// Ledger of one operation's committed steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub key: IdempotencyKey,
    pub kind: OperationKind,
    /// Identity of the inputs; a retry must present the same one
    pub fingerprint: String,
    pub step: OperationStep,
    pub bid: Option<Bid>,
    /// Allowance before this operation raised it
    pub previous_allowance: Option<u128>,
    pub allowance_tx: Option<TxHandle>,
    /// Set while a chain write's outcome is unknown
    pub pending_write: Option<PendingWrite>,
    pub chain_tx: Option<TxHandle>,
    pub ual: Option<Ual>,
    pub node_receipt: Option<NodeReceipt>,
    pub state: Option<FinalizationState>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn new(key: IdempotencyKey, kind: OperationKind, fingerprint: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            kind,
            fingerprint: fingerprint.into(),
            step: OperationStep::Started,
            bid: None,
            previous_allowance: None,
            allowance_tx: None,
            pending_write: None,
            chain_tx: None,
            ual: None,
            node_receipt: None,
            state: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn commit(&mut self, step: OperationStep) {
        self.step = step;
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Forget a chain write that never landed so the next attempt starts over
    pub(crate) fn reset_chain_leg(&mut self) {
        self.step = OperationStep::Started;
        self.pending_write = None;
        self.chain_tx = None;
        self.node_receipt = None;
        self.state = None;
        self.allowance_tx = None;
        self.previous_allowance = None;
        if self.kind == OperationKind::Publish {
            self.ual = None;
        }
        self.touch();
    }

    /// Forget a node submission the nodes refused so a retry sends the
    /// content again; the chain leg stays
    pub(crate) fn reset_node_leg(&mut self) {
        self.node_receipt = None;
        self.state = None;
        if self.step > OperationStep::ChainSubmitted {
            self.step = OperationStep::ChainSubmitted;
        }
        self.touch();
    }

    pub fn is_finalized(&self) -> bool {
        self.step == OperationStep::Finalized
    }

    /// Handle describing the operation in `state`, once a chain write exists
    pub fn handle(&self, state: FinalizationState) -> Option<OperationHandle> {
        Some(OperationHandle {
            key: self.key.clone(),
            kind: self.kind,
            ual: self.ual.clone()?,
            chain_tx: self.chain_tx.clone()?,
            state,
        })
    }
}

/// Result of a submitted operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    key: IdempotencyKey,
    kind: OperationKind,
    ual: Ual,
    chain_tx: TxHandle,
    state: FinalizationState,
}

impl OperationHandle {
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn ual(&self) -> &Ual {
        &self.ual
    }

    pub fn chain_tx(&self) -> &TxHandle {
        &self.chain_tx
    }

    pub fn state(&self) -> FinalizationState {
        self.state
    }

    pub fn is_finalized(&self) -> bool {
        self.state == FinalizationState::Finalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_unique() {
        assert_ne!(IdempotencyKey::generate(), IdempotencyKey::generate());
        assert_eq!(IdempotencyKey::from("abc").as_str(), "abc");
    }

    #[test]
    fn test_steps_are_ordered() {
        assert!(OperationStep::Started < OperationStep::AllowanceRaised);
        assert!(OperationStep::AllowanceRaised < OperationStep::ChainSubmitted);
        assert!(OperationStep::ChainSubmitted < OperationStep::NodeSubmitted);
        assert!(OperationStep::NodeSubmitted < OperationStep::Finalized);
        assert_eq!(OperationStep::ChainSubmitted.to_string(), "chain_submitted");
    }

    #[test]
    fn test_node_leg_only_for_content_writes() {
        assert!(OperationKind::Publish.has_node_leg());
        assert!(OperationKind::Update.has_node_leg());
        assert!(!OperationKind::Transfer.has_node_leg());
        assert!(!OperationKind::Burn.has_node_leg());
        assert!(!OperationKind::AddTokens.has_node_leg());
        assert!(!OperationKind::ExtendStorage.has_node_leg());
    }

    #[test]
    fn test_reset_chain_leg_clears_submissions() {
        let ual = Ual::parse("did:dkg:hardhat1:31337/0x5cac41237127f94c2d21dae0b14bfefa99880630/1").unwrap();
        let mut record = OperationRecord::new(IdempotencyKey::new("k"), OperationKind::Publish, "0xabc");
        record.chain_tx = Some(TxHandle("0x01".to_string()));
        record.node_receipt = Some(NodeReceipt("r".to_string()));
        record.ual = Some(ual);
        record.commit(OperationStep::NodeSubmitted);

        record.reset_chain_leg();

        assert_eq!(record.step, OperationStep::Started);
        assert!(record.chain_tx.is_none());
        assert!(record.node_receipt.is_none());
        assert!(record.ual.is_none());
        assert!(record.handle(FinalizationState::Submitted).is_none());
    }

    #[test]
    fn test_reset_node_leg_keeps_chain_write() {
        let ual = Ual::parse("did:dkg:hardhat1:31337/0x5cac41237127f94c2d21dae0b14bfefa99880630/2").unwrap();
        let mut record = OperationRecord::new(IdempotencyKey::new("k"), OperationKind::Update, "0xabc");
        record.chain_tx = Some(TxHandle("0x03".to_string()));
        record.node_receipt = Some(NodeReceipt("r".to_string()));
        record.ual = Some(ual.clone());
        record.state = Some(FinalizationState::Failed);
        record.commit(OperationStep::NodeSubmitted);

        record.reset_node_leg();

        assert_eq!(record.step, OperationStep::ChainSubmitted);
        assert!(record.node_receipt.is_none());
        assert!(record.state.is_none());
        assert_eq!(record.handle(FinalizationState::Submitted).unwrap().ual(), &ual);
    }

    #[test]
    fn test_handle_requires_chain_write() {
        let ual = Ual::parse("did:dkg:hardhat1:31337/0x5cac41237127f94c2d21dae0b14bfefa99880630/4").unwrap();
        let mut record = OperationRecord::new(IdempotencyKey::new("k"), OperationKind::Burn, "burn");
        record.ual = Some(ual.clone());
        assert!(record.handle(FinalizationState::Submitted).is_none());

        record.chain_tx = Some(TxHandle("0x02".to_string()));
        let handle = record.handle(FinalizationState::Finalized).unwrap();
        assert_eq!(handle.ual(), &ual);
        assert!(handle.is_finalized());
        assert_eq!(handle.kind(), OperationKind::Burn);
    }
}
