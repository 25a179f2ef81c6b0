//! Error types for the DKG client core

use thiserror::Error;

use crate::coordinator::{IdempotencyKey, OperationStep};
use crate::gateway::GatewayError;

/// Result type alias using the core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Client core error types, one variant per reported failure kind
#[derive(Error, Debug)]
pub enum Error {
    // Input errors (E001-E099)
    #[error("Malformed graph: {0}")]
    MalformedGraph(String),

    #[error("Invalid UAL '{ual}': {reason}")]
    InvalidUal { ual: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid token amount: {0}")]
    InvalidTokenAmount(String),

    // Authorization errors (E100-E199)
    #[error("Account {caller} is not the owner of token {token_id} (owner is {owner})")]
    Unauthorized {
        token_id: u64,
        owner: String,
        caller: String,
    },

    // Economic errors (E200-E299)
    #[error("Insufficient allowance: {required} required, {available} available")]
    InsufficientAllowance { required: u128, available: u128 },

    #[error("Bid rejected by the network: {0}")]
    BidRejected(String),

    #[error("Required token amount {required} exceeds the authorized spend limit {limit}")]
    SpendLimitExceeded { required: u128, limit: u128 },

    // Coordination errors (E300-E399)
    #[error("Concurrent update detected for token {token_id}: {reason}")]
    ConcurrentUpdate { token_id: u64, reason: String },

    #[error("Operation '{0}' already has an active attempt")]
    OperationInProgress(IdempotencyKey),

    #[error("Operation '{key}' was cancelled before any chain submission")]
    Cancelled { key: IdempotencyKey },

    #[error("Operation '{key}' was abandoned after {step}; the chain write may still finalize")]
    Abandoned {
        key: IdempotencyKey,
        step: OperationStep,
    },

    #[error("Operation '{key}' failed after {step}: {reason}")]
    OperationFailed {
        key: IdempotencyKey,
        step: OperationStep,
        reason: String,
    },

    // Transport errors (E400-E499)
    #[error("Chain submission failed for operation '{key}' after {step}: {reason}")]
    ChainSubmission {
        key: IdempotencyKey,
        step: OperationStep,
        reason: String,
    },

    #[error("Node submission failed for operation '{key}' after {step}: {reason}")]
    NodeSubmission {
        key: IdempotencyKey,
        step: OperationStep,
        reason: String,
    },

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Outcome of the {stage} for operation '{key}' is unknown: {reason}")]
    OutcomeUnknown {
        key: IdempotencyKey,
        stage: String,
        reason: String,
    },

    #[error("Timed out during {stage}{}", describe_key(.key))]
    Timeout {
        stage: String,
        key: Option<IdempotencyKey>,
        ual: Option<String>,
    },

    // Verification errors (E500-E599)
    #[error("Digest mismatch: chain records {expected}, node returned content hashing to {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

fn describe_key(key: &Option<IdempotencyKey>) -> String {
    key.as_ref()
        .map(|k| format!(" (operation '{}')", k))
        .unwrap_or_default()
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedGraph(_) => "E001",
            Self::InvalidUal { .. } => "E002",
            Self::InvalidInput(_) => "E003",
            Self::InvalidTokenAmount(_) => "E004",
            Self::Unauthorized { .. } => "E100",
            Self::InsufficientAllowance { .. } => "E200",
            Self::BidRejected(_) => "E201",
            Self::SpendLimitExceeded { .. } => "E202",
            Self::ConcurrentUpdate { .. } => "E300",
            Self::OperationInProgress(_) => "E301",
            Self::Cancelled { .. } => "E302",
            Self::Abandoned { .. } => "E303",
            Self::OperationFailed { .. } => "E304",
            Self::ChainSubmission { .. } => "E400",
            Self::NodeSubmission { .. } => "E401",
            Self::Gateway(_) => "E402",
            Self::Timeout { .. } => "E403",
            Self::OutcomeUnknown { .. } => "E404",
            Self::DigestMismatch { .. } => "E500",
            Self::NotFound(_) => "E501",
            Self::ConfigError(_) => "E600",
            Self::Other(_) => "E9999",
        }
    }

    /// Get suggestion for how to recover from this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::InsufficientAllowance { required, .. } => {
                Some(format!("Raise the allowance to at least {}", required))
            }
            Self::SpendLimitExceeded { required, .. } => {
                Some(format!("Raise the spend limit to {} or lower the epochs", required))
            }
            Self::ConcurrentUpdate { .. } => {
                Some("Resolve the asset again and retry the update against the new state".to_string())
            }
            Self::OperationInProgress(key) => {
                Some(format!("Wait for operation '{}' to finish before retrying", key))
            }
            Self::ChainSubmission { key, .. } | Self::NodeSubmission { key, .. } => {
                Some(format!("Retry with idempotency key '{}' to resume", key))
            }
            Self::Timeout { ual: Some(ual), .. } => {
                Some(format!("Resolve {} later; the chain write may still finalize", ual))
            }
            Self::Abandoned { key, .. } => {
                Some(format!("Retry with idempotency key '{}' to resume waiting", key))
            }
            Self::OutcomeUnknown { key, .. } => Some(format!(
                "Check this account's recent transactions before retrying key '{}'",
                key
            )),
            Self::OperationFailed {
                key,
                step: OperationStep::ChainSubmitted,
                ..
            } => Some(format!(
                "The chain write stands; retry key '{}' to send the content to the nodes again",
                key
            )),
            Self::DigestMismatch { .. } => {
                Some("Do not trust this content; query another node".to_string())
            }
            _ => None,
        }
    }

    /// Idempotency key of the operation this error belongs to, if any
    pub fn idempotency_key(&self) -> Option<&IdempotencyKey> {
        match self {
            Self::OperationInProgress(key)
            | Self::Cancelled { key }
            | Self::Abandoned { key, .. }
            | Self::OperationFailed { key, .. }
            | Self::ChainSubmission { key, .. }
            | Self::NodeSubmission { key, .. }
            | Self::OutcomeUnknown { key, .. } => Some(key),
            Self::Timeout { key, .. } => key.as_ref(),
            _ => None,
        }
    }

    /// Whether the caller may safely retry with the same idempotency key
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::ChainSubmission { .. }
                | Self::NodeSubmission { .. }
                | Self::Timeout { key: Some(_), .. }
                | Self::Abandoned { .. }
                | Self::OperationInProgress(_)
        )
    }
}
