//! DKG Client Core Library
//!
//! This crate provides the core of a client for Knowledge Assets on a
//! decentralized knowledge graph, including:
//! - Content normalization into digest-identified assertions
//! - Chain and node gateway interfaces (in-memory and HTTP implementations)
//! - Publish/update coordination as a resumable, idempotent saga
//! - Finalization polling with backoff and deadlines
//! - Query and digest verification of published content
//! - File-backed configuration with network profiles

pub mod assertion;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod finalization;
pub mod gateway;
pub mod query;
pub mod ual;

#[cfg(test)]
mod config_tests;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::assertion::{Assertion, AssertionDigest, Graph, Normalizer, Term, Triple};
    pub use crate::config::Config;
    pub use crate::coordinator::{
        Coordinator, CoordinatorConfig, IdempotencyKey, OperationHandle, OperationOptions,
        PublishOptions, WaitMode,
    };
    pub use crate::error::{Error, Result};
    pub use crate::finalization::{FinalizationConfig, FinalizationState};
    pub use crate::gateway::{Amount, BidRange, ChainGateway, NodeGateway};
    pub use crate::query::{QueryEngine, Resolution, StateSelector, Verification};
    pub use crate::ual::{Address, TokenId, Ual};
}
