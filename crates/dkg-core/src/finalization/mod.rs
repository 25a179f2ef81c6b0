//! Finalization tracking
//!
//! A submitted operation is final once the chain confirms its transaction to
//! the required depth and enough nodes acknowledge the content. The
//! [`FinalizationPoller`] waits for both with backoff and a deadline.

pub mod clock;
pub mod poller;
pub mod state;

pub use clock::{Backoff, Clock, TokioClock};
pub use poller::{
    FailureSource, FinalizationConfig, FinalizationPoller, FinalizationReport, FinalizationTarget,
};
pub use state::FinalizationState;
