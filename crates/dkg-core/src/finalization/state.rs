//! Finalization lifecycle states

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a submitted operation stands on its way to finality
///
/// ```text
/// Submitted -> ChainConfirmed -> NodeReplicated -> Finalized
///     |              |                 |
///     +--------------+-----------------+--> Failed | TimedOut
/// ```
///
/// Chain-only operations skip `NodeReplicated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationState {
    Submitted,
    ChainConfirmed,
    NodeReplicated,
    Finalized,
    Failed,
    TimedOut,
}

impl FinalizationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::ChainConfirmed => "chain_confirmed",
            Self::NodeReplicated => "node_replicated",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "chain_confirmed" => Some(Self::ChainConfirmed),
            "node_replicated" => Some(Self::NodeReplicated),
            "finalized" => Some(Self::Finalized),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    /// Whether polling stops in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed | Self::TimedOut)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Finalized)
    }
}

impl fmt::Display for FinalizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(FinalizationState::Finalized.is_terminal());
        assert!(FinalizationState::Failed.is_terminal());
        assert!(FinalizationState::TimedOut.is_terminal());
        assert!(!FinalizationState::Submitted.is_terminal());
        assert!(!FinalizationState::ChainConfirmed.is_terminal());
        assert!(!FinalizationState::NodeReplicated.is_terminal());
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            FinalizationState::Submitted,
            FinalizationState::ChainConfirmed,
            FinalizationState::NodeReplicated,
            FinalizationState::Finalized,
            FinalizationState::Failed,
            FinalizationState::TimedOut,
        ] {
            assert_eq!(FinalizationState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(FinalizationState::from_str("done"), None);
    }
}
