//! Typed planner errors.
//!
//! Most plumbing uses `anyhow` with context strings. The variants here are
//! the failures callers branch on: they decide whether a node is recorded as
//! errored, whether a proposal is bounced back to the oracle, or whether the
//! run stops scheduling new work.

use std::time::Duration;

use crate::core::governor::Governor;

/// Failure of a single oracle interaction.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider call failed: {0}")]
    Call(String),

    #[error(transparent)]
    Parse(#[from] ParseFailure),
}

/// Every tolerant extraction strategy failed on an oracle response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unparsable provider response ({})", attempts.join("; "))]
pub struct ParseFailure {
    /// One entry per strategy tried, in order.
    pub attempts: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("{0}")]
    ProviderFailure(#[from] ProviderError),

    #[error("collision: '{key}' already owned by '{owner}'")]
    Collision { key: String, owner: String },

    #[error("recursion guard: child '{child}' is too similar to parent '{parent}'")]
    RecursionGuard { parent: String, child: String },

    #[error("invalid node name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("governor exceeded: {0}")]
    GovernorExceeded(Governor),

    #[error("i/o failure at {path}: {message}")]
    Io { path: String, message: String },

    #[error("command rejected: {command} ({reason})")]
    CommandRejected { command: String, reason: String },

    #[error("command timed out after {timeout:?}: {command}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("no plan file found for {0}")]
    MissingPlan(String),
}
