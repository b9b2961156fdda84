//! Run-wide counters and ceilings that bound a compilation.
//!
//! Every concurrent branch updates the same [`CompilationState`]; counters
//! are atomics so increments are never lost. Tripping a governor records
//! which one tripped first and refuses new work from then on. Work that has
//! already started is left to finish.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// A ceiling that can halt scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Governor {
    Nodes,
    Calls,
}

impl Governor {
    pub fn as_str(self) -> &'static str {
        match self {
            Governor::Nodes => "nodes",
            Governor::Calls => "calls",
        }
    }
}

impl fmt::Display for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured ceilings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Governors {
    pub max_nodes: usize,
    pub max_calls: usize,
    /// Oracle calls allowed in flight at once.
    pub max_parallel: usize,
    /// Nodes at this depth (root = 0) are never decomposed.
    pub max_depth: usize,
    /// Proposal rounds per node when the oracle's children get rejected.
    pub negotiation_rounds: usize,
}

impl Default for Governors {
    fn default() -> Self {
        Self {
            max_nodes: 500,
            max_calls: 200,
            max_parallel: 4,
            max_depth: 6,
            negotiation_rounds: 2,
        }
    }
}

/// Snapshot of the counters, taken at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Totals {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub ai_calls: usize,
    pub errors: usize,
    pub questions_raised: usize,
}

#[derive(Debug)]
pub struct CompilationState {
    total_nodes: AtomicUsize,
    completed_nodes: AtomicUsize,
    ai_calls: AtomicUsize,
    errors: AtomicUsize,
    questions_raised: AtomicUsize,
    limits: Governors,
    limit_reached: OnceLock<Governor>,
}

impl CompilationState {
    pub fn new(limits: Governors) -> Self {
        Self {
            total_nodes: AtomicUsize::new(0),
            completed_nodes: AtomicUsize::new(0),
            ai_calls: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            questions_raised: AtomicUsize::new(0),
            limits,
            limit_reached: OnceLock::new(),
        }
    }

    pub fn limits(&self) -> &Governors {
        &self.limits
    }

    /// Reserve a node slot. Fails once the node ceiling (or any earlier
    /// governor) has been reached.
    pub fn try_start_node(&self) -> Result<(), Governor> {
        if let Some(tripped) = self.limit_reached() {
            return Err(tripped);
        }
        let reserved = self
            .total_nodes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limits.max_nodes).then_some(n + 1)
            });
        match reserved {
            Ok(_) => Ok(()),
            Err(_) => Err(self.trip(Governor::Nodes)),
        }
    }

    /// Reserve an oracle call against the call ceiling.
    pub fn try_start_call(&self) -> Result<(), Governor> {
        let reserved = self
            .ai_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limits.max_calls).then_some(n + 1)
            });
        match reserved {
            Ok(_) => Ok(()),
            Err(_) => Err(self.trip(Governor::Calls)),
        }
    }

    pub fn finish_node(&self) {
        self.completed_nodes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_errors(&self, count: usize) {
        self.errors.fetch_add(count, Ordering::SeqCst);
    }

    pub fn record_questions(&self, count: usize) {
        self.questions_raised.fetch_add(count, Ordering::SeqCst);
    }

    /// The first governor that tripped, if any.
    pub fn limit_reached(&self) -> Option<Governor> {
        self.limit_reached.get().copied()
    }

    fn trip(&self, governor: Governor) -> Governor {
        *self.limit_reached.get_or_init(|| governor)
    }

    pub fn totals(&self) -> Totals {
        Totals {
            total_nodes: self.total_nodes.load(Ordering::SeqCst),
            completed_nodes: self.completed_nodes.load(Ordering::SeqCst),
            ai_calls: self.ai_calls.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            questions_raised: self.questions_raised.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn limits(max_nodes: usize, max_calls: usize) -> Governors {
        Governors {
            max_nodes,
            max_calls,
            ..Governors::default()
        }
    }

    #[test]
    fn node_ceiling_trips_and_sticks() {
        let state = CompilationState::new(limits(1, 10));
        assert!(state.try_start_node().is_ok());
        assert_eq!(state.try_start_node(), Err(Governor::Nodes));
        assert_eq!(state.limit_reached(), Some(Governor::Nodes));
        assert_eq!(state.totals().total_nodes, 1);
    }

    #[test]
    fn first_tripped_governor_wins() {
        let state = CompilationState::new(limits(10, 0));
        assert_eq!(state.try_start_call(), Err(Governor::Calls));
        assert_eq!(state.try_start_node(), Err(Governor::Calls));
        assert_eq!(state.limit_reached(), Some(Governor::Calls));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let state = Arc::new(CompilationState::new(limits(10_000, 10_000)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..100 {
                        state.try_start_node().expect("node");
                        state.try_start_call().expect("call");
                        state.finish_node();
                        state.record_questions(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let totals = state.totals();
        assert_eq!(totals.total_nodes, 800);
        assert_eq!(totals.completed_nodes, 800);
        assert_eq!(totals.ai_calls, 800);
        assert_eq!(totals.questions_raised, 800);
        assert_eq!(state.limit_reached(), None);
    }
}
