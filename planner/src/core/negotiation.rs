//! Bounded proposal loop between the orchestrator and the oracle.
//!
//! A node's decomposition is negotiated in rounds. Each round the oracle
//! proposes children and declarations; every proposal goes through
//! [`apply_child`], and refused proposals are returned to the oracle as
//! feedback in the next round. The loop is a small state machine driven by a
//! round counter, so an oracle that keeps proposing bad children still ends.

use crate::core::guards::{check_recursion, validate_child_name};
use crate::core::registry::ChildNameRegistry;
use crate::core::types::{
    CompileResponse, ConstraintDecl, Declarations, InterfaceDecl, ProposedChild, Rejection,
    RejectionKind, UtilityDecl,
};
use crate::error::PlanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingAction,
    ApplyingAction,
    Done,
}

/// Facts about the parent that every proposal is checked against.
#[derive(Debug, Clone, Copy)]
pub struct ChildRules<'a> {
    pub parent_path: &'a str,
    pub parent_name: &'a str,
    pub parent_is_root: bool,
    /// Depth the children would have (root = 0).
    pub child_depth: usize,
    pub max_depth: usize,
    pub registry: &'a ChildNameRegistry,
}

/// Validate one proposal and claim its name under the parent.
///
/// Children at or past the depth ceiling are accepted as leaves.
pub fn apply_child(
    rules: &ChildRules<'_>,
    proposed: ProposedChild,
) -> Result<ProposedChild, Rejection> {
    let reject = |err: PlanError, kind: RejectionKind| Rejection {
        name: proposed.name.clone(),
        kind,
        reason: err.to_string(),
    };
    validate_child_name(&proposed.name).map_err(|e| reject(e, RejectionKind::InvalidName))?;
    check_recursion(rules.parent_name, &proposed.name, rules.parent_is_root)
        .map_err(|e| reject(e, RejectionKind::RecursionGuard))?;
    rules
        .registry
        .claim(rules.parent_path, &proposed.name)
        .map_err(|e| reject(e, RejectionKind::Collision))?;

    let mut accepted = proposed;
    if rules.child_depth >= rules.max_depth {
        accepted.is_leaf = true;
    }
    Ok(accepted)
}

/// Outcome of a finished negotiation.
#[derive(Debug, Clone, Default)]
pub struct Settlement {
    pub accepted: Vec<ProposedChild>,
    pub declared: Declarations,
    /// Refusals from the final round that were never resolved.
    pub unresolved: Vec<Rejection>,
    pub questions: Vec<String>,
    pub considerations: Vec<String>,
    pub rounds: usize,
}

#[derive(Debug)]
pub struct Negotiation {
    phase: Phase,
    round: usize,
    max_rounds: usize,
    declaring_node: String,
    feedback: Vec<Rejection>,
    settlement: Settlement,
}

impl Negotiation {
    pub fn new(declaring_node: &str, max_rounds: usize) -> Self {
        Self {
            phase: Phase::AwaitingAction,
            round: 0,
            max_rounds: max_rounds.max(1),
            declaring_node: declaring_node.to_string(),
            feedback: Vec::new(),
            settlement: Settlement::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Start the next round if one is due. Returns the feedback to send.
    pub fn begin_round(&mut self) -> Option<Vec<Rejection>> {
        if self.phase != Phase::AwaitingAction || self.round >= self.max_rounds {
            self.phase = Phase::Done;
            return None;
        }
        self.round += 1;
        self.phase = Phase::ApplyingAction;
        Some(std::mem::take(&mut self.feedback))
    }

    /// Names accepted so far, for the oracle's benefit.
    pub fn accepted_names(&self) -> Vec<String> {
        self.settlement
            .accepted
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Apply one oracle response and decide whether another round is needed.
    pub fn apply(&mut self, rules: &ChildRules<'_>, response: CompileResponse) {
        debug_assert_eq!(self.phase, Phase::ApplyingAction);
        self.merge_declarations(&response);
        extend_unique(&mut self.settlement.questions, response.questions);
        extend_unique(&mut self.settlement.considerations, response.considerations);

        let mut rejected = Vec::new();
        for proposed in response.children {
            match apply_child(rules, proposed) {
                Ok(child) => self.settlement.accepted.push(child),
                Err(rejection) => rejected.push(rejection),
            }
        }

        if rejected.is_empty() || self.round >= self.max_rounds {
            self.settlement.unresolved = rejected;
            self.phase = Phase::Done;
        } else {
            self.feedback = rejected;
            self.phase = Phase::AwaitingAction;
        }
    }

    /// Stop early (governor tripped or the oracle failed). Pending
    /// feedback becomes unresolved.
    pub fn abort(&mut self) {
        self.settlement
            .unresolved
            .extend(std::mem::take(&mut self.feedback));
        self.phase = Phase::Done;
    }

    pub fn finish(mut self) -> Settlement {
        self.abort();
        self.settlement.rounds = self.round;
        self.settlement
    }

    fn merge_declarations(&mut self, response: &CompileResponse) {
        let node = &self.declaring_node;
        let declared = &mut self.settlement.declared;
        for iface in &response.interfaces {
            declared
                .interfaces
                .entry(iface.name.clone())
                .or_insert_with(|| InterfaceDecl {
                    definition: iface.definition.clone(),
                    declaring_node: node.clone(),
                });
        }
        for rule in &response.constraints {
            if !declared.constraints.iter().any(|c| &c.rule == rule) {
                declared.constraints.push(ConstraintDecl {
                    rule: rule.clone(),
                    declaring_node: node.clone(),
                });
            }
        }
        for util in &response.utilities {
            if !declared.utilities.iter().any(|u| u.name == util.name) {
                declared.utilities.push(UtilityDecl {
                    name: util.name.clone(),
                    signature: util.signature.clone(),
                    location: util.location.clone(),
                    declaring_node: node.clone(),
                });
            }
        }
        extend_unique(&mut declared.suggestions, response.suggestions.clone());
    }
}

fn extend_unique(target: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}
