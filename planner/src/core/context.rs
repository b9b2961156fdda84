//! Context builder: what a child inherits from its parent.
//!
//! Knowledge flows strictly parent to child. A child's context is the
//! parent's own context plus exactly what the parent's compilation declared;
//! nothing is gathered from other ancestors behind the parent's back.

use crate::core::path::ROOT;
use crate::core::types::{Declarations, NodeContext};

/// Context for the top of the tree: no inherited knowledge.
pub fn create_root_context() -> NodeContext {
    NodeContext {
        ancestry: vec![ROOT.to_string()],
        ..NodeContext::default()
    }
}

/// Build the context `child_name` receives from a compiled parent.
pub fn build_child_context(
    parent: &NodeContext,
    declared: &Declarations,
    child_name: &str,
) -> NodeContext {
    let mut ancestry = if parent.ancestry.is_empty() {
        vec![ROOT.to_string()]
    } else {
        parent.ancestry.clone()
    };
    if !(child_name == ROOT && ancestry.len() == 1) {
        ancestry.push(child_name.to_string());
    }

    // The nearest declaration of a parameter wins.
    let mut parameters = parent.parameters.clone();
    parameters.extend(
        declared
            .parameters
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );

    let mut interfaces = parent.interfaces.clone();
    for (name, decl) in &declared.interfaces {
        interfaces
            .entry(name.clone())
            .or_insert_with(|| decl.clone());
    }

    let mut constraints = parent.constraints.clone();
    for decl in &declared.constraints {
        if !constraints.iter().any(|c| c.rule == decl.rule) {
            constraints.push(decl.clone());
        }
    }

    let mut suggestions = parent.suggestions.clone();
    for suggestion in &declared.suggestions {
        if !suggestions.contains(suggestion) {
            suggestions.push(suggestion.clone());
        }
    }

    let mut utilities = parent.utilities.clone();
    for decl in &declared.utilities {
        if !utilities.iter().any(|u| u.name == decl.name) {
            utilities.push(decl.clone());
        }
    }

    NodeContext {
        ancestry,
        parameters,
        interfaces,
        constraints,
        suggestions,
        utilities,
        query_matches: parent.query_matches.clone(),
    }
}
