//! Content-addressed hashing for spec text and inherited context.
//!
//! Hashes are SHA-256 hex digests. Contexts are canonicalized first (lists
//! sorted by their rule/name field) so two contexts holding the same
//! knowledge in different insertion order hash identically.

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::core::types::{CacheRecord, NodeContext};

pub fn hash_content(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn hash_context(context: &NodeContext) -> String {
    let canonical = canonicalize(context);
    // Serializing plain strings, vecs and BTreeMaps cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Sorted copy of `context`; ancestry and query matches keep their order.
pub fn canonicalize(context: &NodeContext) -> NodeContext {
    let mut canonical = context.clone();
    canonical.constraints.sort_by(|a, b| {
        a.rule
            .cmp(&b.rule)
            .then_with(|| a.declaring_node.cmp(&b.declaring_node))
    });
    canonical.utilities.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| a.signature.cmp(&b.signature))
    });
    canonical.suggestions.sort();
    canonical
}

pub fn create_cache_metadata(spec_hash: &str, context_hash: &str) -> CacheRecord {
    CacheRecord {
        spec_hash: spec_hash.to_string(),
        context_hash: context_hash.to_string(),
        compiled_at: Utc::now(),
    }
}

/// Human-readable differences between two contexts (diagnostics only).
pub fn summarize_changes(old: &NodeContext, new: &NodeContext) -> Vec<String> {
    let mut changes = Vec::new();

    for name in new.interfaces.keys() {
        if !old.interfaces.contains_key(name) {
            changes.push(format!("added interface '{name}'"));
        }
    }
    for name in old.interfaces.keys() {
        if !new.interfaces.contains_key(name) {
            changes.push(format!("removed interface '{name}'"));
        }
    }

    for decl in &new.constraints {
        if !old.constraints.iter().any(|c| c.rule == decl.rule) {
            changes.push(format!("added constraint '{}'", decl.rule));
        }
    }
    for decl in &old.constraints {
        if !new.constraints.iter().any(|c| c.rule == decl.rule) {
            changes.push(format!("removed constraint '{}'", decl.rule));
        }
    }

    for decl in &new.utilities {
        if !old.utilities.iter().any(|u| u.name == decl.name) {
            changes.push(format!("added utility '{}'", decl.name));
        }
    }
    for decl in &old.utilities {
        if !new.utilities.iter().any(|u| u.name == decl.name) {
            changes.push(format!("removed utility '{}'", decl.name));
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ConstraintDecl, UtilityDecl};

    fn constraint(rule: &str) -> ConstraintDecl {
        ConstraintDecl {
            rule: rule.to_string(),
            declaring_node: "server".to_string(),
        }
    }

    fn utility(name: &str) -> UtilityDecl {
        UtilityDecl {
            name: name.to_string(),
            signature: format!("fn {name}()"),
            location: "util.rs".to_string(),
            declaring_node: "server".to_string(),
        }
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(hash_content("a"), hash_content("a"));
        assert_ne!(hash_content("a"), hash_content("b"));
        assert_eq!(hash_content("").len(), 64);
    }

    #[test]
    fn context_hash_ignores_insertion_order() {
        let mut first = NodeContext::default();
        first.constraints = vec![constraint("b"), constraint("a")];
        first.utilities = vec![utility("y"), utility("x")];
        first.suggestions = vec!["later".to_string(), "early".to_string()];

        let mut second = NodeContext::default();
        second.constraints = vec![constraint("a"), constraint("b")];
        second.utilities = vec![utility("x"), utility("y")];
        second.suggestions = vec!["early".to_string(), "later".to_string()];

        assert_eq!(hash_context(&first), hash_context(&second));
    }

    #[test]
    fn context_hash_tracks_ancestry_order() {
        let mut first = NodeContext::default();
        first.ancestry = vec!["root".to_string(), "a".to_string(), "b".to_string()];
        let mut second = first.clone();
        second.ancestry = vec!["root".to_string(), "b".to_string(), "a".to_string()];
        assert_ne!(hash_context(&first), hash_context(&second));
    }

    #[test]
    fn summarize_reports_added_and_removed_names() {
        let mut old = NodeContext::default();
        old.constraints.push(constraint("Must log"));
        let mut new = NodeContext::default();
        new.constraints.push(constraint("Must validate input"));
        new.utilities.push(utility("parse"));

        let changes = summarize_changes(&old, &new);
        assert_eq!(
            changes,
            vec![
                "added constraint 'Must validate input'",
                "removed constraint 'Must log'",
                "added utility 'parse'",
            ]
        );
    }
}
