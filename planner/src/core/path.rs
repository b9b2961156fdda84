//! Helpers for rendering deterministic node paths.

use std::path::{Component, Path};

/// Synthetic ancestry entry for the top of every tree.
pub const ROOT: &str = "root";

/// Artifact files kept in every node directory.
pub const PLAN_FILE: &str = "spec.plan";
pub const CONTEXT_FILE: &str = "context.json";
pub const QUESTIONS_FILE: &str = "questions.json";
pub const SOURCEMAP_FILE: &str = "sourcemap.json";

/// Names that can never be used for a node directory.
pub const RESERVED_NAMES: [&str; 4] = [PLAN_FILE, CONTEXT_FILE, QUESTIONS_FILE, SOURCEMAP_FILE];

/// Join `ancestry` after the leading root sentinel with `/`.
///
/// `["root"]` (and an empty ancestry) map to `"root"`.
pub fn build_node_path(ancestry: &[String]) -> String {
    let rest: Vec<&str> = match ancestry.split_first() {
        Some((first, rest)) if first == ROOT => rest.iter().map(String::as_str).collect(),
        Some(_) => ancestry.iter().map(String::as_str).collect(),
        None => Vec::new(),
    };
    if rest.is_empty() {
        return ROOT.to_string();
    }
    rest.join("/")
}

/// Path segments of `node_path`; the root has none.
pub fn segments(node_path: &str) -> Vec<&str> {
    if node_path == ROOT {
        return Vec::new();
    }
    node_path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Parent of `node_path`, or `None` for the root.
pub fn parent_path(node_path: &str) -> Option<String> {
    let segs = segments(node_path);
    match segs.len() {
        0 => None,
        1 => Some(ROOT.to_string()),
        n => Some(segs[..n - 1].join("/")),
    }
}

/// Last segment of `node_path` (the node's own name).
pub fn leaf_name(node_path: &str) -> &str {
    segments(node_path).last().copied().unwrap_or(ROOT)
}

/// True if `path` stays inside the directory it is joined onto.
pub fn is_safe_relative(path: &str) -> bool {
    !path.trim().is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
