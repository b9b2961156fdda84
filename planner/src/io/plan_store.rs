//! On-disk plan tree: one directory per compiled node.
//!
//! Layout, keyed by node path:
//!
//! ```text
//! <storage_root>/spec.plan            root spec text
//! <storage_root>/context.json         root context artifact
//! <storage_root>/server/spec.plan     node "server"
//! <storage_root>/server/router/...    node "server/router"
//! ```
//!
//! Reads return `Ok(None)` when an artifact is absent so callers can treat
//! "never compiled" uniformly.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::path::{
    CONTEXT_FILE, PLAN_FILE, QUESTIONS_FILE, ROOT, SOURCEMAP_FILE, segments,
};
use crate::core::sourcemap::SourceMap;
use crate::core::types::{
    CacheRecord, ChildSpec, Declarations, LeafArtifact, NodeContext, Rejection,
};
use crate::spec::SourceRange;

/// Persisted context artifact for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanContext {
    pub node_path: String,
    pub is_leaf: bool,
    /// Context the node received from its parent.
    pub context: NodeContext,
    /// What the node added for its children.
    #[serde(default)]
    pub declared: Declarations,
    /// Children produced by the oracle, replayed on a cache hit.
    #[serde(default)]
    pub children: Vec<ChildSpec>,
    #[serde(default)]
    pub leaf: Option<LeafArtifact>,
    #[serde(default)]
    pub source: Option<SourceRange>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Present only once the node compiled cleanly.
    #[serde(default)]
    pub cache: Option<CacheRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QuestionsArtifact {
    pub questions: Vec<String>,
    pub considerations: Vec<String>,
    pub rejections: Vec<Rejection>,
}

impl QuestionsArtifact {
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty() && self.considerations.is_empty() && self.rejections.is_empty()
    }
}

/// Directory holding the artifacts of `node_path`.
pub fn node_dir(storage_root: &Path, node_path: &str) -> PathBuf {
    let mut dir = storage_root.to_path_buf();
    for segment in segments(node_path) {
        dir.push(segment);
    }
    dir
}

pub fn write_plan_file(storage_root: &Path, node_path: &str, spec_text: &str) -> Result<()> {
    let path = node_dir(storage_root, node_path).join(PLAN_FILE);
    write_text(&path, spec_text)
}

pub fn read_plan_file(storage_root: &Path, node_path: &str) -> Result<Option<String>> {
    read_text(&node_dir(storage_root, node_path).join(PLAN_FILE))
}

pub fn write_context_file(storage_root: &Path, node_path: &str, ctx: &PlanContext) -> Result<()> {
    write_json(&node_dir(storage_root, node_path).join(CONTEXT_FILE), ctx)
}

pub fn read_context_file(storage_root: &Path, node_path: &str) -> Result<Option<PlanContext>> {
    read_json(&node_dir(storage_root, node_path).join(CONTEXT_FILE))
}

pub fn write_questions_file(
    storage_root: &Path,
    node_path: &str,
    questions: &QuestionsArtifact,
) -> Result<()> {
    write_json(
        &node_dir(storage_root, node_path).join(QUESTIONS_FILE),
        questions,
    )
}

pub fn read_questions_file(
    storage_root: &Path,
    node_path: &str,
) -> Result<Option<QuestionsArtifact>> {
    read_json(&node_dir(storage_root, node_path).join(QUESTIONS_FILE))
}

/// Drop a stale questions artifact after a clean recompile.
pub fn remove_questions_file(storage_root: &Path, node_path: &str) -> Result<()> {
    let path = node_dir(storage_root, node_path).join(QUESTIONS_FILE);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Source maps for every file a leaf generated, keyed by output file.
pub fn write_source_maps(
    storage_root: &Path,
    node_path: &str,
    maps: &BTreeMap<String, SourceMap>,
) -> Result<()> {
    write_json(&node_dir(storage_root, node_path).join(SOURCEMAP_FILE), maps)
}

pub fn read_source_maps(
    storage_root: &Path,
    node_path: &str,
) -> Result<Option<BTreeMap<String, SourceMap>>> {
    read_json(&node_dir(storage_root, node_path).join(SOURCEMAP_FILE))
}

/// Remove child directories of `node_path` not named in `keep`.
///
/// A recompiled node invalidates its whole subtree; children the oracle no
/// longer proposes must not linger as phantom leaves.
pub fn prune_stale_children(
    storage_root: &Path,
    node_path: &str,
    keep: &[String],
) -> Result<Vec<String>> {
    let dir = node_dir(storage_root, node_path);
    let mut removed = Vec::new();
    for name in child_node_dirs(&dir)? {
        if keep.contains(&name) {
            continue;
        }
        let child = dir.join(&name);
        debug!(node_path, child = %name, "pruning stale plan subtree");
        fs::remove_dir_all(&child).with_context(|| format!("remove {}", child.display()))?;
        removed.push(name);
    }
    Ok(removed)
}

/// Node paths of every persisted node under `storage_root`, sorted.
pub fn list_plan_nodes(storage_root: &Path) -> Result<Vec<String>> {
    let mut nodes = Vec::new();
    if storage_root.join(CONTEXT_FILE).is_file() {
        nodes.push(ROOT.to_string());
    }
    collect_nodes(storage_root, &mut Vec::new(), &mut nodes)?;
    nodes.sort();
    Ok(nodes)
}

/// Names of subdirectories of `dir` that carry their own context artifact.
pub fn child_node_dirs(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if !path.is_dir() || !path.join(CONTEXT_FILE).is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn collect_nodes(dir: &Path, prefix: &mut Vec<String>, out: &mut Vec<String>) -> Result<()> {
    for name in child_node_dirs(dir)? {
        prefix.push(name.clone());
        out.push(prefix.join("/"));
        collect_nodes(&dir.join(&name), prefix, out)?;
        prefix.pop();
    }
    Ok(())
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create plan dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn read_text(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_text(path, &buf)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let Some(contents) = read_text(path)? else {
        return Ok(None);
    };
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::create_root_context;

    fn plan_context(node_path: &str, is_leaf: bool) -> PlanContext {
        PlanContext {
            node_path: node_path.to_string(),
            is_leaf,
            context: create_root_context(),
            declared: Declarations::default(),
            children: Vec::new(),
            leaf: None,
            source: None,
            errors: Vec::new(),
            cache: None,
        }
    }

    #[test]
    fn node_dirs_follow_ancestry() {
        let root = Path::new("/plan");
        assert_eq!(node_dir(root, "root"), PathBuf::from("/plan"));
        assert_eq!(
            node_dir(root, "server/router"),
            PathBuf::from("/plan/server/router")
        );
    }

    #[test]
    fn missing_artifacts_read_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(read_plan_file(temp.path(), "server").expect("read"), None);
        assert_eq!(read_context_file(temp.path(), "server").expect("read"), None);
        assert_eq!(read_questions_file(temp.path(), "root").expect("read"), None);
    }

    #[test]
    fn corrupt_context_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(CONTEXT_FILE), "{not json").expect("write");
        assert!(read_context_file(temp.path(), "root").is_err());
    }

    #[test]
    fn artifacts_are_written_under_node_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write_plan_file(root, "server/router", "router {}\n").expect("plan");
        write_context_file(root, "server/router", &plan_context("server/router", true))
            .expect("context");

        assert!(root.join("server/router/spec.plan").is_file());
        assert_eq!(
            read_plan_file(root, "server/router").expect("read"),
            Some("router {}\n".to_string())
        );
        let ctx = read_context_file(root, "server/router")
            .expect("read")
            .expect("present");
        assert!(ctx.is_leaf);
    }

    #[test]
    fn list_and_prune_plan_nodes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        for path in ["root", "server", "server/router", "server/old", "client"] {
            write_context_file(root, path, &plan_context(path, false)).expect("write");
        }
        fs::create_dir_all(root.join("scratch")).expect("stray dir");

        assert_eq!(
            list_plan_nodes(root).expect("list"),
            vec!["client", "root", "server", "server/old", "server/router"]
        );

        let removed =
            prune_stale_children(root, "server", &["router".to_string()]).expect("prune");
        assert_eq!(removed, vec!["old"]);
        assert!(!root.join("server/old").exists());
        assert!(root.join("server/router").exists());
    }
}
