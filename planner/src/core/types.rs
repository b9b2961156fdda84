//! Shared deterministic types for planner core logic.
//!
//! These types define the contracts between the orchestrator, the cache
//! engine, the plan store and the build runtime. Collections that feed a hash
//! or a persisted artifact use ordered containers so serialized output is
//! stable across runs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::SourceRange;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDecl {
    pub definition: String,
    pub declaring_node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDecl {
    pub rule: String,
    pub declaring_node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilityDecl {
    pub name: String,
    pub signature: String,
    pub location: String,
    pub declaring_node: String,
}

/// Knowledge a node inherits from its parent.
///
/// A context is never mutated once handed to a node; children always get a
/// fresh value built by [`crate::core::context::build_child_context`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeContext {
    pub ancestry: Vec<String>,
    pub parameters: BTreeMap<String, String>,
    pub interfaces: BTreeMap<String, InterfaceDecl>,
    pub constraints: Vec<ConstraintDecl>,
    pub suggestions: Vec<String>,
    pub utilities: Vec<UtilityDecl>,
    /// Query-filter questions matched on the way down.
    pub query_matches: Vec<String>,
}

/// What one compiled node adds on top of its own context for its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Declarations {
    pub parameters: BTreeMap<String, String>,
    pub interfaces: BTreeMap<String, InterfaceDecl>,
    pub constraints: Vec<ConstraintDecl>,
    pub suggestions: Vec<String>,
    pub utilities: Vec<UtilityDecl>,
}

impl Declarations {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
            && self.interfaces.is_empty()
            && self.constraints.is_empty()
            && self.suggestions.is_empty()
            && self.utilities.is_empty()
    }
}

/// Instruction to materialize (and, unless leaf, recurse into) a child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub name: String,
    pub is_leaf: bool,
    pub spec_text: String,
    pub context: NodeContext,
    #[serde(default)]
    pub required_files: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub source: Option<SourceRange>,
}

/// Why the cache engine decided a node does (or does not) need recompiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheReason {
    NoPriorArtifact,
    SpecChanged,
    ContextChanged,
    Unchanged,
    CacheDisabled,
}

impl CacheReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheReason::NoPriorArtifact => "no prior artifact",
            CacheReason::SpecChanged => "spec changed",
            CacheReason::ContextChanged => "context changed",
            CacheReason::Unchanged => "unchanged",
            CacheReason::CacheDisabled => "cache disabled",
        }
    }
}

impl fmt::Display for CacheReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub spec_hash: String,
    pub context_hash: String,
    pub compiled_at: DateTime<Utc>,
}

/// Why a proposed child was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Collision,
    RecursionGuard,
    InvalidName,
}

/// Structured refusal sent back to the oracle so it can propose again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub name: String,
    pub kind: RejectionKind,
    pub reason: String,
}

/// Everything the generator needs to produce a leaf's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafArtifact {
    pub name: String,
    /// Directory under the build root, `/`-separated, empty for the root.
    pub output_path: String,
    pub source_spec_ref: String,
    pub generation_prompt: String,
    #[serde(default)]
    pub required_files: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
}

/// Result of compiling a single node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledNode {
    pub node_path: String,
    pub is_leaf: bool,
    /// Children produced by this compilation.
    pub children: Vec<ChildSpec>,
    /// Children replayed from the persisted manifest on a cache hit.
    pub cached_children: Vec<ChildSpec>,
    pub questions: Vec<String>,
    pub considerations: Vec<String>,
    pub declared: Declarations,
    pub errors: Vec<String>,
    pub rejections: Vec<Rejection>,
    pub skipped: bool,
    pub cache_reason: Option<CacheReason>,
}

/// Interface declared by the oracle for a node's descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    pub definition: String,
}

/// Utility declared by the oracle for a node's descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilitySpec {
    pub name: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub location: String,
}

/// A child as proposed by the oracle, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedChild {
    pub name: String,
    #[serde(default)]
    pub is_leaf: bool,
    pub spec: String,
    /// Extra guidance for this child only.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub spec: String,
    pub context: NodeContext,
    pub node_path: String,
    /// Proposals refused in the previous round.
    pub feedback: Vec<Rejection>,
    /// Children already accepted in earlier rounds.
    pub accepted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CompileResponse {
    pub children: Vec<ProposedChild>,
    pub questions: Vec<String>,
    pub considerations: Vec<String>,
    pub interfaces: Vec<InterfaceSpec>,
    pub constraints: Vec<String>,
    pub suggestions: Vec<String>,
    pub utilities: Vec<UtilitySpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub spec: String,
    pub context: NodeContext,
    pub node_path: String,
    pub required_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GenerateResponse {
    pub files: Vec<GeneratedFile>,
    pub questions: Vec<String>,
    pub considerations: Vec<String>,
}
