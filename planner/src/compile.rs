//! Compilation orchestrator: walks a spec tree into a persisted plan tree.
//!
//! Each node moves through `entered → cache-checked → (skipped |
//! leaf-persisted | decomposed) → children-dispatched → joined`. A node is
//! always compiled before any of its children start; all children of one
//! parent then run concurrently on the current task and are joined before
//! the parent's subtree counts as done.
//!
//! Parsed nodes that already contain modules or query filters are decomposed
//! by their author: those children are dispatched directly with no oracle
//! call. Every other non-leaf node is decomposed by the oracle through a
//! bounded negotiation.

use std::path::Path;

use futures::future::{FutureExt, LocalBoxFuture, join_all};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::core::context::{build_child_context, create_root_context};
use crate::core::governor::{CompilationState, Governor, Governors, Totals};
use crate::core::guards::validate_child_name;
use crate::core::hash::{create_cache_metadata, hash_content, hash_context};
use crate::core::negotiation::{ChildRules, Negotiation};
use crate::core::path::{ROOT, build_node_path, parent_path};
use crate::core::registry::ChildNameRegistry;
use crate::core::types::{
    CacheReason, ChildSpec, CompileRequest, CompiledNode, Declarations, LeafArtifact,
    NodeContext, ProposedChild,
};
use crate::error::PlanError;
use crate::exit_codes;
use crate::io::cache::diff_node;
use crate::io::config::PlannerConfig;
use crate::io::plan_store::{
    PlanContext, QuestionsArtifact, prune_stale_children, remove_questions_file,
    write_context_file, write_plan_file, write_questions_file,
};
use crate::io::provider::Provider;
use crate::spec::{
    COMMANDS_PARAM, FILES_PARAM, LEAF_PARAM, OUTPUT_PARAM, SourceRange, SpecKind, SpecNode,
};

/// Parameters that steer a single node and are not inherited.
const NODE_LOCAL_PARAMS: [&str; 4] = [LEAF_PARAM, FILES_PARAM, COMMANDS_PARAM, OUTPUT_PARAM];

/// Per-run knobs for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub governors: Governors,
    pub cache_enabled: bool,
    /// Oracle-produced specs shorter than this with no `{` block are leaves.
    pub leaf_threshold_bytes: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::from_config(&PlannerConfig::default())
    }
}

impl CompileOptions {
    pub fn from_config(config: &PlannerConfig) -> Self {
        Self {
            governors: config.governors,
            cache_enabled: config.cache.enabled,
            leaf_threshold_bytes: config.cache.leaf_threshold_bytes,
        }
    }
}

/// State shared by every branch of one compilation run.
#[derive(Debug)]
pub struct CompileShared {
    pub state: CompilationState,
    pub registry: ChildNameRegistry,
    /// Bounds oracle calls in flight.
    pub call_slots: Semaphore,
}

impl CompileShared {
    pub fn new(governors: Governors) -> Self {
        Self {
            state: CompilationState::new(governors),
            registry: ChildNameRegistry::new(),
            call_slots: Semaphore::new(governors.max_parallel.max(1)),
        }
    }
}

/// What is being compiled: a node from the parsed tree or a child the
/// oracle proposed.
#[derive(Debug, Clone, Copy)]
pub enum NodeSpec<'a> {
    Parsed(&'a SpecNode),
    Generated(&'a ChildSpec),
}

impl NodeSpec<'_> {
    pub fn name(&self) -> &str {
        match self {
            NodeSpec::Parsed(node) => node.name(),
            NodeSpec::Generated(child) => &child.name,
        }
    }

    /// Canonical text used for hashing and persisted as `spec.plan`.
    pub fn canonical_text(&self) -> String {
        match self {
            NodeSpec::Parsed(node) => crate::spec::canonical_text(node),
            NodeSpec::Generated(child) => child.spec_text.clone(),
        }
    }

    fn source(&self) -> Option<SourceRange> {
        match self {
            NodeSpec::Parsed(node) => (!node.source.file.is_empty()).then(|| node.source.clone()),
            NodeSpec::Generated(child) => child.source.clone(),
        }
    }

    fn marked_leaf(&self) -> bool {
        match self {
            NodeSpec::Parsed(node) => node.is_marked_leaf(),
            NodeSpec::Generated(child) => child.is_leaf,
        }
    }

    fn has_structural_children(&self) -> bool {
        match self {
            NodeSpec::Parsed(node) => node.structural_children().next().is_some(),
            NodeSpec::Generated(_) => false,
        }
    }

    fn required_files(&self) -> Vec<String> {
        match self {
            NodeSpec::Parsed(node) => list_param(node, FILES_PARAM, ','),
            NodeSpec::Generated(child) => child.required_files.clone(),
        }
    }

    fn commands(&self) -> Vec<String> {
        match self {
            NodeSpec::Parsed(node) => list_param(node, COMMANDS_PARAM, ';'),
            NodeSpec::Generated(child) => child.commands.clone(),
        }
    }

    fn output_override(&self) -> Option<String> {
        match self {
            NodeSpec::Parsed(node) => node
                .param(OUTPUT_PARAM)
                .and_then(|p| p.value)
                .map(|v| v.trim().trim_matches('/').to_string()),
            NodeSpec::Generated(_) => None,
        }
    }

    /// Parameters this node passes down to its children.
    fn inherited_parameters(&self) -> Declarations {
        let mut declared = Declarations::default();
        if let NodeSpec::Parsed(node) = self {
            for param in node.parameters() {
                if NODE_LOCAL_PARAMS.contains(&param.name.as_str()) {
                    continue;
                }
                declared
                    .parameters
                    .entry(param.name)
                    .or_insert_with(|| param.value.unwrap_or_default());
            }
        }
        declared
    }
}

fn list_param(node: &SpecNode, name: &str, separator: char) -> Vec<String> {
    node.param(name)
        .and_then(|p| p.value)
        .map(|value| {
            value
                .split(separator)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Output directory for a leaf: its parent's node path, empty at top level.
pub fn default_output_path(node_path: &str) -> String {
    match parent_path(node_path) {
        Some(parent) if parent != ROOT => parent,
        _ => String::new(),
    }
}

/// Compile a single node whose inherited `context` already names it in its
/// ancestry. Never fails: provider and I/O failures are recorded in
/// [`CompiledNode::errors`] and the node is persisted as an inert leaf.
#[instrument(skip_all, fields(node = spec.name()))]
pub async fn compile_node<P: Provider>(
    spec: NodeSpec<'_>,
    context: &NodeContext,
    provider: &P,
    storage_root: &Path,
    options: &CompileOptions,
    shared: &CompileShared,
) -> CompiledNode {
    let node_path = build_node_path(&context.ancestry);
    let depth = context.ancestry.len().saturating_sub(1);
    let spec_text = spec.canonical_text();

    let (spec_hash, context_hash, reason) = if options.cache_enabled {
        let diff = diff_node(storage_root, &node_path, &spec_text, context);
        if !diff.needs_recompile
            && let Some(cached) = diff.cached
        {
            debug!(node_path, "cache hit");
            return CompiledNode {
                node_path,
                is_leaf: cached.is_leaf,
                cached_children: cached.children,
                declared: cached.declared,
                skipped: true,
                cache_reason: Some(CacheReason::Unchanged),
                ..CompiledNode::default()
            };
        }
        (diff.spec_hash, diff.context_hash, diff.reason)
    } else {
        (
            hash_content(&spec_text),
            hash_context(context),
            CacheReason::CacheDisabled,
        )
    };
    info!(node_path, reason = %reason, "compiling node");

    let mut compiled = CompiledNode {
        node_path: node_path.clone(),
        cache_reason: Some(reason),
        ..CompiledNode::default()
    };
    if let Err(err) = write_plan_file(storage_root, &node_path, &spec_text) {
        compiled.errors.push(io_error(&node_path, &err));
    }

    let mut declared = spec.inherited_parameters();
    let is_leaf = spec.marked_leaf()
        || depth >= options.governors.max_depth
        || (depth > 0
            && !spec.has_structural_children()
            && spec_text.len() < options.leaf_threshold_bytes
            && !spec_text.contains('{'));

    if !is_leaf {
        match spec {
            NodeSpec::Parsed(node) if spec.has_structural_children() => {
                compiled.children = structural_children(
                    node,
                    context,
                    &declared,
                    &node_path,
                    shared,
                    &mut compiled.errors,
                );
            }
            _ => {
                negotiate(
                    &spec_text,
                    context,
                    provider,
                    options,
                    shared,
                    &mut declared,
                    &mut compiled,
                )
                .await;
            }
        }
    }
    compiled.is_leaf = compiled.children.is_empty();
    compiled.declared = declared;

    let leaf = (compiled.is_leaf && compiled.errors.is_empty()).then(|| LeafArtifact {
        name: spec.name().to_string(),
        output_path: spec
            .output_override()
            .unwrap_or_else(|| default_output_path(&node_path)),
        source_spec_ref: spec.source().map_or_else(
            || format!("{node_path}/spec.plan"),
            |src| format!("{}:{}-{}", src.file, src.start_line, src.end_line),
        ),
        generation_prompt: spec_text.clone(),
        required_files: spec.required_files(),
        allowed_commands: spec.commands(),
    });
    let hashes = (spec_hash.as_str(), context_hash.as_str());
    if let Err(message) = persist(&compiled, context, spec.source(), leaf, storage_root, hashes) {
        compiled.errors.push(message);
    }

    shared.state.record_questions(compiled.questions.len());
    shared.state.record_errors(compiled.errors.len());
    if !compiled.errors.is_empty() {
        warn!(node_path, errors = compiled.errors.len(), "node recorded errors");
    }
    debug!(
        node_path,
        is_leaf = compiled.is_leaf,
        children = compiled.children.len(),
        "node compiled"
    );
    compiled
}

/// Compile the top of the tree.
pub async fn compile_root_node<P: Provider>(
    root: &SpecNode,
    provider: &P,
    storage_root: &Path,
    options: &CompileOptions,
    shared: &CompileShared,
) -> CompiledNode {
    let context = create_root_context();
    compile_node(
        NodeSpec::Parsed(root),
        &context,
        provider,
        storage_root,
        options,
        shared,
    )
    .await
}

/// Children written by the author. Invalid or duplicate names are dropped
/// and reported in `errors`.
fn structural_children(
    node: &SpecNode,
    context: &NodeContext,
    declared: &Declarations,
    node_path: &str,
    shared: &CompileShared,
    errors: &mut Vec<String>,
) -> Vec<ChildSpec> {
    let mut children = Vec::new();
    for child in node.structural_children() {
        let name = child.name();
        let claimed =
            validate_child_name(name).and_then(|()| shared.registry.claim(node_path, name));
        if let Err(err) = claimed {
            errors.push(err.to_string());
            continue;
        }
        let mut child_context = build_child_context(context, declared, name);
        if let SpecKind::QueryFilter { question, .. } = &child.kind
            && !child_context.query_matches.contains(question)
        {
            child_context.query_matches.push(question.clone());
        }
        let as_spec = NodeSpec::Parsed(child);
        children.push(ChildSpec {
            name: name.to_string(),
            is_leaf: child.is_marked_leaf(),
            spec_text: as_spec.canonical_text(),
            context: child_context,
            required_files: as_spec.required_files(),
            commands: as_spec.commands(),
            source: as_spec.source(),
        });
    }
    children
}

/// Run the bounded proposal loop with the oracle and fill `compiled`.
async fn negotiate<P: Provider>(
    spec_text: &str,
    context: &NodeContext,
    provider: &P,
    options: &CompileOptions,
    shared: &CompileShared,
    declared: &mut Declarations,
    compiled: &mut CompiledNode,
) {
    let node_path = compiled.node_path.clone();
    let node_path = node_path.as_str();
    let depth = context.ancestry.len().saturating_sub(1);
    let parent_name = context.ancestry.last().map_or(ROOT, String::as_str);
    let rules = ChildRules {
        parent_path: node_path,
        parent_name,
        parent_is_root: node_path == ROOT,
        child_depth: depth + 1,
        max_depth: options.governors.max_depth,
        registry: &shared.registry,
    };
    let mut negotiation = Negotiation::new(node_path, options.governors.negotiation_rounds);

    while let Some(feedback) = negotiation.begin_round() {
        if let Err(governor) = shared.state.try_start_call() {
            debug!(node_path, governor = %governor, "call governor refused oracle call");
            compiled
                .errors
                .push(PlanError::GovernorExceeded(governor).to_string());
            negotiation.abort();
            break;
        }
        let request = CompileRequest {
            spec: spec_text.to_string(),
            context: context.clone(),
            node_path: node_path.to_string(),
            feedback,
            accepted: negotiation.accepted_names(),
        };
        let response = match shared.call_slots.acquire().await {
            Ok(_permit) => provider.compile(&request).await,
            Err(err) => {
                compiled.errors.push(format!("oracle slots closed: {err}"));
                negotiation.abort();
                break;
            }
        };
        match response {
            Ok(response) => negotiation.apply(&rules, response),
            Err(err) => {
                warn!(node_path, err = %err, "oracle compile failed");
                compiled.errors.push(PlanError::from(err).to_string());
                negotiation.abort();
                break;
            }
        }
    }

    let settlement = negotiation.finish();
    debug!(
        node_path,
        rounds = settlement.rounds,
        accepted = settlement.accepted.len(),
        unresolved = settlement.unresolved.len(),
        "negotiation settled"
    );
    let oracle_declared = settlement.declared;
    declared.interfaces.extend(oracle_declared.interfaces);
    declared.constraints.extend(oracle_declared.constraints);
    declared.suggestions.extend(oracle_declared.suggestions);
    declared.utilities.extend(oracle_declared.utilities);

    compiled.children = settlement
        .accepted
        .into_iter()
        .map(|proposed| oracle_child(context, declared, proposed))
        .collect();
    compiled.questions = settlement.questions;
    compiled.considerations = settlement.considerations;
    compiled.rejections = settlement.unresolved;
}

fn oracle_child(
    context: &NodeContext,
    declared: &Declarations,
    proposed: ProposedChild,
) -> ChildSpec {
    let mut child_context = build_child_context(context, declared, &proposed.name);
    if let Some(hint) = proposed.context.map(|h| h.trim().to_string())
        && !hint.is_empty()
        && !child_context.suggestions.contains(&hint)
    {
        child_context.suggestions.push(hint);
    }
    ChildSpec {
        name: proposed.name,
        is_leaf: proposed.is_leaf,
        spec_text: proposed.spec,
        context: child_context,
        required_files: proposed.files,
        commands: proposed.commands,
        source: None,
    }
}

/// Write the context and questions artifacts and drop stale children.
fn persist(
    compiled: &CompiledNode,
    context: &NodeContext,
    source: Option<SourceRange>,
    leaf: Option<LeafArtifact>,
    storage_root: &Path,
    (spec_hash, context_hash): (&str, &str),
) -> Result<(), String> {
    let node_path = &compiled.node_path;
    let questions = QuestionsArtifact {
        questions: compiled.questions.clone(),
        considerations: compiled.considerations.clone(),
        rejections: compiled.rejections.clone(),
    };
    if questions.is_empty() {
        remove_questions_file(storage_root, node_path)
    } else {
        write_questions_file(storage_root, node_path, &questions)
    }
    .map_err(|e| io_error(node_path, &e))?;

    let artifact = PlanContext {
        node_path: node_path.clone(),
        is_leaf: compiled.is_leaf,
        context: context.clone(),
        declared: compiled.declared.clone(),
        children: compiled.children.clone(),
        leaf,
        source,
        errors: compiled.errors.clone(),
        cache: compiled
            .errors
            .is_empty()
            .then(|| create_cache_metadata(spec_hash, context_hash)),
    };
    write_context_file(storage_root, node_path, &artifact).map_err(|e| io_error(node_path, &e))?;

    let keep: Vec<String> = compiled.children.iter().map(|c| c.name.clone()).collect();
    let removed =
        prune_stale_children(storage_root, node_path, &keep).map_err(|e| io_error(node_path, &e))?;
    if !removed.is_empty() {
        debug!(node_path, ?removed, "pruned stale children");
    }
    Ok(())
}

fn io_error(node_path: &str, err: &anyhow::Error) -> String {
    PlanError::Io {
        path: node_path.to_string(),
        message: format!("{err:#}"),
    }
    .to_string()
}

/// Per-node line of the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub node_path: String,
    pub is_leaf: bool,
    pub skipped: bool,
    pub cache_reason: Option<CacheReason>,
    pub children: usize,
    pub errors: Vec<String>,
    pub questions: Vec<String>,
}

impl From<&CompiledNode> for NodeReport {
    fn from(node: &CompiledNode) -> Self {
        Self {
            node_path: node.node_path.clone(),
            is_leaf: node.is_leaf,
            skipped: node.skipped,
            cache_reason: node.cache_reason,
            children: node.children.len().max(node.cached_children.len()),
            errors: node.errors.clone(),
            questions: node.questions.clone(),
        }
    }
}

/// Outcome of a whole compilation run.
#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub totals: Totals,
    pub limit_reached: Option<Governor>,
    /// Every node that started, sorted by node path.
    pub nodes: Vec<NodeReport>,
}

impl CompileReport {
    pub fn cache_hits(&self) -> usize {
        self.nodes.iter().filter(|n| n.skipped).count()
    }

    /// `(node_path, error)` pairs across the run.
    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.nodes
            .iter()
            .flat_map(|n| n.errors.iter().map(|e| (n.node_path.as_str(), e.as_str())))
            .collect()
    }

    pub fn questions(&self) -> Vec<(&str, &str)> {
        self.nodes
            .iter()
            .flat_map(|n| n.questions.iter().map(|q| (n.node_path.as_str(), q.as_str())))
            .collect()
    }

    pub fn node(&self, node_path: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node_path == node_path)
    }

    pub fn exit_code(&self) -> i32 {
        if self.limit_reached.is_some() {
            exit_codes::LIMIT_REACHED
        } else if self.totals.errors > 0 {
            exit_codes::NODE_ERRORS
        } else {
            exit_codes::OK
        }
    }
}

struct CompileRun<'a, P> {
    provider: &'a P,
    storage_root: &'a Path,
    options: &'a CompileOptions,
    shared: &'a CompileShared,
}

/// Compile `root` and every descendant, honouring the governors.
#[instrument(skip_all, fields(storage_root = %storage_root.display()))]
pub async fn run_compile<P: Provider>(
    root: &SpecNode,
    provider: &P,
    storage_root: &Path,
    options: &CompileOptions,
) -> CompileReport {
    let shared = CompileShared::new(options.governors);
    let run = CompileRun {
        provider,
        storage_root,
        options,
        shared: &shared,
    };
    let mut nodes = compile_subtree(NodeSpec::Parsed(root), create_root_context(), &run).await;
    nodes.sort_by(|a, b| a.node_path.cmp(&b.node_path));

    let totals = shared.state.totals();
    let limit_reached = shared.state.limit_reached();
    info!(
        nodes = totals.total_nodes,
        completed = totals.completed_nodes,
        ai_calls = totals.ai_calls,
        errors = totals.errors,
        limit_reached = ?limit_reached,
        "compilation finished"
    );
    CompileReport {
        totals,
        limit_reached,
        nodes,
    }
}

fn compile_subtree<'a, P: Provider>(
    spec: NodeSpec<'a>,
    context: NodeContext,
    run: &'a CompileRun<'a, P>,
) -> LocalBoxFuture<'a, Vec<NodeReport>> {
    async move {
        if let Err(governor) = run.shared.state.try_start_node() {
            debug!(node = spec.name(), governor = %governor, "node governor refused node");
            return Vec::new();
        }
        let compiled = compile_node(
            spec,
            &context,
            run.provider,
            run.storage_root,
            run.options,
            run.shared,
        )
        .await;
        run.shared.state.finish_node();

        let mut reports = vec![NodeReport::from(&compiled)];
        let children = if compiled.skipped {
            &compiled.cached_children
        } else {
            &compiled.children
        };
        let branches = children.iter().map(|child| {
            let child_spec = match spec {
                NodeSpec::Parsed(node) => node
                    .structural_children()
                    .find(|c| c.name() == child.name)
                    .map_or(NodeSpec::Generated(child), NodeSpec::Parsed),
                NodeSpec::Generated(_) => NodeSpec::Generated(child),
            };
            compile_subtree(child_spec, child.context.clone(), run)
        });
        for branch in join_all(branches).await {
            reports.extend(branch);
        }
        reports
    }
    .boxed_local()
}
