//! Build runtime: turns the leaves of a persisted plan tree into files.
//!
//! Leaves are discovered from the plan tree alone, so a build never needs
//! the spec tree. Each leaf runs its allow-listed setup commands, asks
//! the oracle for its files, and writes them under the build root. Every
//! side effect is appended to the operation log. One leaf failing never
//! stops the others.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::compile::default_output_path;
use crate::core::commands::{NOT_WHITELISTED, is_allowed, split_command};
use crate::core::path::{PLAN_FILE, is_safe_relative};
use crate::core::provenance::provenance_header;
use crate::core::registry::FileOwnershipRegistry;
use crate::core::sourcemap::{SourceMap, SourceMapBuilder};
use crate::core::types::{GenerateRequest, LeafArtifact, NodeContext};
use crate::error::PlanError;
use crate::exit_codes;
use crate::io::config::PlannerConfig;
use crate::io::oplog::OperationLog;
use crate::io::plan_store::{
    child_node_dirs, list_plan_nodes, node_dir, read_context_file, read_plan_file,
    write_source_maps,
};
use crate::io::process::run_command_with_timeout;
use crate::io::provider::Provider;
use crate::spec::SourceRange;

/// Per-run knobs for the build runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub parallelism: usize,
    /// Remove the build root before generating.
    pub clean: bool,
    pub add_source_headers: bool,
    /// Setup commands a leaf may run.
    pub allow: Vec<String>,
    pub command_timeout: Duration,
    pub command_output_limit_bytes: usize,
    pub operation_log: PathBuf,
}

impl BuildOptions {
    pub fn from_config(config: &PlannerConfig, operation_log: &Path) -> Self {
        Self {
            parallelism: config.build.parallelism,
            clean: config.build.clean,
            add_source_headers: config.build.add_source_headers,
            allow: config.commands.allow.clone(),
            command_timeout: Duration::from_secs(config.commands.timeout_secs),
            command_output_limit_bytes: config.commands.output_limit_bytes,
            operation_log: operation_log.to_path_buf(),
        }
    }
}

/// A persisted node with no persisted children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeafNode {
    pub node_path: String,
    /// `None` when the plan file is missing.
    pub spec_text: Option<String>,
    pub context: NodeContext,
    pub artifact: Option<LeafArtifact>,
    pub source: Option<SourceRange>,
    /// Errors recorded when the node was compiled.
    pub compile_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct LeafResult {
    pub node_path: String,
    pub success: bool,
    /// Written files, relative to the build root.
    pub files: Vec<String>,
    pub questions: Vec<String>,
    pub rejected_commands: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct BuildReport {
    pub total_leaves: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub files: Vec<String>,
    pub questions: Vec<String>,
    pub errors: Vec<String>,
    /// Per-leaf results, sorted by node path.
    pub leaves: Vec<LeafResult>,
}

impl BuildReport {
    pub fn exit_code(&self) -> i32 {
        if self.failure_count > 0 {
            exit_codes::NODE_ERRORS
        } else {
            exit_codes::OK
        }
    }
}

/// Shared across every leaf of one build.
#[derive(Debug)]
pub struct BuildShared {
    pub files: FileOwnershipRegistry,
    pub oplog: OperationLog,
}

impl BuildShared {
    pub fn new(oplog: OperationLog) -> Self {
        Self {
            files: FileOwnershipRegistry::new(),
            oplog,
        }
    }

    /// Log failures must not fail the leaf; they only warn.
    fn log(&self, result: Result<()>) {
        if let Err(err) = result {
            warn!(err = %err, log = %self.oplog.path().display(), "operation log write failed");
        }
    }
}

/// Every leaf of the plan tree, sorted by node path.
///
/// A leaf whose artifacts cannot be read is still returned, carrying the
/// read error in `compile_errors`, so it fails alone during the build.
pub fn discover_leaf_nodes(storage_root: &Path) -> Result<Vec<LeafNode>> {
    let mut leaves = Vec::new();
    for node_path in list_plan_nodes(storage_root)? {
        if !child_node_dirs(&node_dir(storage_root, &node_path))?.is_empty() {
            continue;
        }
        match read_leaf(storage_root, &node_path) {
            Ok(Some(leaf)) => leaves.push(leaf),
            Ok(None) => {}
            Err(err) => {
                let err = format!("{err:#}");
                warn!(node_path = %node_path, err = %err, "unreadable plan artifact");
                leaves.push(LeafNode {
                    compile_errors: vec![format!("unreadable plan artifact: {err}")],
                    node_path,
                    spec_text: None,
                    context: NodeContext::default(),
                    artifact: None,
                    source: None,
                });
            }
        }
    }
    Ok(leaves)
}

fn read_leaf(storage_root: &Path, node_path: &str) -> Result<Option<LeafNode>> {
    // Decomposed nodes whose children never compiled are not leaves.
    let Some(ctx) = read_context_file(storage_root, node_path)?.filter(|c| c.is_leaf) else {
        return Ok(None);
    };
    Ok(Some(LeafNode {
        node_path: node_path.to_string(),
        spec_text: read_plan_file(storage_root, node_path)?,
        context: ctx.context,
        artifact: ctx.leaf,
        source: ctx.source,
        compile_errors: ctx.errors,
    }))
}

/// Generate one leaf. Never fails; problems land in [`LeafResult::errors`].
#[instrument(skip_all, fields(node_path = %leaf.node_path))]
pub async fn execute_generator<P: Provider>(
    leaf: &LeafNode,
    provider: &P,
    storage_root: &Path,
    build_root: &Path,
    options: &BuildOptions,
    shared: &BuildShared,
) -> LeafResult {
    let node_path = leaf.node_path.as_str();
    let mut result = LeafResult {
        node_path: node_path.to_string(),
        ..LeafResult::default()
    };
    let generated = generate_leaf(
        leaf,
        provider,
        storage_root,
        build_root,
        options,
        shared,
        &mut result,
    )
    .await;
    if let Err(message) = generated {
        shared.log(shared.oplog.error(node_path, &message));
        result.errors.push(message);
    }
    result.success = result.errors.is_empty();
    if result.success {
        info!(files = result.files.len(), "leaf generated");
    } else {
        warn!(errors = ?result.errors, "leaf failed");
    }
    result
}

async fn generate_leaf<P: Provider>(
    leaf: &LeafNode,
    provider: &P,
    storage_root: &Path,
    build_root: &Path,
    options: &BuildOptions,
    shared: &BuildShared,
    result: &mut LeafResult,
) -> Result<(), String> {
    let node_path = leaf.node_path.as_str();
    if !leaf.compile_errors.is_empty() {
        return Err(format!(
            "node recorded compile errors: {}",
            leaf.compile_errors.join("; ")
        ));
    }
    let Some(spec_text) = leaf.spec_text.as_deref() else {
        return Err(PlanError::MissingPlan(node_path.to_string()).to_string());
    };
    let artifact = leaf
        .artifact
        .clone()
        .unwrap_or_else(|| synthesized_artifact(node_path, spec_text));
    if !artifact.output_path.is_empty() && !is_safe_relative(&artifact.output_path) {
        return Err(format!("unsafe output path '{}'", artifact.output_path));
    }
    let out_dir = build_root.join(&artifact.output_path);

    for command in &artifact.allowed_commands {
        run_setup_command(node_path, command, &out_dir, options, shared, result).await?;
    }

    let request = GenerateRequest {
        spec: artifact.generation_prompt.clone(),
        context: leaf.context.clone(),
        node_path: node_path.to_string(),
        required_files: artifact.required_files.clone(),
    };
    let response = provider
        .generate(&request)
        .await
        .map_err(|err| PlanError::from(err).to_string())?;
    shared.log(shared.oplog.generation_call(node_path, response.files.len()));
    result.questions = response.questions;

    let source = leaf.source.clone().unwrap_or_else(|| SourceRange {
        file: format!("{node_path}/{PLAN_FILE}"),
        start_line: 1,
        end_line: u32::try_from(spec_text.lines().count().max(1)).unwrap_or(u32::MAX),
    });
    let mut maps = BTreeMap::new();
    let mut returned = Vec::new();
    for file in &response.files {
        returned.push(file.path.trim_start_matches("./").to_string());
        match write_generated_file(
            node_path,
            &artifact,
            &file.path,
            &file.content,
            &source,
            &out_dir,
            options,
            shared,
        ) {
            Ok(map) => {
                result.files.push(join_rel(&artifact.output_path, &file.path));
                maps.insert(file.path.clone(), map);
            }
            Err(message) => {
                shared.log(shared.oplog.error(node_path, &message));
                result.errors.push(message);
            }
        }
    }
    for required in &artifact.required_files {
        if !returned.iter().any(|p| p == required.trim_start_matches("./")) {
            result
                .errors
                .push(format!("required file '{required}' missing from response"));
        }
    }
    if !maps.is_empty() {
        write_source_maps(storage_root, node_path, &maps).map_err(|err| format!("{err:#}"))?;
    }
    Ok(())
}

fn synthesized_artifact(node_path: &str, spec_text: &str) -> LeafArtifact {
    LeafArtifact {
        name: crate::core::path::leaf_name(node_path).to_string(),
        output_path: default_output_path(node_path),
        source_spec_ref: format!("{node_path}/{PLAN_FILE}"),
        generation_prompt: spec_text.to_string(),
        required_files: Vec::new(),
        allowed_commands: Vec::new(),
    }
}

fn join_rel(output_path: &str, file: &str) -> String {
    let file = file.trim_start_matches("./");
    if output_path.is_empty() {
        file.to_string()
    } else {
        format!("{output_path}/{file}")
    }
}

/// Run one declared setup command if the allow-list permits it.
///
/// Refused commands are logged and skipped; a failing or timed-out command
/// aborts the leaf.
async fn run_setup_command(
    node_path: &str,
    command: &str,
    out_dir: &Path,
    options: &BuildOptions,
    shared: &BuildShared,
    result: &mut LeafResult,
) -> Result<(), String> {
    let parts = split_command(command).filter(|_| is_allowed(command, &options.allow));
    let Some((program, args)) = parts else {
        let rejection = PlanError::CommandRejected {
            command: command.to_string(),
            reason: NOT_WHITELISTED.to_string(),
        };
        warn!(node_path, %rejection, "command not run");
        shared.log(shared.oplog.command(node_path, command, &rejection.to_string()));
        result.rejected_commands.push(command.to_string());
        return Ok(());
    };

    fs::create_dir_all(out_dir)
        .map_err(|err| format!("create output dir {}: {err}", out_dir.display()))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(out_dir);
    let timeout = options.command_timeout;
    let limit = options.command_output_limit_bytes;
    debug!(node_path, command, "running setup command");
    let output =
        tokio::task::spawn_blocking(move || run_command_with_timeout(cmd, None, timeout, limit))
            .await
            .map_err(|err| format!("command task failed: {err}"))?;

    let (outcome, failure) = match output {
        Ok(output) if output.timed_out => (
            "timed out".to_string(),
            Some(
                PlanError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                }
                .to_string(),
            ),
        ),
        Ok(output) if output.status.success() => ("ok".to_string(), None),
        Ok(output) => {
            let outcome = format!("exit {:?}", output.status.code());
            let message = format!(
                "command '{command}' failed ({outcome}): {}",
                output.stderr_tail(500)
            );
            (outcome, Some(message))
        }
        Err(err) => (
            "spawn failed".to_string(),
            Some(format!("command '{command}' could not run: {err:#}")),
        ),
    };
    shared.log(shared.oplog.command(node_path, command, &outcome));
    match failure {
        Some(message) => Err(message),
        None => Ok(()),
    }
}

/// Claim, decorate and write one generated file. Returns its source map.
#[allow(clippy::too_many_arguments)]
fn write_generated_file(
    node_path: &str,
    artifact: &LeafArtifact,
    rel_path: &str,
    content: &str,
    source: &SourceRange,
    out_dir: &Path,
    options: &BuildOptions,
    shared: &BuildShared,
) -> Result<SourceMap, String> {
    if !is_safe_relative(rel_path) {
        return Err(format!("unsafe file path '{rel_path}'"));
    }
    let filename = rel_path.trim_start_matches("./");
    shared
        .files
        .register(&artifact.output_path, filename, node_path)
        .map_err(|err| err.to_string())?;

    let header = options
        .add_source_headers
        .then(|| provenance_header(filename, &artifact.source_spec_ref, node_path))
        .flatten()
        .unwrap_or_default();
    let header_lines = u32::try_from(header.lines().count()).unwrap_or(u32::MAX);
    let body_lines = u32::try_from(content.lines().count()).unwrap_or(u32::MAX);

    let mut builder = SourceMapBuilder::new();
    if header_lines > 0 {
        builder.add_range_mapping(1, header_lines, &head_of(source));
    }
    if body_lines > 0 {
        builder.add_range_mapping(header_lines + 1, header_lines + body_lines, source);
    }

    let target = out_dir.join(filename);
    write_file(&target, &format!("{header}{content}")).map_err(|err| format!("{err:#}"))?;
    let written = join_rel(&artifact.output_path, filename);
    let bytes = header.len() + content.len();
    shared.log(shared.oplog.file_write(node_path, &written, bytes));
    Ok(builder.build())
}

fn head_of(source: &SourceRange) -> SourceRange {
    SourceRange {
        end_line: source.start_line,
        ..source.clone()
    }
}

/// True if `inner` is `outer` or lies below it.
fn contains_path(outer: &Path, inner: &Path) -> bool {
    let resolve = |p: &Path| fs::canonicalize(p).or_else(|_| std::path::absolute(p));
    match (resolve(outer), resolve(inner)) {
        (Ok(outer), Ok(inner)) => inner.starts_with(outer),
        _ => false,
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Generate every leaf of the plan tree with at most `parallelism` in flight.
#[instrument(
    skip_all,
    fields(build_root = %build_root.display(), parallelism = options.parallelism)
)]
pub async fn run_build<P: Provider>(
    provider: &P,
    storage_root: &Path,
    build_root: &Path,
    options: &BuildOptions,
) -> Result<BuildReport> {
    let leaves = discover_leaf_nodes(storage_root)?;
    if options.clean && build_root.exists() {
        if contains_path(build_root, storage_root) {
            bail!(
                "refusing to clean {}: it contains the plan store {}",
                build_root.display(),
                storage_root.display()
            );
        }
        fs::remove_dir_all(build_root)
            .with_context(|| format!("clean build root {}", build_root.display()))?;
    }
    fs::create_dir_all(build_root)
        .with_context(|| format!("create build root {}", build_root.display()))?;
    let shared = BuildShared::new(OperationLog::open(&options.operation_log)?);
    info!(leaves = leaves.len(), "starting build");

    let mut results: Vec<LeafResult> = stream::iter(leaves.iter())
        .map(|leaf| execute_generator(leaf, provider, storage_root, build_root, options, &shared))
        .buffer_unordered(options.parallelism.max(1))
        .collect()
        .await;
    results.sort_by(|a, b| a.node_path.cmp(&b.node_path));

    let mut report = BuildReport {
        total_leaves: results.len(),
        ..BuildReport::default()
    };
    for leaf in &results {
        if leaf.success {
            report.success_count += 1;
        } else {
            report.failure_count += 1;
        }
        report.files.extend(leaf.files.iter().cloned());
        report.questions.extend(leaf.questions.iter().cloned());
        report.errors.extend(
            leaf.errors
                .iter()
                .map(|err| format!("{}: {err}", leaf.node_path)),
        );
    }
    report.leaves = results;
    info!(
        success = report.success_count,
        failure = report.failure_count,
        files = report.files.len(),
        "build finished"
    );
    Ok(report)
}
