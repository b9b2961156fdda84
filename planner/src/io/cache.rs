//! Cache decisions against the persisted plan tree.

use std::path::Path;

use tracing::{debug, warn};

use crate::core::hash::{hash_content, hash_context, summarize_changes};
use crate::core::types::{CacheReason, NodeContext};
use crate::io::plan_store::{PlanContext, read_context_file, read_plan_file};

/// Outcome of comparing a node against its last compilation.
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub needs_recompile: bool,
    pub reason: CacheReason,
    pub spec_hash: String,
    pub context_hash: String,
    /// Prior context artifact, present on a cache hit.
    pub cached: Option<PlanContext>,
}

/// Decide whether `node_path` must be recompiled.
///
/// A node is reusable only when both its spec text and its inherited context
/// hash to the values recorded at its last clean compilation. Missing,
/// unreadable or error-carrying artifacts all count as no prior artifact.
pub fn diff_node(
    storage_root: &Path,
    node_path: &str,
    spec_text: &str,
    context: &NodeContext,
) -> DiffResult {
    let spec_hash = hash_content(spec_text);
    let context_hash = hash_context(context);
    let result = |reason: CacheReason, cached: Option<PlanContext>| DiffResult {
        needs_recompile: reason != CacheReason::Unchanged,
        reason,
        spec_hash: spec_hash.clone(),
        context_hash: context_hash.clone(),
        cached,
    };

    let prior = match (
        read_plan_file(storage_root, node_path),
        read_context_file(storage_root, node_path),
    ) {
        (Ok(Some(_)), Ok(Some(prior))) => prior,
        (Err(err), _) | (_, Err(err)) => {
            warn!(node_path, err = %err, "unreadable plan artifact, recompiling");
            return result(CacheReason::NoPriorArtifact, None);
        }
        _ => return result(CacheReason::NoPriorArtifact, None),
    };
    let Some(record) = prior.cache.as_ref() else {
        return result(CacheReason::NoPriorArtifact, None);
    };

    if record.spec_hash != spec_hash {
        return result(CacheReason::SpecChanged, None);
    }
    if record.context_hash != context_hash {
        let changes = summarize_changes(&prior.context, context);
        debug!(node_path, ?changes, "inherited context changed");
        return result(CacheReason::ContextChanged, None);
    }
    result(CacheReason::Unchanged, Some(prior))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::context::{build_child_context, create_root_context};
    use crate::core::hash::create_cache_metadata;
    use crate::core::types::{ConstraintDecl, Declarations};
    use crate::io::plan_store::{write_context_file, write_plan_file};

    fn persist(root: &Path, node_path: &str, spec: &str, context: &NodeContext, cached: bool) {
        write_plan_file(root, node_path, spec).expect("plan");
        let cache =
            cached.then(|| create_cache_metadata(&hash_content(spec), &hash_context(context)));
        let artifact = PlanContext {
            node_path: node_path.to_string(),
            is_leaf: true,
            context: context.clone(),
            declared: Declarations::default(),
            children: Vec::new(),
            leaf: None,
            source: None,
            errors: Vec::new(),
            cache,
        };
        write_context_file(root, node_path, &artifact).expect("context");
    }

    #[test]
    fn unseen_node_needs_compiling() {
        let temp = tempfile::tempdir().expect("tempdir");
        let diff = diff_node(temp.path(), "api", "api {}", &create_root_context());
        assert!(diff.needs_recompile);
        assert_eq!(diff.reason, CacheReason::NoPriorArtifact);
    }

    #[test]
    fn identical_input_is_a_hit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = create_root_context();
        persist(temp.path(), "api", "api {}", &ctx, true);

        let diff = diff_node(temp.path(), "api", "api {}", &ctx);
        assert!(!diff.needs_recompile);
        assert_eq!(diff.reason, CacheReason::Unchanged);
        assert!(diff.cached.is_some());
    }

    #[test]
    fn spec_change_wins_over_context_change() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = create_root_context();
        persist(temp.path(), "api", "api {}", &ctx, true);

        let mut declared = Declarations::default();
        declared.constraints.push(ConstraintDecl {
            rule: "Must log".to_string(),
            declaring_node: "root".to_string(),
        });
        let changed_ctx = build_child_context(&ctx, &declared, "api");

        let diff = diff_node(temp.path(), "api", "api { x }", &changed_ctx);
        assert_eq!(diff.reason, CacheReason::SpecChanged);
        let diff = diff_node(temp.path(), "api", "api {}", &changed_ctx);
        assert_eq!(diff.reason, CacheReason::ContextChanged);
        assert_eq!(diff.reason.as_str(), "context changed");
    }

    #[test]
    fn errored_or_corrupt_artifacts_are_not_reused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = create_root_context();
        persist(temp.path(), "errored", "e {}", &ctx, false);
        assert_eq!(
            diff_node(temp.path(), "errored", "e {}", &ctx).reason,
            CacheReason::NoPriorArtifact
        );

        persist(temp.path(), "corrupt", "c {}", &ctx, true);
        fs::write(temp.path().join("corrupt/context.json"), "{").expect("corrupt");
        assert_eq!(
            diff_node(temp.path(), "corrupt", "c {}", &ctx).reason,
            CacheReason::NoPriorArtifact
        );
    }
}
