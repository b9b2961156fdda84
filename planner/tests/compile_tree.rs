//! End-to-end compilation runs against a scripted oracle.
//!
//! Each test compiles a small spec tree into a temporary plan directory and
//! checks the persisted artifacts, the run totals and the cache decisions.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use planner::compile::{CompileOptions, run_compile};
use planner::core::governor::Governor;
use planner::core::types::{CacheReason, CompileResponse};
use planner::exit_codes;
use planner::io::plan_store::read_context_file;
use planner::test_support::{
    ScriptedProvider, child, leaf_module, module, module_with, param, prose, root,
};

fn server_tree(text: &str) -> planner::spec::SpecNode {
    root(vec![module("server", vec![prose(text)])])
}

fn router_reply() -> CompileResponse {
    CompileResponse {
        children: vec![child("router", true, "Route requests")],
        constraints: vec!["Must validate input".to_string()],
        ..CompileResponse::default()
    }
}

/// Every file under `dir` with its contents, keyed by relative path.
fn snapshot(dir: &Path) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    collect(dir, dir, &mut files);
    files
}

fn collect(base: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
    for entry in fs::read_dir(dir).expect("read dir") {
        let path = entry.expect("entry").path();
        if path.is_dir() {
            collect(base, &path, out);
        } else {
            let rel = path.strip_prefix(base).expect("relative");
            let contents = fs::read_to_string(&path).expect("read file");
            out.insert(rel.display().to_string(), contents);
        }
    }
}

#[tokio::test]
async fn oracle_children_inherit_declared_constraints() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider = ScriptedProvider::new().compile_reply("server", router_reply());
    let tree = server_tree("Handles requests");

    let report = run_compile(&tree, &provider, temp.path(), &CompileOptions::default()).await;

    assert_eq!(provider.compile_calls(), 1);
    assert_eq!(report.exit_code(), exit_codes::OK);
    let server = read_context_file(temp.path(), "server")
        .expect("read")
        .expect("server persisted");
    assert!(!server.is_leaf);
    assert_eq!(server.children[0].name, "router");

    let router = read_context_file(temp.path(), "server/router")
        .expect("read")
        .expect("router persisted");
    assert!(router.is_leaf);
    let rules: Vec<&str> = router
        .context
        .constraints
        .iter()
        .map(|c| c.rule.as_str())
        .collect();
    assert_eq!(rules, vec!["Must validate input"]);
    assert_eq!(router.context.constraints[0].declaring_node, "server");
    assert_eq!(router.leaf.expect("artifact").output_path, "server");
}

#[tokio::test]
async fn unchanged_rerun_is_served_from_cache() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tree = server_tree("Handles requests");
    let first_provider = ScriptedProvider::new().compile_reply("server", router_reply());
    let first = run_compile(&tree, &first_provider, temp.path(), &CompileOptions::default()).await;
    let before = snapshot(temp.path());

    let second_provider = ScriptedProvider::new().compile_reply("server", router_reply());
    let second =
        run_compile(&tree, &second_provider, temp.path(), &CompileOptions::default()).await;

    assert_eq!(second_provider.compile_calls(), 0);
    assert_eq!(second.totals.ai_calls, 0);
    assert_eq!(second.totals.completed_nodes, first.totals.completed_nodes);
    assert_eq!(second.cache_hits(), second.nodes.len());
    assert!(
        second
            .nodes
            .iter()
            .all(|n| n.cache_reason == Some(CacheReason::Unchanged))
    );
    assert_eq!(snapshot(temp.path()), before);
}

#[tokio::test]
async fn node_ceiling_halts_after_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider = ScriptedProvider::new();
    let tree = root(vec![
        module("api", vec![leaf_module("users", Vec::new())]),
        leaf_module("web", Vec::new()),
        leaf_module("jobs", Vec::new()),
    ]);
    let mut options = CompileOptions::default();
    options.governors.max_nodes = 1;

    let report = run_compile(&tree, &provider, temp.path(), &options).await;

    assert_eq!(report.limit_reached, Some(Governor::Nodes));
    assert_eq!(report.totals.completed_nodes, 1);
    assert_eq!(report.nodes.len(), 1);
    assert_eq!(report.nodes[0].node_path, "root");
    assert_eq!(report.exit_code(), exit_codes::LIMIT_REACHED);
    assert!(read_context_file(temp.path(), "api").expect("read").is_none());
}

#[tokio::test]
async fn call_ceiling_is_recorded_on_the_refused_node() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider = ScriptedProvider::new();
    let tree = root(vec![module("server", vec![prose("Handles {requests}")])]);
    let mut options = CompileOptions::default();
    options.governors.max_calls = 0;

    let report = run_compile(&tree, &provider, temp.path(), &options).await;

    assert_eq!(provider.compile_calls(), 0);
    assert_eq!(report.limit_reached, Some(Governor::Calls));
    let server = report.node("server").expect("server started");
    assert!(server.errors[0].contains("calls"));
    assert_eq!(report.exit_code(), exit_codes::LIMIT_REACHED);
}

#[tokio::test]
async fn edited_node_recompiles_alone() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tree = |server_text: &str| {
        root(vec![
            module("server", vec![prose(server_text)]),
            module("client", vec![prose("Renders pages")]),
        ])
    };
    let provider = ScriptedProvider::new()
        .compile_reply("server", router_reply())
        .compile_reply(
            "client",
            CompileResponse {
                children: vec![child("view", true, "Draw the page")],
                ..CompileResponse::default()
            },
        );
    run_compile(
        &tree("Handles requests"),
        &provider,
        temp.path(),
        &CompileOptions::default(),
    )
    .await;
    assert_eq!(provider.compile_calls(), 2);

    let report = run_compile(
        &tree("Handles requests quickly"),
        &provider,
        temp.path(),
        &CompileOptions::default(),
    )
    .await;

    let server = report.node("server").expect("server");
    assert_eq!(server.cache_reason, Some(CacheReason::SpecChanged));
    assert!(!server.skipped);
    for sibling in ["client", "client/view"] {
        assert!(report.node(sibling).expect("sibling").skipped, "{sibling}");
    }
    assert_eq!(provider.compile_requests("client").len(), 1);
    assert_eq!(provider.compile_requests("server").len(), 2);
}

#[tokio::test]
async fn changed_parent_parameter_invalidates_descendants_only() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tree = |auth: &str| {
        root(vec![
            module_with(
                "api",
                vec![param("auth", Some(auth))],
                vec![
                    leaf_module("users", vec![prose("List users")]),
                    leaf_module("orders", vec![prose("List orders")]),
                ],
            ),
            leaf_module("web", vec![prose("Serve pages")]),
        ])
    };
    let provider = ScriptedProvider::new();
    run_compile(&tree("token"), &provider, temp.path(), &CompileOptions::default()).await;

    let report =
        run_compile(&tree("jwt"), &provider, temp.path(), &CompileOptions::default()).await;

    assert_eq!(provider.compile_calls(), 0);
    assert_eq!(
        report.node("api").expect("api").cache_reason,
        Some(CacheReason::SpecChanged)
    );
    for descendant in ["api/orders", "api/users"] {
        let node = report.node(descendant).expect("descendant");
        assert_eq!(node.cache_reason, Some(CacheReason::ContextChanged));
    }
    assert!(report.node("web").expect("web").skipped);
    let users = read_context_file(temp.path(), "api/users")
        .expect("read")
        .expect("users");
    assert_eq!(
        users.context.parameters.get("auth").map(String::as_str),
        Some("jwt")
    );
}

#[tokio::test]
async fn always_recursing_oracle_stops_at_depth_ceiling() {
    let temp = tempfile::tempdir().expect("tempdir");
    let max_depth = 3;
    let provider = ScriptedProvider::new().compile_with(move |request| {
        let depth = request.context.ancestry.len() - 1;
        assert!(depth < max_depth, "decomposed {}", request.node_path);
        CompileResponse {
            children: vec![child(&format!("part{depth}"), false, "More {detail}")],
            ..CompileResponse::default()
        }
    });
    let tree = root(vec![module("system", vec![prose("Design {everything}")])]);
    let mut options = CompileOptions::default();
    options.governors.max_depth = max_depth;

    let report = run_compile(&tree, &provider, temp.path(), &options).await;

    assert_eq!(report.limit_reached, None);
    assert_eq!(provider.compile_calls(), 2);
    for node in &report.nodes {
        let depth = node.node_path.split('/').count();
        assert!(depth <= max_depth, "{}", node.node_path);
        if depth == max_depth {
            assert!(node.is_leaf, "{}", node.node_path);
        }
    }
    assert!(report.node("system/part1/part2").is_some());
}

#[tokio::test]
async fn empty_decomposition_still_yields_a_leaf() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider = ScriptedProvider::new().compile_reply("server", CompileResponse::default());
    let tree = server_tree("Handles {requests}");

    let report = run_compile(&tree, &provider, temp.path(), &CompileOptions::default()).await;

    assert_eq!(provider.compile_calls(), 1);
    assert!(report.node("server").expect("server").is_leaf);
    let server = read_context_file(temp.path(), "server")
        .expect("read")
        .expect("server persisted");
    assert!(server.is_leaf);
    let artifact = server.leaf.expect("synthesized artifact");
    assert_eq!(artifact.name, "server");
    assert!(artifact.generation_prompt.contains("Handles {requests}"));
}

#[tokio::test]
async fn recompiled_parent_prunes_dropped_children() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = ScriptedProvider::new().compile_reply("server", router_reply());
    run_compile(
        &server_tree("Handles requests"),
        &first,
        temp.path(),
        &CompileOptions::default(),
    )
    .await;
    assert!(temp.path().join("server/router").is_dir());

    let second = ScriptedProvider::new().compile_reply(
        "server",
        CompileResponse {
            children: vec![child("handlers", true, "Handle requests")],
            ..CompileResponse::default()
        },
    );
    run_compile(
        &server_tree("Handles all requests"),
        &second,
        temp.path(),
        &CompileOptions::default(),
    )
    .await;

    assert!(!temp.path().join("server/router").exists());
    assert!(temp.path().join("server/handlers").is_dir());
}

#[tokio::test]
async fn new_oracle_constraint_reaches_existing_grandchild() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tree = |auth: &str| {
        root(vec![module_with(
            "api",
            vec![param("auth", Some(auth))],
            vec![module("server", vec![prose("Handles {requests}")])],
        )])
    };
    let reply = |rule: &str| CompileResponse {
        children: vec![child("router", true, "Route requests")],
        constraints: vec![rule.to_string()],
        ..CompileResponse::default()
    };
    let provider = ScriptedProvider::new()
        .compile_reply("api/server", reply("A"))
        .compile_reply("api/server", reply("B"));
    run_compile(&tree("x"), &provider, temp.path(), &CompileOptions::default()).await;

    let report = run_compile(&tree("y"), &provider, temp.path(), &CompileOptions::default()).await;

    assert_eq!(provider.compile_requests("api/server").len(), 2);
    let router = report.node("api/server/router").expect("router");
    assert_eq!(router.cache_reason, Some(CacheReason::ContextChanged));
    let persisted = read_context_file(temp.path(), "api/server/router")
        .expect("read")
        .expect("router persisted");
    let rules: Vec<&str> = persisted
        .context
        .constraints
        .iter()
        .map(|c| c.rule.as_str())
        .collect();
    assert!(rules.contains(&"B"), "{rules:?}");
    assert!(!rules.contains(&"A"), "{rules:?}");
}

#[tokio::test]
async fn short_unmarked_oracle_child_becomes_leaf_without_a_call() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider = ScriptedProvider::new().compile_reply(
        "server",
        CompileResponse {
            children: vec![child("router", false, "Route requests")],
            ..CompileResponse::default()
        },
    );

    let report = run_compile(
        &server_tree("Handles {requests}"),
        &provider,
        temp.path(),
        &CompileOptions::default(),
    )
    .await;

    assert_eq!(provider.compile_calls(), 1);
    assert!(provider.compile_requests("server/router").is_empty());
    assert!(report.node("server/router").expect("router").is_leaf);
    let router = read_context_file(temp.path(), "server/router")
        .expect("read")
        .expect("router persisted");
    assert!(router.is_leaf);
    assert_eq!(router.leaf.expect("artifact").name, "router");
}

fn wide_tree() -> planner::spec::SpecNode {
    root(
        ["auth", "billing", "search", "users"]
            .into_iter()
            .map(|name| module(name, vec![prose("Handles {requests}")]))
            .collect(),
    )
}

#[tokio::test]
async fn parallel_ceiling_of_one_serializes_oracle_calls() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider = ScriptedProvider::new();
    let mut options = CompileOptions::default();
    options.governors.max_parallel = 1;

    let report = run_compile(&wide_tree(), &provider, temp.path(), &options).await;

    assert_eq!(report.exit_code(), exit_codes::OK);
    assert_eq!(provider.compile_calls(), 4);
    assert_eq!(provider.peak_in_flight(), 1);
}

#[tokio::test]
async fn siblings_share_parallel_slots() {
    let temp = tempfile::tempdir().expect("tempdir");
    let provider = ScriptedProvider::new();
    let mut options = CompileOptions::default();
    options.governors.max_parallel = 4;

    run_compile(&wide_tree(), &provider, temp.path(), &options).await;

    assert_eq!(provider.compile_calls(), 4);
    assert!(provider.peak_in_flight() > 1);
    assert!(provider.peak_in_flight() <= 4);
}
