//! Compile a tree, then generate its leaves into a temporary build root.

use std::fs;
use std::path::Path;

use planner::build::{BuildOptions, BuildReport, run_build};
use planner::compile::{CompileOptions, run_compile};
use planner::core::types::GenerateResponse;
use planner::exit_codes;
use planner::io::config::PlannerConfig;
use planner::io::oplog::{OpEvent, read_operation_log};
use planner::spec::SpecNode;
use planner::test_support::{ScriptedProvider, file, module, module_with, param, prose, root};

struct Workspace {
    _temp: tempfile::TempDir,
    root: std::path::PathBuf,
    plan: std::path::PathBuf,
    build: std::path::PathBuf,
    oplog: std::path::PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        Self {
            root: temp.path().to_path_buf(),
            plan: temp.path().join("plan"),
            build: temp.path().join("build"),
            oplog: temp.path().join("operations.jsonl"),
            _temp: temp,
        }
    }

    fn options(&self, allow: &[&str]) -> BuildOptions {
        let mut config = PlannerConfig::default();
        config.build.parallelism = 1;
        config.commands.allow = allow.iter().map(|s| s.to_string()).collect();
        BuildOptions::from_config(&config, &self.oplog)
    }

    async fn compile_and_build(
        &self,
        tree: &SpecNode,
        provider: &ScriptedProvider,
        allow: &[&str],
    ) -> BuildReport {
        let compiled = run_compile(tree, provider, &self.plan, &CompileOptions::default()).await;
        assert_eq!(compiled.exit_code(), exit_codes::OK, "{:?}", compiled.errors());
        run_build(provider, &self.plan, &self.build, &self.options(allow))
            .await
            .expect("build")
    }
}

fn leaf(name: &str, params: &[(&str, &str)], text: &str) -> SpecNode {
    let mut parameters = vec![param("leaf", None)];
    parameters.extend(params.iter().map(|(k, v)| param(k, Some(v))));
    module_with(name, parameters, vec![prose(text)])
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).expect("read generated file")
}

#[tokio::test]
async fn required_files_are_written_with_provenance() {
    let ws = Workspace::new();
    let tree = root(vec![leaf(
        "logger",
        &[("files", "logger.impl, logger.spec")],
        "Write logs",
    )]);
    let provider = ScriptedProvider::new().generate_reply(
        "logger",
        GenerateResponse {
            files: vec![
                file("logger.impl", "log = print\n"),
                file("logger.spec", "expect log\n"),
            ],
            ..GenerateResponse::default()
        },
    );

    let report = ws.compile_and_build(&tree, &provider, &[]).await;

    assert_eq!(report.files, vec!["logger.impl", "logger.spec"]);
    assert_eq!(report.success_count, 1);
    assert_eq!(report.failure_count, 0);
    assert_eq!(report.exit_code(), exit_codes::OK);
    for name in ["logger.impl", "logger.spec"] {
        let contents = read(&ws.build.join(name));
        assert!(contents.starts_with("# Generated from "), "{contents}");
        assert!(contents.contains("Plan node: logger."));
    }
    let requests = provider.generate_requests();
    assert_eq!(requests[0].required_files, vec!["logger.impl", "logger.spec"]);
}

#[tokio::test]
async fn missing_required_file_fails_the_leaf() {
    let ws = Workspace::new();
    let tree = root(vec![leaf(
        "logger",
        &[("files", "logger.impl,logger.spec")],
        "Write logs",
    )]);
    let provider = ScriptedProvider::new().generate_reply(
        "logger",
        GenerateResponse {
            files: vec![file("logger.impl", "log = print\n")],
            ..GenerateResponse::default()
        },
    );

    let report = ws.compile_and_build(&tree, &provider, &[]).await;

    assert_eq!(report.failure_count, 1);
    assert!(report.errors[0].contains("logger.spec"));
    assert_eq!(report.exit_code(), exit_codes::NODE_ERRORS);
}

#[cfg(unix)]
#[tokio::test]
async fn only_allow_listed_commands_run() {
    let ws = Workspace::new();
    let tree = root(vec![module(
        "app",
        vec![leaf(
            "deps",
            &[("commands", "touch installed.flag; rm -rf .")],
            "Install dependencies",
        )],
    )]);
    let provider = ScriptedProvider::new().generate_reply(
        "app/deps",
        GenerateResponse {
            files: vec![file("deps.lock", "left-pad 1.0\n")],
            ..GenerateResponse::default()
        },
    );

    let report = ws.compile_and_build(&tree, &provider, &["touch"]).await;

    assert_eq!(report.success_count, 1, "{:?}", report.errors);
    let deps = &report.leaves[0];
    assert_eq!(deps.rejected_commands, vec!["rm -rf ."]);
    assert!(ws.build.join("app/installed.flag").is_file());
    assert!(ws.build.join("app/deps.lock").is_file());

    let commands: Vec<(String, String)> = read_operation_log(&ws.oplog)
        .expect("oplog")
        .into_iter()
        .filter(|r| r.event == OpEvent::Command)
        .map(|r| {
            (
                r.payload["command"].as_str().unwrap_or_default().to_string(),
                r.payload["outcome"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    assert_eq!(
        commands,
        vec![
            ("touch installed.flag".to_string(), "ok".to_string()),
            (
                "rm -rf .".to_string(),
                "command rejected: rm -rf . (Not whitelisted)".to_string()
            ),
        ]
    );
}

#[tokio::test]
async fn shared_output_file_has_one_owner() {
    let ws = Workspace::new();
    let tree = root(vec![
        leaf("alpha", &[("output", "shared")], "First writer"),
        leaf("beta", &[("output", "shared")], "Second writer"),
    ]);
    let reply = |content: &str| GenerateResponse {
        files: vec![file("config.yaml", content)],
        ..GenerateResponse::default()
    };
    let provider = ScriptedProvider::new()
        .generate_reply("alpha", reply("owner: alpha\n"))
        .generate_reply("beta", reply("owner: beta\n"));

    let report = ws.compile_and_build(&tree, &provider, &[]).await;

    assert_eq!(report.success_count, 1);
    assert_eq!(report.failure_count, 1);
    assert_eq!(report.files, vec!["shared/config.yaml"]);
    assert!(report.errors[0].starts_with("beta: "));
    assert!(report.errors[0].contains("alpha"));
    assert!(read(&ws.build.join("shared/config.yaml")).contains("owner: alpha"));
}

#[tokio::test]
async fn failed_generation_does_not_stop_siblings() {
    let ws = Workspace::new();
    let tree = root(vec![
        leaf("broken", &[], "Will fail"),
        leaf("healthy", &[], "Will work"),
    ]);
    let provider = ScriptedProvider::new()
        .fail_generate("broken", "backend down")
        .generate_reply(
            "healthy",
            GenerateResponse {
                files: vec![file("healthy.txt", "ok\n")],
                questions: vec!["Which encoding?".to_string()],
                ..GenerateResponse::default()
            },
        );

    let report = ws.compile_and_build(&tree, &provider, &[]).await;

    assert_eq!(report.total_leaves, 2);
    assert_eq!(report.success_count, 1);
    assert!(report.errors[0].contains("backend down"));
    assert_eq!(report.questions, vec!["Which encoding?"]);
    assert!(ws.build.join("healthy.txt").is_file());
}

#[tokio::test]
async fn corrupt_leaf_artifact_fails_only_that_leaf() {
    let ws = Workspace::new();
    let tree = root(vec![
        leaf("bad", &[], "Will be corrupted"),
        leaf("good", &[], "Will work"),
    ]);
    let provider = ScriptedProvider::new().generate_reply(
        "good",
        GenerateResponse {
            files: vec![file("good.txt", "ok\n")],
            ..GenerateResponse::default()
        },
    );
    run_compile(&tree, &provider, &ws.plan, &CompileOptions::default()).await;
    fs::write(ws.plan.join("bad/context.json"), "{").expect("corrupt context");

    let report = run_build(&provider, &ws.plan, &ws.build, &ws.options(&[]))
        .await
        .expect("build despite corrupt artifact");

    assert_eq!(report.total_leaves, 2);
    assert_eq!(report.success_count, 1);
    assert_eq!(report.failure_count, 1);
    assert!(report.errors[0].starts_with("bad: "), "{:?}", report.errors);
    assert!(report.errors[0].contains("unreadable plan artifact"));
    assert_eq!(provider.generate_calls(), 1);
    assert!(ws.build.join("good.txt").is_file());
}

#[tokio::test]
async fn clean_refuses_a_build_root_holding_the_plan() {
    let ws = Workspace::new();
    let tree = root(vec![leaf("logger", &[], "Write logs")]);
    let provider = ScriptedProvider::new();
    run_compile(&tree, &provider, &ws.plan, &CompileOptions::default()).await;
    let mut options = ws.options(&[]);
    options.clean = true;

    let err = run_build(&provider, &ws.plan, &ws.root, &options)
        .await
        .expect_err("cleaning the plan's parent must be refused");

    assert!(format!("{err:#}").contains("refusing to clean"));
    assert!(ws.plan.join("logger/context.json").is_file());
    assert_eq!(provider.generate_calls(), 0);
}
