//! Spec-tree planner CLI.
//!
//! Keeps its state under `.planner/` in the current directory: the config
//! (`config.toml`), the plan tree (`plan/`) and the operation log
//! (`operations.jsonl`). Generated files go to `build/` unless overridden.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use planner::build::{BuildOptions, discover_leaf_nodes, run_build};
use planner::compile::{CompileOptions, CompileReport, run_compile};
use planner::exit_codes;
use planner::io::config::{PlannerConfig, load_config, write_config};
use planner::io::provider::{CommandProvider, Provider};
use planner::logging;
use planner::spec::load_spec_tree;

const STATE_DIR: &str = ".planner";
const DEFAULT_BUILD_DIR: &str = "build";

#[derive(Parser)]
#[command(
    name = "planner",
    version,
    about = "Compile spec trees into plan trees and generate their leaves"
)]
struct Cli {
    /// Debug tracing on stderr and every recorded error in summaries.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.planner/config.toml` with defaults.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Compile a parsed spec tree (JSON) into `.planner/plan/`.
    Compile {
        /// Spec tree in its JSON interchange form.
        tree: PathBuf,
        #[arg(long)]
        max_nodes: Option<usize>,
        #[arg(long)]
        max_calls: Option<usize>,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Recompile every node.
        #[arg(long)]
        no_cache: bool,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Generate files for every leaf of the plan tree.
    Build {
        #[arg(long)]
        parallelism: Option<usize>,
        /// Remove the output directory first.
        #[arg(long)]
        clean: bool,
        /// Skip provenance headers.
        #[arg(long)]
        no_headers: bool,
        /// Output directory.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List the leaves of the plan tree.
    Leaves,
    /// Check that the configured provider answers.
    Ping,
}

struct Layout {
    config: PathBuf,
    plan: PathBuf,
    operation_log: PathBuf,
}

impl Layout {
    fn new(root: &Path) -> Self {
        let state = root.join(STATE_DIR);
        Self {
            config: state.join("config.toml"),
            plan: state.join("plan"),
            operation_log: state.join("operations.jsonl"),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    let layout = Layout::new(&root);
    let verbose = cli.verbose;
    match cli.command {
        Command::Init { force } => cmd_init(&layout, force),
        Command::Compile {
            tree,
            max_nodes,
            max_calls,
            max_depth,
            max_parallel,
            no_cache,
            json,
        } => {
            let mut cfg = load_config(&layout.config)?;
            let g = &mut cfg.governors;
            g.max_nodes = max_nodes.unwrap_or(g.max_nodes);
            g.max_calls = max_calls.unwrap_or(g.max_calls);
            g.max_depth = max_depth.unwrap_or(g.max_depth);
            g.max_parallel = max_parallel.unwrap_or(g.max_parallel);
            if no_cache {
                cfg.cache.enabled = false;
            }
            cfg.validate()?;
            let spec = load_spec_tree(&tree)?;
            let provider = CommandProvider::new(&cfg.provider, &root);
            let options = CompileOptions::from_config(&cfg);
            let report = block_on(run_compile(&spec, &provider, &layout.plan, &options))?;
            if json {
                print_json(&report)?;
            } else {
                print_compile_summary(&report, verbose);
            }
            Ok(report.exit_code())
        }
        Command::Build {
            parallelism,
            clean,
            no_headers,
            out,
            json,
        } => {
            let mut cfg = load_config(&layout.config)?;
            cfg.build.parallelism = parallelism.unwrap_or(cfg.build.parallelism);
            cfg.build.clean |= clean;
            if no_headers {
                cfg.build.add_source_headers = false;
            }
            cfg.validate()?;
            let build_root = out.unwrap_or_else(|| root.join(DEFAULT_BUILD_DIR));
            let provider = CommandProvider::new(&cfg.provider, &root);
            let options = BuildOptions::from_config(&cfg, &layout.operation_log);
            let report = block_on(run_build(&provider, &layout.plan, &build_root, &options))??;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "leaves: {}  succeeded: {}  failed: {}  files: {}",
                    report.total_leaves,
                    report.success_count,
                    report.failure_count,
                    report.files.len()
                );
                for question in &report.questions {
                    println!("question: {question}");
                }
                for err in &report.errors {
                    println!("error: {err}");
                }
            }
            Ok(report.exit_code())
        }
        Command::Leaves => {
            for leaf in discover_leaf_nodes(&layout.plan)? {
                println!("{}", leaf.node_path);
            }
            Ok(exit_codes::OK)
        }
        Command::Ping => {
            let cfg = load_config(&layout.config)?;
            let provider = CommandProvider::new(&cfg.provider, &root);
            block_on(provider.test_connection())?.context("provider did not answer")?;
            println!("ok");
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(layout: &Layout, force: bool) -> Result<i32> {
    if force || !layout.config.exists() {
        write_config(&layout.config, &PlannerConfig::default())?;
    }
    std::fs::create_dir_all(&layout.plan)
        .with_context(|| format!("create {}", layout.plan.display()))?;
    Ok(exit_codes::OK)
}

/// Provider futures are not `Send`; everything runs on one thread, with
/// blocking process work moved to the blocking pool.
fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    Ok(runtime.block_on(future))
}

fn print_compile_summary(report: &CompileReport, verbose: bool) {
    let t = &report.totals;
    println!(
        "nodes: {}  completed: {}  cached: {}  oracle calls: {}  questions: {}  errors: {}",
        t.total_nodes,
        t.completed_nodes,
        report.cache_hits(),
        t.ai_calls,
        t.questions_raised,
        t.errors
    );
    if let Some(governor) = report.limit_reached {
        println!("limit reached: {governor}");
    }
    for (node, question) in report.questions() {
        println!("question [{node}]: {question}");
    }
    if verbose {
        for (node, err) in report.errors() {
            println!("error [{node}]: {err}");
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize report")?;
    println!("{payload}");
    Ok(())
}
