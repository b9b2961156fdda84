//! Prompt rendering for oracle calls.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::path::leaf_name;
use crate::core::types::{CompileRequest, GenerateRequest};

const COMPILE_TEMPLATE: &str = include_str!("prompts/compile.md");
const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("compile", COMPILE_TEMPLATE)
        .expect("compile template should be valid");
    env.add_template("generate", GENERATE_TEMPLATE)
        .expect("generate template should be valid");
    env
});

pub fn render_compile_prompt(request: &CompileRequest) -> Result<String> {
    let ctx = &request.context;
    let template = ENGINE.get_template("compile")?;
    template
        .render(context! {
            node_path => &request.node_path,
            name => leaf_name(&request.node_path),
            ancestry => &ctx.ancestry,
            spec => request.spec.trim(),
            parameters => &ctx.parameters,
            interfaces => &ctx.interfaces,
            constraints => &ctx.constraints,
            utilities => &ctx.utilities,
            suggestions => &ctx.suggestions,
            query_matches => &ctx.query_matches,
            accepted => &request.accepted,
            feedback => &request.feedback,
        })
        .context("render compile prompt")
}

pub fn render_generate_prompt(request: &GenerateRequest) -> Result<String> {
    let ctx = &request.context;
    let template = ENGINE.get_template("generate")?;
    template
        .render(context! {
            node_path => &request.node_path,
            ancestry => &ctx.ancestry,
            spec => request.spec.trim(),
            interfaces => &ctx.interfaces,
            constraints => &ctx.constraints,
            utilities => &ctx.utilities,
            required_files => &request.required_files,
        })
        .context("render generate prompt")
}
