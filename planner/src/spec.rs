//! Typed specification tree as handed over by the front-end parser.
//!
//! The planner never mutates a [`SpecNode`]; it only reads names, parameters
//! and structure, and serializes nodes to a canonical text used for hashing
//! and for the persisted plan.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Parameter that explicitly marks a node as a leaf.
pub const LEAF_PARAM: &str = "leaf";
/// Parameter listing files a leaf must produce (comma separated).
pub const FILES_PARAM: &str = "files";
/// Parameter listing setup commands for a leaf (`;` separated).
pub const COMMANDS_PARAM: &str = "commands";
/// Parameter overriding a leaf's output directory.
pub const OUTPUT_PARAM: &str = "output";

/// Location of a node in its source file (1-indexed, inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceRange {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpecKind {
    Root {
        children: Vec<SpecNode>,
    },
    Module {
        name: String,
        #[serde(default)]
        parameters: Vec<Parameter>,
        #[serde(default)]
        children: Vec<SpecNode>,
    },
    QueryFilter {
        question: String,
        #[serde(default)]
        parameters: Vec<Parameter>,
        #[serde(default)]
        children: Vec<SpecNode>,
    },
    Prose {
        text: String,
    },
    Include {
        path: String,
    },
    Parameter(Parameter),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecNode {
    #[serde(flatten)]
    pub kind: SpecKind,
    #[serde(default)]
    pub source: SourceRange,
}

impl SpecNode {
    /// Name used for the node's ancestry entry.
    pub fn name(&self) -> &str {
        match &self.kind {
            SpecKind::Root { .. } => "root",
            SpecKind::Module { name, .. } => name,
            SpecKind::QueryFilter { question, .. } => question,
            SpecKind::Prose { .. } => "prose",
            SpecKind::Include { path } => path,
            SpecKind::Parameter(param) => &param.name,
        }
    }

    /// Declared parameters: the node's own list plus parameter children.
    pub fn parameters(&self) -> Vec<Parameter> {
        let mut params = match &self.kind {
            SpecKind::Module { parameters, .. } | SpecKind::QueryFilter { parameters, .. } => {
                parameters.clone()
            }
            _ => Vec::new(),
        };
        for child in self.children() {
            if let SpecKind::Parameter(param) = &child.kind {
                params.push(param.clone());
            }
        }
        params
    }

    pub fn children(&self) -> &[SpecNode] {
        match &self.kind {
            SpecKind::Root { children }
            | SpecKind::Module { children, .. }
            | SpecKind::QueryFilter { children, .. } => children,
            _ => &[],
        }
    }

    /// Children that can be compiled on their own (modules and query filters).
    pub fn structural_children(&self) -> impl Iterator<Item = &SpecNode> {
        self.children().iter().filter(|child| child.is_structural())
    }

    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind,
            SpecKind::Module { .. } | SpecKind::QueryFilter { .. }
        )
    }

    pub fn param(&self, name: &str) -> Option<Parameter> {
        self.parameters().into_iter().find(|p| p.name == name)
    }

    pub fn is_marked_leaf(&self) -> bool {
        self.param(LEAF_PARAM).is_some_and(|p| {
            p.value
                .as_deref()
                .is_none_or(|v| !matches!(v.trim(), "false" | "no" | "0"))
        })
    }
}

/// Load a parsed tree from its JSON interchange form.
pub fn load_spec_tree(path: &Path) -> Result<SpecNode> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read spec tree {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse spec tree {}", path.display()))
}

/// Render `node` (and its subtree) to canonical spec text.
///
/// Layout is fixed: two-space indentation, one construct per line, quoted
/// prose and include paths. Equal trees always render to equal text.
pub fn canonical_text(node: &SpecNode) -> String {
    let mut out = String::new();
    match &node.kind {
        SpecKind::Root { children } => {
            for child in children {
                render(child, 0, &mut out);
            }
        }
        _ => render(node, 0, &mut out),
    }
    out
}

fn render(node: &SpecNode, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    match &node.kind {
        SpecKind::Root { children } => {
            for child in children {
                render(child, depth, out);
            }
        }
        SpecKind::Module {
            name,
            parameters,
            children,
        } => render_block(name, parameters, children, depth, out),
        SpecKind::QueryFilter {
            question,
            parameters,
            children,
        } => {
            let head = format!("?{}", quote(question));
            render_block(&head, parameters, children, depth, out);
        }
        SpecKind::Prose { text } => {
            let _ = writeln!(out, "{indent}{}", quote(text));
        }
        SpecKind::Include { path } => {
            let _ = writeln!(out, "{indent}@include {}", quote(path));
        }
        SpecKind::Parameter(param) => match &param.value {
            Some(value) => {
                let _ = writeln!(out, "{indent}@{} = {}", param.name, quote(value));
            }
            None => {
                let _ = writeln!(out, "{indent}@{}", param.name);
            }
        },
    }
}

fn render_block(
    head: &str,
    parameters: &[Parameter],
    children: &[SpecNode],
    depth: usize,
    out: &mut String,
) {
    let indent = "  ".repeat(depth);
    let params = render_params(parameters);
    if children.is_empty() {
        let _ = writeln!(out, "{indent}{head}{params} {{}}");
        return;
    }
    let _ = writeln!(out, "{indent}{head}{params} {{");
    for child in children {
        render(child, depth + 1, out);
    }
    let _ = writeln!(out, "{indent}}}");
}

fn render_params(parameters: &[Parameter]) -> String {
    if parameters.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = parameters
        .iter()
        .map(|p| match &p.value {
            Some(value) => format!("{}={}", p.name, quote(value)),
            None => p.name.clone(),
        })
        .collect();
    format!("({})", rendered.join(", "))
}

fn quote(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("\"{escaped}\"")
}
