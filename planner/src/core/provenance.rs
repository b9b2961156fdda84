//! Provenance banners for generated files.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentStyle {
    Line(&'static str),
    Block(&'static str, &'static str),
}

/// Comment syntax for a generated file, by extension.
///
/// Returns `None` for formats without comments (JSON), which get no banner.
pub fn comment_style(path: &str) -> Option<CommentStyle> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let style = match ext.as_str() {
        "json" | "ipynb" | "lock" => return None,
        "rs" | "js" | "mjs" | "cjs" | "ts" | "jsx" | "tsx" | "go" | "java" | "c" | "h" | "cc"
        | "cpp" | "hpp" | "cs" | "swift" | "kt" | "kts" | "scala" | "dart" | "zig" | "proto"
        | "php" => CommentStyle::Line("//"),
        "sql" | "lua" | "hs" | "elm" => CommentStyle::Line("--"),
        "html" | "htm" | "xml" | "md" | "vue" | "svg" => CommentStyle::Block("<!--", "-->"),
        "css" | "scss" | "less" => CommentStyle::Block("/*", "*/"),
        "erl" | "tex" => CommentStyle::Line("%"),
        _ => CommentStyle::Line("#"),
    };
    Some(style)
}

/// Banner naming the spec a file came from, followed by a blank line.
pub fn provenance_header(path: &str, source_spec_ref: &str, node_path: &str) -> Option<String> {
    let style = comment_style(path)?;
    let lines = [
        format!("Generated from {source_spec_ref}"),
        format!("Plan node: {node_path}. Edit the spec, not this file."),
    ];
    let mut header = String::new();
    for line in &lines {
        match style {
            CommentStyle::Line(prefix) => header.push_str(&format!("{prefix} {line}\n")),
            CommentStyle::Block(open, close) => {
                header.push_str(&format!("{open} {line} {close}\n"));
            }
        }
    }
    header.push('\n');
    Some(header)
}
