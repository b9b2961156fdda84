//! Traceability from generated lines back to the spec that produced them.

use serde::{Deserialize, Serialize};

use crate::spec::SourceRange;

pub const SOURCE_MAP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub generated_line: u32,
    pub source_file: String,
    pub source_line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMap {
    pub version: u32,
    pub mappings: Vec<Mapping>,
    /// Contributing source files, first-seen order, deduplicated.
    pub sources: Vec<String>,
}

/// Append-only collector of line mappings.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    mappings: Vec<Mapping>,
    sources: Vec<String>,
}

impl SourceMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mapping(&mut self, generated_line: u32, source_file: &str, source_line: u32) {
        if !self.sources.iter().any(|s| s == source_file) {
            self.sources.push(source_file.to_string());
        }
        self.mappings.push(Mapping {
            generated_line,
            source_file: source_file.to_string(),
            source_line,
        });
    }

    /// Map each generated line in `gen_start..=gen_end` onto `source`.
    ///
    /// Lines are paired in order; once the source range is exhausted the
    /// remaining generated lines map to its last line.
    pub fn add_range_mapping(&mut self, gen_start: u32, gen_end: u32, source: &SourceRange) {
        if gen_end < gen_start {
            return;
        }
        let span = source.end_line.saturating_sub(source.start_line);
        for (offset, line) in (gen_start..=gen_end).enumerate() {
            let offset = u32::try_from(offset).unwrap_or(u32::MAX).min(span);
            self.add_mapping(line, &source.file, source.start_line + offset);
        }
    }

    pub fn build(&self) -> SourceMap {
        let mut mappings = self.mappings.clone();
        mappings.sort_by_key(|m| m.generated_line);
        SourceMap {
            version: SOURCE_MAP_VERSION,
            mappings,
            sources: self.sources.clone(),
        }
    }
}

/// First mapping recorded for `generated_line`.
pub fn lookup_source_location(map: &SourceMap, generated_line: u32) -> Option<&Mapping> {
    let idx = map
        .mappings
        .partition_point(|m| m.generated_line < generated_line);
    map.mappings
        .get(idx)
        .filter(|m| m.generated_line == generated_line)
}

pub fn contributing_sources(map: &SourceMap) -> &[String] {
    &map.sources
}
