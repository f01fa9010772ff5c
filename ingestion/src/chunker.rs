//! Chunker Registry (§4.2): a static, explicit name -> factory binding.
//! Every chunker is deterministic: same input + params always produce the
//! same output sequence, and implementations enforce their size caps
//! strictly rather than merely aiming for them.

use kb_core::error::{ErrorCode, RetrievalError};
use kb_core::ingest::ChunkPiece;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkerError {
    #[error("unknown chunker: {0}")]
    UnknownChunker(String),
    #[error("invalid chunker params: {0}")]
    InvalidParams(String),
}

impl RetrievalError for ChunkerError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::ValidationError
    }
}

/// Strict mode rejects params keys the target config doesn't recognize;
/// lenient mode ignores them. Config-driven per KB, not per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    Strict,
    Lenient,
}

pub trait Chunker: Send + Sync {
    fn chunk(&self, text: &str, base_metadata: &HashMap<String, Value>) -> Vec<ChunkPiece>;
}

fn reject_unknown_keys(value: &Value, allowed: &[&str], mode: ParamMode) -> Result<(), ChunkerError> {
    if mode == ParamMode::Lenient {
        return Ok(());
    }
    if let Value::Object(map) = value {
        for key in map.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(ChunkerError::InvalidParams(format!("unknown key: {key}")));
            }
        }
    }
    Ok(())
}

fn piece(text: impl Into<String>, base: &HashMap<String, Value>) -> ChunkPiece {
    ChunkPiece {
        text: text.into(),
        metadata: base.clone(),
    }
}

/// Builds a named chunker from its JSON params. The registry is this match
/// arm list: static and explicit, populated at call time, no runtime
/// plugin loading.
pub fn build_chunker(
    name: &str,
    params: &Value,
    mode: ParamMode,
) -> Result<Box<dyn Chunker>, ChunkerError> {
    match name {
        "simple" => Ok(Box::new(SimpleChunker::from_params(params, mode)?)),
        "sliding_window" => Ok(Box::new(SlidingWindowChunker::from_params(params, mode)?)),
        "recursive" => Ok(Box::new(RecursiveChunker::from_params(params, mode)?)),
        "markdown" => Ok(Box::new(MarkdownChunker::from_params(params, mode)?)),
        "code" => Ok(Box::new(CodeChunker::from_params(params, mode)?)),
        "parent_child" => Ok(Box::new(ParentChildChunker::from_params(params, mode)?)),
        other => Err(ChunkerError::UnknownChunker(other.to_string())),
    }
}

// ---------------------------------------------------------------- simple --

#[derive(Debug, Clone, Deserialize)]
struct SimpleParams {
    #[serde(default = "SimpleParams::default_separator")]
    separator: String,
    #[serde(default = "SimpleParams::default_max_chars")]
    max_chars: usize,
}

impl SimpleParams {
    fn default_separator() -> String {
        "\n\n".to_string()
    }
    fn default_max_chars() -> usize {
        1000
    }
}

pub struct SimpleChunker {
    separator: String,
    max_chars: usize,
}

impl SimpleChunker {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, ChunkerError> {
        reject_unknown_keys(params, &["separator", "max_chars"], mode)?;
        let p: SimpleParams = serde_json::from_value(params.clone())
            .map_err(|e| ChunkerError::InvalidParams(e.to_string()))?;
        Ok(Self {
            separator: p.separator,
            max_chars: p.max_chars.max(1),
        })
    }
}

impl Chunker for SimpleChunker {
    fn chunk(&self, text: &str, base_metadata: &HashMap<String, Value>) -> Vec<ChunkPiece> {
        let mut out = Vec::new();
        for segment in text.split(self.separator.as_str()) {
            if segment.is_empty() {
                continue;
            }
            for hard in hard_split(segment, self.max_chars) {
                out.push(piece(hard, base_metadata));
            }
        }
        out
    }
}

/// Splits `text` into pieces of at most `max_chars` bytes, on char
/// boundaries, never exceeding the cap even for a pathological input with
/// no whitespace.
fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect::<String>())
        .collect()
}

// --------------------------------------------------------- sliding_window --

#[derive(Debug, Clone, Deserialize)]
struct SlidingWindowParams {
    #[serde(default = "SlidingWindowParams::default_window")]
    window: usize,
    #[serde(default)]
    overlap: usize,
}

impl SlidingWindowParams {
    fn default_window() -> usize {
        1000
    }
}

pub struct SlidingWindowChunker {
    window: usize,
    overlap: usize,
}

impl SlidingWindowChunker {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, ChunkerError> {
        reject_unknown_keys(params, &["window", "overlap"], mode)?;
        let p: SlidingWindowParams = serde_json::from_value(params.clone())
            .map_err(|e| ChunkerError::InvalidParams(e.to_string()))?;
        let window = p.window.max(1);
        let overlap = p.overlap.min(window.saturating_sub(1));
        Ok(Self { window, overlap })
    }
}

impl Chunker for SlidingWindowChunker {
    fn chunk(&self, text: &str, base_metadata: &HashMap<String, Value>) -> Vec<ChunkPiece> {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }

        let stride = self.window - self.overlap;
        let mut out = Vec::new();
        let mut offset = 0usize;
        loop {
            let end = (offset + self.window).min(chars.len());
            let slice: String = chars[offset..end].iter().collect();
            out.push(piece(slice, base_metadata).with_metadata("offset", Value::from(offset)));
            if end == chars.len() {
                break;
            }
            offset += stride;
        }
        out
    }
}

// ------------------------------------------------------------- recursive --

#[derive(Debug, Clone, Deserialize)]
struct RecursiveParams {
    #[serde(default = "RecursiveParams::default_separators")]
    separators: Vec<String>,
    #[serde(default = "RecursiveParams::default_max_chars")]
    max_chars: usize,
    #[serde(default)]
    keep_separator: bool,
}

impl RecursiveParams {
    fn default_separators() -> Vec<String> {
        vec!["\n\n".to_string(), "\n".to_string(), ". ".to_string(), " ".to_string()]
    }
    fn default_max_chars() -> usize {
        1000
    }
}

pub struct RecursiveChunker {
    separators: Vec<String>,
    max_chars: usize,
    keep_separator: bool,
}

impl RecursiveChunker {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, ChunkerError> {
        reject_unknown_keys(params, &["separators", "max_chars", "keep_separator"], mode)?;
        let p: RecursiveParams = serde_json::from_value(params.clone())
            .map_err(|e| ChunkerError::InvalidParams(e.to_string()))?;
        Ok(Self {
            separators: p.separators,
            max_chars: p.max_chars.max(1),
            keep_separator: p.keep_separator,
        })
    }

    fn split(&self, text: &str, sep_index: usize, out: &mut Vec<String>) {
        if text.is_empty() {
            return;
        }
        if text.chars().count() <= self.max_chars {
            out.push(text.to_string());
            return;
        }
        if sep_index >= self.separators.len() {
            out.extend(hard_split(text, self.max_chars));
            return;
        }

        let sep = &self.separators[sep_index];
        let segments: Vec<&str> = if sep.is_empty() {
            vec![text]
        } else {
            text.split(sep.as_str()).collect()
        };

        if segments.len() <= 1 {
            self.split(text, sep_index + 1, out);
            return;
        }

        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                continue;
            }
            let with_sep = if self.keep_separator && i + 1 < segments.len() {
                format!("{segment}{sep}")
            } else {
                segment.to_string()
            };
            self.split(&with_sep, sep_index + 1, out);
        }
    }
}

impl Chunker for RecursiveChunker {
    fn chunk(&self, text: &str, base_metadata: &HashMap<String, Value>) -> Vec<ChunkPiece> {
        let mut pieces = Vec::new();
        self.split(text, 0, &mut pieces);
        pieces.into_iter().map(|p| piece(p, base_metadata)).collect()
    }
}

// -------------------------------------------------------------- markdown --

#[derive(Debug, Clone, Deserialize)]
struct MarkdownParams {
    #[serde(default = "MarkdownParams::default_max_heading_level")]
    max_heading_level: usize,
}

impl MarkdownParams {
    fn default_max_heading_level() -> usize {
        6
    }
}

pub struct MarkdownChunker {
    max_heading_level: usize,
}

impl MarkdownChunker {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, ChunkerError> {
        reject_unknown_keys(params, &["max_heading_level"], mode)?;
        let p: MarkdownParams = serde_json::from_value(params.clone())
            .map_err(|e| ChunkerError::InvalidParams(e.to_string()))?;
        Ok(Self {
            max_heading_level: p.max_heading_level.clamp(1, 6),
        })
    }
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, text: &str, base_metadata: &HashMap<String, Value>) -> Vec<ChunkPiece> {
        let mut out = Vec::new();
        let mut heading_stack: Vec<(usize, String)> = Vec::new();
        let mut current_lines: Vec<&str> = Vec::new();

        let flush = |lines: &[&str], headings: &[(usize, String)], out: &mut Vec<ChunkPiece>| {
            let body = lines.join("\n").trim().to_string();
            if body.is_empty() {
                return;
            }
            let mut p = piece(body, base_metadata);
            for (level, title) in headings {
                p = p.with_metadata(format!("h{level}"), Value::from(title.clone()));
            }
            let path = headings
                .iter()
                .map(|(_, t)| t.clone())
                .collect::<Vec<_>>()
                .join(" > ");
            p = p.with_metadata("heading_path", Value::from(path));
            out.push(p);
        };

        for line in text.lines() {
            if let Some((level, title)) = parse_heading(line) {
                if level <= self.max_heading_level {
                    flush(&current_lines, &heading_stack, &mut out);
                    current_lines.clear();
                    heading_stack.retain(|(l, _)| *l < level);
                    heading_stack.push((level, title));
                    continue;
                }
            }
            current_lines.push(line);
        }
        flush(&current_lines, &heading_stack, &mut out);
        out
    }
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = trimmed[hashes..].trim();
    if rest.is_empty() {
        return None;
    }
    Some((hashes, rest.to_string()))
}

// ------------------------------------------------------------------ code --

#[derive(Debug, Clone, Deserialize)]
struct CodeParams {
    #[serde(default = "CodeParams::default_language")]
    language: String,
    #[serde(default)]
    prepend_imports: bool,
}

impl CodeParams {
    fn default_language() -> String {
        "python".to_string()
    }
}

pub struct CodeChunker {
    language: String,
    prepend_imports: bool,
}

impl CodeChunker {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, ChunkerError> {
        reject_unknown_keys(params, &["language", "prepend_imports"], mode)?;
        let p: CodeParams = serde_json::from_value(params.clone())
            .map_err(|e| ChunkerError::InvalidParams(e.to_string()))?;
        Ok(Self {
            language: p.language,
            prepend_imports: p.prepend_imports,
        })
    }
}

impl Chunker for CodeChunker {
    fn chunk(&self, text: &str, base_metadata: &HashMap<String, Value>) -> Vec<ChunkPiece> {
        let lines: Vec<&str> = text.lines().collect();
        let imports: Vec<&str> = lines
            .iter()
            .filter(|l| {
                let t = l.trim_start();
                t.starts_with("import ") || t.starts_with("from ") || t.starts_with("use ")
            })
            .copied()
            .collect();

        let mut out = Vec::new();
        let mut start = 0usize;
        let mut current_name: Option<String> = None;
        let mut current_kind: Option<&'static str> = None;

        let flush = |start: usize,
                     end: usize,
                     name: &Option<String>,
                     kind: Option<&'static str>,
                     out: &mut Vec<ChunkPiece>| {
            if end <= start {
                return;
            }
            let mut body = lines[start..end].join("\n");
            if body.trim().is_empty() {
                return;
            }
            if self.prepend_imports && !imports.is_empty() && start > 0 {
                body = format!("{}\n\n{}", imports.join("\n"), body);
            }
            let mut p = piece(body, base_metadata);
            p = p.with_metadata("language", Value::from(self.language.clone()));
            if let Some(n) = name {
                let key = if kind == Some("class") { "class_name" } else { "function_name" };
                p = p.with_metadata(key, Value::from(n.clone()));
            }
            if !imports.is_empty() {
                p = p.with_metadata(
                    "imports",
                    Value::from(imports.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
                );
            }
            out.push(p);
        };

        for (i, line) in lines.iter().enumerate() {
            if let Some((kind, name)) = code_def_start(line, &self.language) {
                flush(start, i, &current_name, current_kind, &mut out);
                start = i;
                current_name = Some(name);
                current_kind = Some(kind);
            }
        }
        flush(start, lines.len(), &current_name, current_kind, &mut out);

        if out.is_empty() && !text.trim().is_empty() {
            out.push(piece(text, base_metadata).with_metadata("language", Value::from(self.language.clone())));
        }
        out
    }
}

fn code_def_start(line: &str, language: &str) -> Option<(&'static str, String)> {
    let trimmed = line.trim_start();
    if language.eq_ignore_ascii_case("python") {
        if let Some(rest) = trimmed.strip_prefix("def ") {
            return Some(("function", function_name(rest)));
        }
        if let Some(rest) = trimmed.strip_prefix("class ") {
            return Some(("class", function_name(rest)));
        }
        return None;
    }
    // Generic regex-free heuristic for other languages: common keywords
    // introducing a named function or class/struct/impl block.
    for kw in ["function ", "fn ", "def "] {
        if let Some(rest) = trimmed.strip_prefix(kw) {
            return Some(("function", function_name(rest)));
        }
    }
    for kw in ["class ", "struct ", "impl "] {
        if let Some(rest) = trimmed.strip_prefix(kw) {
            return Some(("class", function_name(rest)));
        }
    }
    None
}

fn function_name(rest: &str) -> String {
    rest.split(|c: char| c == '(' || c == ':' || c.is_whitespace())
        .find(|s| !s.is_empty())
        .unwrap_or("")
        .to_string()
}

// ------------------------------------------------------------ parent_child --

#[derive(Debug, Clone, Deserialize)]
struct ParentChildParams {
    #[serde(default = "ParentChildParams::default_parent_mode")]
    parent_mode: String,
    #[serde(default = "ParentChildParams::default_parent_max_chars")]
    parent_max_chars: usize,
    #[serde(default = "ParentChildParams::default_child_max_chars")]
    child_max_chars: usize,
    #[serde(default)]
    child_overlap: usize,
}

impl ParentChildParams {
    fn default_parent_mode() -> String {
        "paragraph".to_string()
    }
    fn default_parent_max_chars() -> usize {
        4000
    }
    fn default_child_max_chars() -> usize {
        400
    }
}

pub struct ParentChildChunker {
    parent_mode: String,
    parent_max_chars: usize,
    child_max_chars: usize,
    child_overlap: usize,
}

impl ParentChildChunker {
    fn from_params(params: &Value, mode: ParamMode) -> Result<Self, ChunkerError> {
        reject_unknown_keys(
            params,
            &["parent_mode", "parent_max_chars", "child_max_chars", "child_overlap"],
            mode,
        )?;
        let p: ParentChildParams = serde_json::from_value(params.clone())
            .map_err(|e| ChunkerError::InvalidParams(e.to_string()))?;
        if p.parent_mode != "document" && p.parent_mode != "paragraph" {
            return Err(ChunkerError::InvalidParams(format!(
                "parent_mode must be 'document' or 'paragraph', got '{}'",
                p.parent_mode
            )));
        }
        Ok(Self {
            parent_mode: p.parent_mode,
            parent_max_chars: p.parent_max_chars.max(1),
            child_max_chars: p.child_max_chars.max(1),
            child_overlap: p.child_overlap,
        })
    }

    fn split_parents(&self, text: &str) -> Vec<String> {
        if self.parent_mode == "document" {
            return hard_split(text, self.parent_max_chars);
        }
        let mut parents = Vec::new();
        for para in text.split("\n\n") {
            if para.trim().is_empty() {
                continue;
            }
            parents.extend(hard_split(para, self.parent_max_chars));
        }
        parents
    }
}

impl Chunker for ParentChildChunker {
    fn chunk(&self, text: &str, base_metadata: &HashMap<String, Value>) -> Vec<ChunkPiece> {
        let mut out = Vec::new();
        let sliding = SlidingWindowChunker {
            window: self.child_max_chars,
            overlap: self.child_overlap.min(self.child_max_chars.saturating_sub(1)),
        };

        for (parent_index, parent_text) in self.split_parents(text).into_iter().enumerate() {
            let local_id = format!("p{parent_index}");
            let parent_piece = piece(parent_text.clone(), base_metadata)
                .with_metadata("local_id", Value::from(local_id.clone()))
                .with_metadata("child", Value::from(false))
                .with_metadata("parent_mode", Value::from(self.parent_mode.clone()));
            out.push(parent_piece);

            for (child_index, child) in sliding.chunk(&parent_text, base_metadata).into_iter().enumerate() {
                let child_piece = ChunkPiece {
                    text: child.text,
                    metadata: child.metadata,
                }
                .with_metadata("parent_local_id", Value::from(local_id.clone()))
                .with_metadata("child", Value::from(true))
                .with_metadata("child_index", Value::from(child_index as u64));
                out.push(child_piece);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> HashMap<String, Value> {
        HashMap::new()
    }

    #[test]
    fn simple_splits_on_separator_and_enforces_cap() {
        let c = SimpleChunker::from_params(&serde_json::json!({"max_chars": 5}), ParamMode::Strict).unwrap();
        let pieces = c.chunk("hello world\n\nfoobarbaz", &meta());
        assert!(pieces.iter().all(|p| p.text.chars().count() <= 5));
    }

    #[test]
    fn sliding_window_is_deterministic_and_overlaps() {
        let c = SlidingWindowChunker::from_params(
            &serde_json::json!({"window": 4, "overlap": 2}),
            ParamMode::Strict,
        )
        .unwrap();
        let a = c.chunk("abcdefgh", &meta());
        let b = c.chunk("abcdefgh", &meta());
        assert_eq!(a.iter().map(|p| p.text.clone()).collect::<Vec<_>>(), b.iter().map(|p| p.text.clone()).collect::<Vec<_>>());
        assert_eq!(a[0].text, "abcd");
        assert_eq!(a[1].text, "cdef");
    }

    #[test]
    fn recursive_never_exceeds_max_chars() {
        let c = RecursiveChunker::from_params(&serde_json::json!({"max_chars": 10}), ParamMode::Strict).unwrap();
        let pieces = c.chunk("a long sentence without much punctuation at all here", &meta());
        assert!(pieces.iter().all(|p| p.text.chars().count() <= 10));
    }

    #[test]
    fn markdown_carries_heading_path() {
        let c = MarkdownChunker::from_params(&serde_json::json!({}), ParamMode::Strict).unwrap();
        let pieces = c.chunk("# A\ntext1\n## B\ntext2", &meta());
        let last = pieces.last().unwrap();
        assert_eq!(last.metadata.get("heading_path").unwrap(), &Value::from("A > B"));
    }

    #[test]
    fn code_chunker_extracts_function_names() {
        let c = CodeChunker::from_params(&serde_json::json!({}), ParamMode::Strict).unwrap();
        let pieces = c.chunk("def foo():\n    pass\ndef bar():\n    pass", &meta());
        let names: Vec<_> = pieces
            .iter()
            .filter_map(|p| p.metadata.get("function_name").and_then(|v| v.as_str()))
            .collect();
        assert_eq!(names, vec!["foo", "bar"]);
    }

    #[test]
    fn parent_child_links_children_to_parent_local_id() {
        let c = ParentChildChunker::from_params(&serde_json::json!({"parent_max_chars": 100, "child_max_chars": 10}), ParamMode::Strict).unwrap();
        let pieces = c.chunk("one two three four five six seven eight nine ten", &meta());
        let parent = pieces.iter().find(|p| p.metadata.get("child") == Some(&Value::from(false))).unwrap();
        let parent_id = parent.metadata.get("local_id").unwrap().clone();
        let child = pieces.iter().find(|p| p.metadata.get("child") == Some(&Value::from(true))).unwrap();
        assert_eq!(child.metadata.get("parent_local_id").unwrap(), &parent_id);
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let err = SimpleChunker::from_params(&serde_json::json!({"bogus": 1}), ParamMode::Strict).unwrap_err();
        assert!(matches!(err, ChunkerError::InvalidParams(_)));
    }

    #[test]
    fn lenient_mode_ignores_unknown_keys() {
        let c = SimpleChunker::from_params(&serde_json::json!({"bogus": 1}), ParamMode::Lenient);
        assert!(c.is_ok());
    }

    #[test]
    fn build_chunker_rejects_unknown_name() {
        let err = build_chunker("nonexistent", &serde_json::json!({}), ParamMode::Lenient).unwrap_err();
        assert!(matches!(err, ChunkerError::UnknownChunker(_)));
    }
}
