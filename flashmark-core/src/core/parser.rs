//! Markdown document → note blocks.
//!
//! A document is an optional preamble followed by note blocks:
//!
//! ```text
//! model: Basic
//! tags: geography
//!
//! # Capitals
//! nid: 1701234567890
//! deck: Europe
//!
//! ## Front
//! What is the capital of Norway?
//!
//! ## Back
//! Oslo
//! ```
//!
//! `key: value` lines in the preamble set document defaults. Each `# ` line
//! starts a block, its `key: value` lines describe the note, and each `## `
//! line starts a field. Lines inside fenced code blocks are never headers.

use crate::{parse_tags, FlashmarkError, NoteBlock, Result, Span};
use std::collections::BTreeSet;

/// Values a block falls back to when neither it nor the preamble sets them.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDefaults {
    pub model: Option<String>,
    pub deck: Option<String>,
    /// Added to every block's tags.
    pub tags: BTreeSet<String>,
    pub markdown: bool,
}

impl Default for BlockDefaults {
    fn default() -> Self {
        Self {
            model: None,
            deck: None,
            tags: BTreeSet::new(),
            markdown: true,
        }
    }
}

/// Parses every block of `text`.
///
/// # Errors
///
/// Returns the first [`FlashmarkError::Parse`] encountered.
pub fn parse(text: &str) -> Result<Vec<NoteBlock>> {
    parse_with(text, &BlockDefaults::default())
}

/// Like [`parse`], with configured fallbacks for model, deck, tags and format.
pub fn parse_with(text: &str, defaults: &BlockDefaults) -> Result<Vec<NoteBlock>> {
    blocks(text, defaults).collect()
}

/// Lazily yields the blocks of `text` in document order.
///
/// A malformed block yields an error and iteration continues with the next one.
pub fn blocks<'a>(text: &'a str, defaults: &BlockDefaults) -> Blocks<'a> {
    Blocks::new(text, defaults)
}

#[derive(Debug, Clone, PartialEq)]
enum LineKind {
    Block(String),
    Field(String),
    Text,
}

#[derive(Debug)]
struct Line<'a> {
    /// Byte offset of the first character.
    start: usize,
    /// Byte offset of the following line.
    next: usize,
    content: &'a str,
    kind: LineKind,
}

/// Iterator returned by [`blocks`].
#[derive(Debug)]
pub struct Blocks<'a> {
    text: &'a str,
    lines: Vec<Line<'a>>,
    document: BlockDefaults,
    cursor: usize,
}

impl<'a> Blocks<'a> {
    fn new(text: &'a str, defaults: &BlockDefaults) -> Self {
        let lines = classify_lines(text);
        let mut document = defaults.clone();
        let mut cursor = lines.len();

        for (index, line) in lines.iter().enumerate() {
            if matches!(line.kind, LineKind::Block(_)) {
                cursor = index;
                break;
            }
            let Some((key, value)) = key_value(line.content) else {
                continue;
            };
            match key.as_str() {
                "model" if !value.is_empty() => document.model = Some(value.to_string()),
                "deck" if !value.is_empty() => document.deck = Some(value.to_string()),
                "tags" | "tag" => document.tags.extend(parse_tags(value)),
                "markdown" | "md" => document.markdown = parse_flag(value),
                _ => {} // ordinary preamble text
            }
        }

        Self {
            text,
            lines,
            document,
            cursor,
        }
    }

    fn parse_block(&self, first: usize, end: usize) -> Result<NoteBlock> {
        let header = &self.lines[first];
        let line_number = first + 1;
        let LineKind::Block(title) = &header.kind else {
            return Err(FlashmarkError::parse(line_number, "expected a note header"));
        };

        let mut id = None;
        let mut card_id = None;
        let mut model = None;
        let mut deck = None;
        let mut tags = BTreeSet::new();
        let mut markdown = None;
        let mut id_insert_offset = header.next;
        let mut index = first + 1;

        while index < end {
            let line = &self.lines[index];
            if matches!(line.kind, LineKind::Field(_)) {
                break;
            }
            index += 1;
            let Some((key, value)) = key_value(line.content) else {
                continue;
            };
            match key.as_str() {
                "nid" => id = parse_id(value, "note", index)?,
                "cid" => card_id = parse_id(value, "card", index)?,
                "model" => model = Some(value.to_string()).filter(|v| !v.is_empty()),
                "deck" => deck = Some(value.to_string()).filter(|v| !v.is_empty()),
                "tags" | "tag" => tags.extend(parse_tags(value)),
                "markdown" | "md" => markdown = Some(parse_flag(value)),
                other => {
                    log::debug!("line {index}: ignoring unknown key '{other}'");
                    continue;
                }
            }
            id_insert_offset = line.next;
        }

        let mut fields: Vec<(String, String)> = Vec::new();
        while index < end {
            let LineKind::Field(name) = &self.lines[index].kind else {
                index += 1;
                continue;
            };
            if fields.iter().any(|(existing, _)| existing == name) {
                return Err(FlashmarkError::parse(
                    index + 1,
                    format!("duplicate field '{name}'"),
                ));
            }
            let body_start = index + 1;
            let mut body_end = body_start;
            while body_end < end && !matches!(self.lines[body_end].kind, LineKind::Field(_)) {
                body_end += 1;
            }
            fields.push((name.clone(), self.field_text(body_start, body_end)));
            index = body_end;
        }

        if fields.is_empty() {
            return Err(FlashmarkError::parse(line_number, "note has no fields"));
        }

        let model = model.or_else(|| self.document.model.clone()).ok_or_else(|| {
            FlashmarkError::parse(
                line_number,
                "note has no model (set 'model:' in the note, the preamble or the configuration)",
            )
        })?;

        let mut all_tags = self.document.tags.clone();
        all_tags.extend(tags);

        Ok(NoteBlock {
            title: title.clone(),
            id,
            card_id,
            model,
            deck: deck.or_else(|| self.document.deck.clone()),
            tags: all_tags,
            markdown: markdown.unwrap_or(self.document.markdown),
            fields,
            span: Span {
                start: header.start,
                end: self.lines.get(end).map_or(self.text.len(), |line| line.start),
                line: line_number,
            },
            id_insert_offset,
        })
    }

    fn field_text(&self, start: usize, end: usize) -> String {
        let mut lines: Vec<&str> = self.lines[start..end].iter().map(|l| l.content).collect();
        if lines.last().is_some_and(|last| last.trim().is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }
}

impl Iterator for Blocks<'_> {
    type Item = Result<NoteBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.lines.len() {
            return None;
        }
        let first = self.cursor;
        let end = (first + 1..self.lines.len())
            .find(|&i| matches!(self.lines[i].kind, LineKind::Block(_)))
            .unwrap_or(self.lines.len());
        self.cursor = end;
        Some(self.parse_block(first, end))
    }
}

fn classify_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut fence: Option<(char, usize)> = None;
    let mut start = 0;

    for raw in text.split_inclusive('\n') {
        let content = raw.trim_end_matches(['\n', '\r']);
        let kind = match fence {
            Some((fence_char, len)) => {
                if is_fence_close(content, fence_char, len) {
                    fence = None;
                }
                LineKind::Text
            }
            None => {
                if let Some(opened) = fence_open(content) {
                    fence = Some(opened);
                    LineKind::Text
                } else {
                    header_kind(content)
                }
            }
        };
        lines.push(Line {
            start,
            next: start + raw.len(),
            content,
            kind,
        });
        start += raw.len();
    }
    lines
}

fn header_kind(line: &str) -> LineKind {
    if let Some(rest) = line.strip_prefix("##") {
        if rest.starts_with([' ', '\t']) {
            return LineKind::Field(rest.trim().to_string());
        }
    } else if let Some(rest) = line.strip_prefix('#') {
        if rest.starts_with([' ', '\t']) {
            return LineKind::Block(rest.trim().to_string());
        }
    }
    LineKind::Text
}

fn fence_open(line: &str) -> Option<(char, usize)> {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let fence_char = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.len() - trimmed.trim_start_matches(fence_char).len();
    (len >= 3).then_some((fence_char, len))
}

fn is_fence_close(line: &str, fence_char: char, len: usize) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= len && trimmed.chars().all(|c| c == fence_char)
}

/// Splits `key: value`, lowercasing the key. Keys are single words.
fn key_value(line: &str) -> Option<(String, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return None;
    }
    Some((key.to_lowercase(), value.trim()))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "yes" | "on" | "1")
}

fn parse_id(value: &str, what: &str, line: usize) -> Result<Option<i64>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<i64>()
        .map(Some)
        .map_err(|_| FlashmarkError::parse(line, format!("invalid {what} id '{value}'")))
}
