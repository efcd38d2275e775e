//! Note data shared by the parser, the reconciler and the collection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable note identifier assigned by the collection at creation.
pub type NoteId = i64;
/// Card identifier; a note owns one or more cards.
pub type CardId = i64;
/// Deck identifier.
pub type DeckId = i64;
/// Model (note type) identifier.
pub type ModelId = i64;

/// Location of a note block in its source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Byte offset of the block header line.
    pub start: usize,
    /// Byte offset one past the block's last byte.
    pub end: usize,
    /// 1-based line number of the block header.
    pub line: usize,
}

/// One note as written in a Markdown document.
///
/// Produced by [`crate::parse`]; consumed once by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteBlock {
    /// Text after the `#` of the block header.
    pub title: String,
    /// Existing note ID (`nid:`); `None` means the block describes a new note
    /// unless `card_id` is set.
    pub id: Option<NoteId>,
    /// Existing card ID (`cid:`), used to find the note when `id` is absent.
    pub card_id: Option<CardId>,
    pub model: String,
    /// Explicit deck; `None` falls back to the configured default deck on creation
    /// and leaves the deck untouched on update.
    pub deck: Option<String>,
    pub tags: BTreeSet<String>,
    /// Whether field text is Markdown (`true`) or plain text.
    pub markdown: bool,
    /// Field name to raw text, in document order.
    pub fields: Vec<(String, String)>,
    pub span: Span,
    /// Byte offset where an injected `nid:` line belongs.
    pub id_insert_offset: usize,
}

impl NoteBlock {
    /// Returns `true` when the block refers to a note that should already exist.
    pub fn is_existing(&self) -> bool {
        self.id.is_some() || self.card_id.is_some()
    }

    /// Returns the raw text of the named field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .map(|(_, text)| text.as_str())
    }
}

/// A note as currently stored in the collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNote {
    pub id: NoteId,
    pub model_id: ModelId,
    pub model_name: String,
    /// Rich-text field values in model field order.
    pub fields: Vec<String>,
    pub tags: BTreeSet<String>,
    /// Deck of the note's first card, if it has any.
    pub deck: Option<String>,
    pub card_count: usize,
    /// Unix timestamp (seconds) of the last modification.
    pub modified: i64,
}

/// A field value in both of its representations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    pub plain: String,
    pub rich: String,
}

/// Splits a `tags:` value into a tag set. Commas are treated as separators.
pub fn parse_tags(value: &str) -> BTreeSet<String> {
    value
        .replace(',', " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}
