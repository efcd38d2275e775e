//! Core library for Flashmark: keeps flashcards in a local spaced-repetition
//! collection in sync with Markdown documents.
//!
//! The usual entry point is [`Synchronizer`], which parses a document into
//! [`NoteBlock`]s, reconciles each block against an open [`Collection`] inside
//! one transaction, and reports what changed. [`sync_file`] wraps the whole
//! round trip for a file on disk.
//!
//! Types are re-exported from their respective sub-modules for convenience;
//! consumers should import from the crate root rather than the `core` module.

pub mod core;

// Re-export commonly used types.
#[doc(inline)]
pub use core::{
    codec::{
        decode, encode, encode_markup, is_markdown_field, markup_was_edited, media_references,
        normalize, render_markdown, CodecOptions, LatexMode,
    },
    collection::{Collection, CollectionTx, NoteStore, DEFAULT_DECK},
    config::{DeckPolicy, SyncConfig, TagPolicy},
    document::{apply_edits, plan_id_edits, render_note, write_atomically, Edit},
    error::{FlashmarkError, Result},
    latex::{extract_latex, CommandRenderer, LatexCommands, LatexKind, LatexRenderer, LatexSnippet},
    model::{Model, ModelTable, DEFAULT_LATEX_POST, DEFAULT_LATEX_PRE},
    note::{parse_tags, CardId, DeckId, FieldValue, ModelId, NoteBlock, NoteId, PersistedNote, Span},
    parser::{blocks, parse, parse_with, BlockDefaults, Blocks},
    reconcile::{
        reconcile, FieldChange, NoteDiff, Outcome, ReconcileContext, ReconciliationResult,
    },
    report::{summarize, DeckMove, EntryKind, ReportEntry, SyncReport, Tally},
    storage::Storage,
    sync::{sync_file, Committed, PendingSync, Synchronizer},
};
