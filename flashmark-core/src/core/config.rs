//! Synchronization settings.

use crate::{BlockDefaults, CodecOptions, LatexCommands, LatexMode, DEFAULT_DECK};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// What happens to the stored tags of an updated note.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TagPolicy {
    /// The block's tags become the note's tags.
    #[default]
    Replace,
    /// The block's tags are added; stored tags are never removed.
    Additive,
}

/// What happens when a block names a deck the collection does not have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeckPolicy {
    #[default]
    CreateMissing,
    RequireExisting,
}

/// Settings for a synchronization run. Every field has a default, so a
/// partial JSON object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Deck for new notes whose block names none.
    pub default_deck: String,
    /// Model for blocks when neither the block nor the preamble names one.
    pub default_model: Option<String>,
    /// Tags added to every block.
    pub default_tags: BTreeSet<String>,
    pub tag_policy: TagPolicy,
    pub deck_policy: DeckPolicy,
    pub latex_mode: LatexMode,
    /// Whether blocks are Markdown unless they say otherwise.
    pub markdown: bool,
    pub latex_commands: LatexCommands,
    /// Collection file used when none is given on the command line.
    pub collection_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_deck: DEFAULT_DECK.to_string(),
            default_model: None,
            default_tags: BTreeSet::new(),
            tag_policy: TagPolicy::default(),
            deck_policy: DeckPolicy::default(),
            latex_mode: LatexMode::default(),
            markdown: true,
            latex_commands: LatexCommands::default(),
            collection_path: None,
        }
    }
}

impl SyncConfig {
    /// Fallbacks handed to the parser.
    ///
    /// The default deck is not among them; it only applies to new notes.
    pub fn block_defaults(&self) -> BlockDefaults {
        BlockDefaults {
            model: self.default_model.clone(),
            deck: None,
            tags: self.default_tags.clone(),
            markdown: self.markdown,
        }
    }

    pub fn codec_options(&self, markdown: bool) -> CodecOptions {
        CodecOptions {
            markdown,
            latex_mode: self.latex_mode,
        }
    }
}
