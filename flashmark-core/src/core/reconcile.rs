//! Decides what a note block means for the collection and applies it.
//!
//! A block without an identifier creates a note; a block with `nid:` (or
//! `cid:`) updates the note it names. Each block runs inside its own store
//! savepoint, so a block that fails leaves no partial writes behind while the
//! blocks before and after it are unaffected.

use crate::{
    decode, encode_markup, extract_latex, markup_was_edited, normalize, DeckId, DeckPolicy, FieldValue, FlashmarkError,
    LatexRenderer, Model, ModelTable, NoteBlock, NoteId, NoteStore, Result, Span, SyncConfig, TagPolicy,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

/// Per-run state shared by every block of a document.
pub struct ReconcileContext<'a> {
    pub config: &'a SyncConfig,
    pub models: &'a ModelTable,
    pub renderer: &'a dyn LatexRenderer,
    /// Media file names rendered or found during this run.
    pub rendered: HashSet<String>,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(config: &'a SyncConfig, models: &'a ModelTable, renderer: &'a dyn LatexRenderer) -> Self {
        Self {
            config,
            models,
            renderer,
            rendered: HashSet::new(),
        }
    }
}

/// One changed field, as plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub name: String,
    pub before: String,
    pub after: String,
}

/// Everything an update changes about a note.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDiff {
    pub fields: Vec<FieldChange>,
    pub tags_added: BTreeSet<String>,
    pub tags_removed: BTreeSet<String>,
    /// `(from, to)` deck names.
    pub deck: Option<(String, String)>,
}

impl NoteDiff {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.tags_added.is_empty()
            && self.tags_removed.is_empty()
            && self.deck.is_none()
    }

    fn tags_changed(&self) -> bool {
        !self.tags_added.is_empty() || !self.tags_removed.is_empty()
    }
}

#[derive(Debug)]
pub enum Outcome {
    Created { id: NoteId },
    Updated { id: NoteId, diff: NoteDiff },
    Unchanged { id: NoteId },
    /// Nothing was written, by choice (empty first field, duplicate note).
    Skipped { reason: String },
    Failed { error: FlashmarkError },
}

impl Outcome {
    pub fn note_id(&self) -> Option<NoteId> {
        match self {
            Self::Created { id } | Self::Updated { id, .. } | Self::Unchanged { id } => Some(*id),
            Self::Skipped { .. } | Self::Failed { .. } => None,
        }
    }

    /// Returns `true` when the outcome wrote to the store.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Created { .. } | Self::Updated { .. })
    }
}

/// What happened to one block.
#[derive(Debug)]
pub struct ReconciliationResult {
    pub outcome: Outcome,
    pub title: String,
    pub model: String,
    pub span: Span,
    /// Where an `nid:` line for a created note belongs in the source.
    pub id_insert_offset: usize,
}

/// Reconciles one block against the store.
///
/// Per-note problems are returned as [`Outcome::Failed`] with the block's
/// savepoint rolled back.
///
/// # Errors
///
/// Only fatal errors (see [`FlashmarkError::is_fatal`]) are returned; the
/// caller must then abandon the whole transaction.
pub fn reconcile<S: NoteStore + ?Sized>(
    block: &NoteBlock,
    store: &mut S,
    ctx: &mut ReconcileContext<'_>,
) -> Result<ReconciliationResult> {
    store.begin_block()?;

    let outcome = match apply(block, store, ctx) {
        Ok(outcome) => outcome,
        Err(error) if !error.is_fatal() => Outcome::Failed { error },
        Err(error) => return Err(error),
    };
    store.end_block(outcome.is_write())?;

    match &outcome {
        Outcome::Created { id } => log::info!("line {}: created note {id}", block.span.line),
        Outcome::Updated { id, diff } => log::info!(
            "line {}: updated note {id} ({} field(s) changed)",
            block.span.line,
            diff.fields.len()
        ),
        Outcome::Unchanged { id } => log::debug!("line {}: note {id} unchanged", block.span.line),
        Outcome::Skipped { reason } => log::info!("line {}: skipped: {reason}", block.span.line),
        Outcome::Failed { error } => log::warn!("line {}: {error}", block.span.line),
    }

    Ok(ReconciliationResult {
        outcome,
        title: block.title.clone(),
        model: block.model.clone(),
        span: block.span,
        id_insert_offset: block.id_insert_offset,
    })
}

fn apply<S: NoteStore + ?Sized>(
    block: &NoteBlock,
    store: &mut S,
    ctx: &mut ReconcileContext<'_>,
) -> Result<Outcome> {
    match existing_note_id(block, store)? {
        Some(id) => update(id, block, store, ctx),
        None => create(block, store, ctx),
    }
}

fn existing_note_id<S: NoteStore + ?Sized>(block: &NoteBlock, store: &S) -> Result<Option<NoteId>> {
    if let Some(id) = block.id {
        return Ok(Some(id));
    }
    match block.card_id {
        Some(card_id) => store
            .note_for_card(card_id)?
            .map(Some)
            .ok_or(FlashmarkError::UnknownCard(card_id)),
        None => Ok(None),
    }
}

fn create<S: NoteStore + ?Sized>(
    block: &NoteBlock,
    store: &mut S,
    ctx: &mut ReconcileContext<'_>,
) -> Result<Outcome> {
    let models = ctx.models;
    let model = models.get(&block.model)?;
    let positions = model.field_positions(block.fields.iter().map(|(name, _)| name.as_str()))?;
    let options = ctx.config.codec_options(block.markdown);

    let mut fields = vec![String::new(); model.fields.len()];
    for ((_, text), &position) in block.fields.iter().zip(&positions) {
        fields[position] = decode(text, &options)?;
    }

    let Some(first) = fields.first().filter(|first| !first.is_empty()) else {
        let name = model.fields.first().map(String::as_str).unwrap_or_default();
        return Ok(Outcome::Skipped {
            reason: format!("first field '{name}' is empty"),
        });
    };
    if let Some(existing) = store.find_duplicate(model, first)? {
        return Ok(Outcome::Skipped {
            reason: format!("duplicate of note {existing}"),
        });
    }

    let deck_name = block.deck.as_deref().unwrap_or(&ctx.config.default_deck);
    let deck = resolve_deck(store, deck_name, ctx.config.deck_policy)?;

    render_latex(&fields, model, store, ctx)?;
    let id = store.create_note(model, &fields, &block.tags, deck)?;
    Ok(Outcome::Created { id })
}

fn update<S: NoteStore + ?Sized>(
    id: NoteId,
    block: &NoteBlock,
    store: &mut S,
    ctx: &mut ReconcileContext<'_>,
) -> Result<Outcome> {
    let current = store.get_note(id)?.ok_or(FlashmarkError::UnknownIdentifier(id))?;
    if current.model_name != block.model {
        return Err(FlashmarkError::ModelMismatch {
            note_id: id,
            expected: block.model.clone(),
            actual: current.model_name,
        });
    }

    let models = ctx.models;
    let model = models.get(&block.model)?;
    let positions = model.field_positions(block.fields.iter().map(|(name, _)| name.as_str()))?;
    let options = ctx.config.codec_options(block.markdown);

    let mut fields = current.fields.clone();
    fields.resize(model.fields.len(), String::new());
    let mut diff = NoteDiff::default();

    for ((_, text), &position) in block.fields.iter().zip(&positions) {
        let name = &model.fields[position];
        let stored = FieldValue::from_rich(std::mem::take(&mut fields[position]));
        let edited_in_store = markup_was_edited(&stored.rich, ctx.config.latex_mode);
        if !edited_in_store && stored.plain == normalize(text) {
            fields[position] = stored.rich;
            continue;
        }
        let edited = FieldValue::from_plain(text, &options)?;
        if edited.rich == stored.rich {
            fields[position] = stored.rich;
            continue;
        }
        let before = if edited_in_store {
            log::warn!("note {id}: field '{name}' was edited in the collection, replacing it");
            encode_markup(&stored.rich)
        } else {
            stored.plain
        };
        fields[position] = edited.rich;
        diff.fields.push(FieldChange {
            name: name.clone(),
            before,
            after: edited.plain,
        });
    }

    let tags = match ctx.config.tag_policy {
        TagPolicy::Replace => block.tags.clone(),
        TagPolicy::Additive => current.tags.union(&block.tags).cloned().collect(),
    };
    diff.tags_added = tags.difference(&current.tags).cloned().collect();
    diff.tags_removed = current.tags.difference(&tags).cloned().collect();

    let mut new_deck: Option<DeckId> = None;
    if let Some(name) = &block.deck {
        if current.deck.as_deref() != Some(name.as_str()) {
            new_deck = Some(resolve_deck(store, name, ctx.config.deck_policy)?);
            diff.deck = Some((current.deck.clone().unwrap_or_default(), name.clone()));
        }
    }

    if diff.is_empty() {
        return Ok(Outcome::Unchanged { id });
    }

    render_latex(&fields, model, store, ctx)?;
    if !diff.fields.is_empty() || diff.tags_changed() {
        store.update_note(id, &fields, &tags)?;
    }
    if let Some(deck) = new_deck {
        store.set_note_deck(id, deck)?;
    }
    Ok(Outcome::Updated { id, diff })
}

fn resolve_deck<S: NoteStore + ?Sized>(store: &mut S, name: &str, policy: DeckPolicy) -> Result<DeckId> {
    if let Some(id) = store.find_deck(name)? {
        return Ok(id);
    }
    match policy {
        DeckPolicy::CreateMissing => store.create_deck(name),
        DeckPolicy::RequireExisting => Err(FlashmarkError::UnknownDeck(name.to_string())),
    }
}

/// Renders every LaTeX snippet of `fields` whose image is not yet in the
/// media directory, at most once per run.
fn render_latex<S: NoteStore + ?Sized>(
    fields: &[String],
    model: &Model,
    store: &S,
    ctx: &mut ReconcileContext<'_>,
) -> Result<()> {
    for snippet in fields.iter().flat_map(|field| extract_latex(field)) {
        let name = snippet.file_name();
        if ctx.rendered.contains(&name) {
            continue;
        }
        let target = store.media_dir().join(&name);
        if target.exists() {
            log::debug!("{name} already exists, not rendering");
        } else {
            ctx.renderer.render(&snippet, model, &target)?;
        }
        ctx.rendered.insert(name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_with, Collection, LatexSnippet};
    use std::cell::Cell;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct FakeRenderer {
        calls: Cell<usize>,
        fail: bool,
    }

    impl FakeRenderer {
        fn new() -> Self {
            Self { calls: Cell::new(0), fail: false }
        }

        fn failing() -> Self {
            Self { calls: Cell::new(0), fail: true }
        }
    }

    impl LatexRenderer for FakeRenderer {
        fn render(&self, snippet: &LatexSnippet, _model: &Model, target: &Path) -> Result<PathBuf> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(FlashmarkError::Render {
                    source_text: snippet.source.clone(),
                    message: "boom".to_string(),
                });
            }
            std::fs::create_dir_all(target.parent().unwrap()).unwrap();
            std::fs::write(target, b"png").unwrap();
            Ok(target.to_path_buf())
        }
    }

    fn collection() -> (TempDir, Collection) {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::create(dir.path().join("collection.db")).unwrap();
        (dir, collection)
    }

    fn run(
        collection: &mut Collection,
        text: &str,
        config: &SyncConfig,
        renderer: &dyn LatexRenderer,
    ) -> Vec<ReconciliationResult> {
        let blocks = parse_with(text, &config.block_defaults()).unwrap();
        let mut tx = collection.begin().unwrap();
        let models = ModelTable::load(&tx, blocks.iter().map(|b| b.model.as_str())).unwrap();
        let mut ctx = ReconcileContext::new(config, &models, renderer);
        let results = blocks
            .iter()
            .map(|block| reconcile(block, &mut tx, &mut ctx).unwrap())
            .collect();
        tx.commit().unwrap();
        results
    }

    fn created_id(result: &ReconciliationResult) -> NoteId {
        match result.outcome {
            Outcome::Created { id } => id,
            ref other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn test_create_note_in_default_deck() {
        let (_dir, mut collection) = collection();
        let results = run(
            &mut collection,
            "# Q\nmodel: Basic\ntags: a b\n## Front\nQ\n## Back\n**A**\n",
            &SyncConfig::default(),
            &FakeRenderer::new(),
        );
        let id = created_id(&results[0]);

        let note = collection.get_note(id).unwrap().unwrap();
        assert_eq!(note.fields[0], "Q");
        assert!(note.fields[1].contains("<strong>A</strong>"));
        assert_eq!(note.deck.as_deref(), Some("Default"));
        assert_eq!(note.tags.len(), 2);
    }

    #[test]
    fn test_missing_fields_are_left_empty_on_create() {
        let (_dir, mut collection) = collection();
        let results = run(
            &mut collection,
            "# Q\nmodel: Basic\n## Front\nOnly the front\n",
            &SyncConfig::default(),
            &FakeRenderer::new(),
        );
        let note = collection.get_note(created_id(&results[0])).unwrap().unwrap();
        assert_eq!(note.fields, vec!["Only the front".to_string(), String::new()]);
    }

    #[test]
    fn test_empty_first_field_and_duplicates_are_skipped() {
        let (_dir, mut collection) = collection();
        let text = "# A\nmodel: Basic\n## Front\nSame\n# B\nmodel: Basic\n## Front\nSame\n# C\nmodel: Basic\n## Front\n\n## Back\nx\n";
        let results = run(&mut collection, text, &SyncConfig::default(), &FakeRenderer::new());

        let first = created_id(&results[0]);
        assert!(matches!(&results[1].outcome, Outcome::Skipped { reason } if *reason == format!("duplicate of note {first}")));
        assert!(matches!(&results[2].outcome, Outcome::Skipped { reason } if reason.contains("'Front' is empty")));
        assert_eq!(collection.note_count().unwrap(), 1);
    }

    #[test]
    fn test_per_note_errors_become_failed_results() {
        let (_dir, mut collection) = collection();
        let text = "# A\nmodel: Nope\n## Front\nQ\n\
                    # B\nmodel: Basic\n## Extra\nQ\n\
                    # C\nnid: 9999\nmodel: Basic\n## Front\nQ\n\
                    # D\ncid: 77\nmodel: Basic\n## Front\nQ\n\
                    # E\nmodel: Basic\n## Front\n$$x\n";
        let results = run(&mut collection, text, &SyncConfig::default(), &FakeRenderer::new());

        let errors: Vec<&FlashmarkError> = results
            .iter()
            .map(|r| match &r.outcome {
                Outcome::Failed { error } => error,
                other => panic!("expected Failed, got {other:?}"),
            })
            .collect();
        assert!(matches!(errors[0], FlashmarkError::UnknownModel(_)));
        assert!(matches!(errors[1], FlashmarkError::FieldMismatch { .. }));
        assert!(matches!(errors[2], FlashmarkError::UnknownIdentifier(9999)));
        assert!(matches!(errors[3], FlashmarkError::UnknownCard(77)));
        assert!(matches!(errors[4], FlashmarkError::Format(_)));
    }

    #[test]
    fn test_model_mismatch() {
        let (_dir, mut collection) = collection();
        let config = SyncConfig::default();
        let results = run(&mut collection, "# A\nmodel: Basic\n## Front\nQ\n", &config, &FakeRenderer::new());
        let id = created_id(&results[0]);

        let text = format!("# A\nnid: {id}\nmodel: Cloze\n## Text\nQ\n");
        let results = run(&mut collection, &text, &config, &FakeRenderer::new());
        assert!(matches!(
            &results[0].outcome,
            Outcome::Failed { error: FlashmarkError::ModelMismatch { actual, .. } } if actual == "Basic"
        ));
    }

    #[test]
    fn test_update_reports_field_tag_and_deck_changes() {
        let (_dir, mut collection) = collection();
        let config = SyncConfig::default();
        let renderer = FakeRenderer::new();
        let results = run(&mut collection, "# A\nmodel: Basic\ntags: old keep\n## Front\nQ\n## Back\nA\n", &config, &renderer);
        let id = created_id(&results[0]);

        let text = format!("# A\nnid: {id}\nmodel: Basic\ndeck: Moved\ntags: keep new\n## Front\nQ2\n## Back\nA\n");
        let results = run(&mut collection, &text, &config, &renderer);
        let Outcome::Updated { id: updated, diff } = &results[0].outcome else {
            panic!("expected Updated, got {:?}", results[0].outcome);
        };
        assert_eq!(*updated, id);
        assert_eq!(
            diff.fields,
            vec![FieldChange { name: "Front".into(), before: "Q".into(), after: "Q2".into() }]
        );
        assert_eq!(diff.tags_added, BTreeSet::from(["new".to_string()]));
        assert_eq!(diff.tags_removed, BTreeSet::from(["old".to_string()]));
        assert_eq!(diff.deck, Some(("Default".to_string(), "Moved".to_string())));

        let note = collection.get_note(id).unwrap().unwrap();
        assert_eq!(note.fields, vec!["Q2", "A"]);
        assert_eq!(note.deck.as_deref(), Some("Moved"));
    }

    #[test]
    fn test_additive_tag_policy_keeps_stored_tags() {
        let (_dir, mut collection) = collection();
        let mut config = SyncConfig::default();
        let results = run(&mut collection, "# A\nmodel: Basic\ntags: stored\n## Front\nQ\n", &config, &FakeRenderer::new());
        let id = created_id(&results[0]);

        config.tag_policy = TagPolicy::Additive;
        let text = format!("# A\nnid: {id}\nmodel: Basic\ntags: extra\n## Front\nQ\n");
        run(&mut collection, &text, &config, &FakeRenderer::new());
        let tags = collection.get_note(id).unwrap().unwrap().tags;
        assert_eq!(tags, BTreeSet::from(["extra".to_string(), "stored".to_string()]));
    }

    #[test]
    fn test_unchanged_note_is_not_written() {
        let (_dir, mut collection) = collection();
        let config = SyncConfig::default();
        let results = run(&mut collection, "# A\nmodel: Basic\n## Front\nSome *Q*\n## Back\nA\n", &config, &FakeRenderer::new());
        let id = created_id(&results[0]);
        collection
            .connection()
            .execute("UPDATE notes SET modified = 1 WHERE id = ?", [id])
            .unwrap();

        let text = format!("# A\nnid: {id}\nmodel: Basic\n## Front\nSome *Q*  \n\n## Back\nA\n");
        let results = run(&mut collection, &text, &config, &FakeRenderer::new());
        assert!(matches!(results[0].outcome, Outcome::Unchanged { id: same } if same == id));
        assert_eq!(collection.get_note(id).unwrap().unwrap().modified, 1);
    }

    #[test]
    fn test_require_existing_deck() {
        let (_dir, mut collection) = collection();
        let config = SyncConfig {
            deck_policy: DeckPolicy::RequireExisting,
            ..SyncConfig::default()
        };
        let results = run(&mut collection, "# A\nmodel: Basic\ndeck: Nowhere\n## Front\nQ\n", &config, &FakeRenderer::new());
        assert!(matches!(
            &results[0].outcome,
            Outcome::Failed { error: FlashmarkError::UnknownDeck(name) } if name == "Nowhere"
        ));
    }

    #[test]
    fn test_failed_block_rolls_back_its_own_writes() {
        let (_dir, mut collection) = collection();
        let text = "# A\nmodel: Basic\ndeck: Fresh\n## Front\n$x^2$\n# B\nmodel: Basic\n## Front\nplain\n";
        let results = run(&mut collection, text, &SyncConfig::default(), &FakeRenderer::failing());

        assert!(matches!(&results[0].outcome, Outcome::Failed { error: FlashmarkError::Render { .. } }));
        created_id(&results[1]);
        assert_eq!(collection.deck_names().unwrap(), vec!["Default"]);
        assert_eq!(collection.note_count().unwrap(), 1);
    }

    #[test]
    fn test_latex_rendered_once_per_run() {
        let (_dir, mut collection) = collection();
        let renderer = FakeRenderer::new();
        let text = "# A\nmodel: Basic\n## Front\nOne $$x^2$$\n# B\nmodel: Basic\n## Front\nTwo $$x^2$$\n";
        run(&mut collection, text, &SyncConfig::default(), &renderer);
        assert_eq!(renderer.calls.get(), 1);

        let again = FakeRenderer::new();
        let text = "# C\nmodel: Basic\n## Front\nThree $$x^2$$\n";
        run(&mut collection, text, &SyncConfig::default(), &again);
        assert_eq!(again.calls.get(), 0);
    }

    #[test]
    fn test_card_id_resolves_to_note() {
        let (_dir, mut collection) = collection();
        let config = SyncConfig::default();
        let results = run(&mut collection, "# A\nmodel: Basic\n## Front\nQ\n", &config, &FakeRenderer::new());
        let id = created_id(&results[0]);
        let card_id: i64 = collection
            .connection()
            .query_row("SELECT id FROM cards WHERE note_id = ?", [id], |row| row.get(0))
            .unwrap();

        let text = format!("# A\ncid: {card_id}\nmodel: Basic\n## Front\nQ changed\n");
        let results = run(&mut collection, &text, &config, &FakeRenderer::new());
        assert!(matches!(results[0].outcome, Outcome::Updated { id: updated, .. } if updated == id));
    }

    #[test]
    fn test_markup_edited_in_collection_is_reported_and_replaced() {
        let (_dir, mut collection) = collection();
        let config = SyncConfig::default();
        let results = run(&mut collection, "# A\nmodel: Basic\n## Front\nSome *a*\n## Back\nB\n", &config, &FakeRenderer::new());
        let id = created_id(&results[0]);
        let changed = collection
            .connection()
            .execute(
                "UPDATE notes SET fields_json = replace(fields_json, '<em>a</em>', '<em>EDITED</em>') WHERE id = ?",
                [id],
            )
            .unwrap();
        assert_eq!(changed, 1);

        let text = format!("# A\nnid: {id}\nmodel: Basic\n## Front\nSome *a*\n## Back\nB\n");
        let results = run(&mut collection, &text, &config, &FakeRenderer::new());
        let Outcome::Updated { diff, .. } = &results[0].outcome else {
            panic!("expected Updated, got {:?}", results[0].outcome);
        };
        assert_eq!(diff.fields.len(), 1);
        assert_eq!(diff.fields[0].before, "<p>Some <em>EDITED</em></p>");
        assert_eq!(diff.fields[0].after, "Some *a*");

        let note = collection.get_note(id).unwrap().unwrap();
        assert!(note.fields[0].contains("<em>a</em>"));
    }

    #[test]
    fn test_field_names_from_older_documents_are_accepted() {
        let (_dir, mut collection) = collection();
        let config = SyncConfig::default();
        let results = run(
            &mut collection,
            "# A\nmodel: Basic\n## Front (markdown)\nQ\n## back\nA\n",
            &config,
            &FakeRenderer::new(),
        );
        let id = created_id(&results[0]);
        assert_eq!(collection.get_note(id).unwrap().unwrap().fields, vec!["Q", "A"]);

        let text = format!("# A\nnid: {id}\nmodel: Basic\n## front\nQ2\n");
        let results = run(&mut collection, &text, &config, &FakeRenderer::new());
        let Outcome::Updated { diff, .. } = &results[0].outcome else {
            panic!("expected Updated, got {:?}", results[0].outcome);
        };
        assert_eq!(diff.fields[0].name, "Front");
    }
}
