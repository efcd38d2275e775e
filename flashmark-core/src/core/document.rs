//! Writing results back into the source document.

use crate::{encode, is_markdown_field, Model, Outcome, PersistedNote, ReconciliationResult, Result};
use std::fmt::Write as _;
use std::io::Write as _;
use std::ops::Range;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replacement of a byte range of the document. An empty range is an insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub span: Range<usize>,
    pub replacement: String,
}

/// Plans an `nid:` line for every created note.
///
/// Blocks that already carry an identifier (`nid:` or `cid:`) are left alone.
pub fn plan_id_edits(text: &str, results: &[ReconciliationResult]) -> Vec<Edit> {
    results
        .iter()
        .filter_map(|result| match result.outcome {
            Outcome::Created { id } => Some((id, result.id_insert_offset.min(text.len()))),
            _ => None,
        })
        .map(|(id, at)| {
            let before = &text[..at];
            let eol = if before.ends_with("\r\n") || (!before.ends_with('\n') && text.contains("\r\n")) {
                "\r\n"
            } else {
                "\n"
            };
            let separator = if at > 0 && !before.ends_with('\n') { eol } else { "" };
            Edit {
                span: at..at,
                replacement: format!("{separator}nid: {id}{eol}"),
            }
        })
        .collect()
}

/// Applies non-overlapping edits in a single pass over `text`.
///
/// Edits overlapping an earlier one are dropped.
pub fn apply_edits(text: &str, edits: &[Edit]) -> String {
    let mut ordered: Vec<&Edit> = edits.iter().collect();
    ordered.sort_by_key(|edit| (edit.span.start, edit.span.end));

    let added: usize = ordered.iter().map(|edit| edit.replacement.len()).sum();
    let mut output = String::with_capacity(text.len() + added);
    let mut copied = 0;
    for edit in ordered {
        if edit.span.start < copied || edit.span.end > text.len() {
            log::warn!("dropping overlapping edit at {:?}", edit.span);
            continue;
        }
        output.push_str(&text[copied..edit.span.start]);
        output.push_str(&edit.replacement);
        copied = edit.span.end;
    }
    output.push_str(&text[copied..]);
    output
}

/// Replaces the file at `path` with `contents` so that readers see either the
/// old or the new document, never a partial one.
///
/// # Errors
///
/// Returns [`crate::FlashmarkError::Io`] if the temporary file cannot be
/// written or renamed into place.
pub fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    if let Ok(metadata) = std::fs::metadata(path) {
        file.as_file().set_permissions(metadata.permissions())?;
    }
    file.persist(path).map_err(|e| e.error)?;
    log::debug!("wrote {}", path.display());
    Ok(())
}

/// Renders a stored note as a document block.
///
/// Parsing the output and reconciling it against the same note reports it
/// as unchanged.
pub fn render_note(note: &PersistedNote, model: &Model) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Note");
    let _ = writeln!(out, "model: {}", note.model_name);
    if !note.tags.is_empty() {
        let tags: Vec<&str> = note.tags.iter().map(String::as_str).collect();
        let _ = writeln!(out, "tags: {}", tags.join(" "));
    }
    let _ = writeln!(out, "nid: {}", note.id);
    if let Some(deck) = &note.deck {
        let _ = writeln!(out, "deck: {deck}");
    }
    if !note.fields.iter().any(|field| is_markdown_field(field)) {
        let _ = writeln!(out, "markdown: false");
    }

    for (name, value) in model.fields.iter().zip(&note.fields) {
        let _ = write!(out, "\n## {name}\n{}\n", encode(value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Span, DEFAULT_LATEX_POST, DEFAULT_LATEX_PRE};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn created(id: i64, id_insert_offset: usize) -> ReconciliationResult {
        ReconciliationResult {
            outcome: Outcome::Created { id },
            title: String::new(),
            model: "Basic".to_string(),
            span: Span { start: 0, end: 0, line: 1 },
            id_insert_offset,
        }
    }

    #[test]
    fn test_plan_and_apply_id_edits() {
        let text = "# A\nmodel: Basic\n## Front\nQ\n# B\nmodel: Basic\n## Front\nR\n";
        let second = text.find("# B").unwrap() + "# B\nmodel: Basic\n".len();
        let results = vec![created(2, second), created(1, "# A\nmodel: Basic\n".len())];

        let edits = plan_id_edits(text, &results);
        assert_eq!(edits.len(), 2);
        assert_eq!(
            apply_edits(text, &edits),
            "# A\nmodel: Basic\nnid: 1\n## Front\nQ\n# B\nmodel: Basic\nnid: 2\n## Front\nR\n"
        );
    }

    #[test]
    fn test_only_created_results_get_edits() {
        let unchanged = ReconciliationResult {
            outcome: Outcome::Unchanged { id: 5 },
            ..created(0, 4)
        };
        assert!(plan_id_edits("# A\n", &[unchanged]).is_empty());
    }

    #[test]
    fn test_insertion_after_unterminated_line() {
        let edits = plan_id_edits("# A", &[created(3, 3)]);
        assert_eq!(apply_edits("# A", &edits), "# A\nnid: 3\n");
    }

    #[test]
    fn test_insertion_keeps_crlf_line_endings() {
        let text = "# A\r\nmodel: Basic\r\n## Front\r\nQ\r\n";
        let at = "# A\r\nmodel: Basic\r\n".len();
        let edits = plan_id_edits(text, &[created(7, at)]);
        assert_eq!(
            apply_edits(text, &edits),
            "# A\r\nmodel: Basic\r\nnid: 7\r\n## Front\r\nQ\r\n"
        );

        let edits = plan_id_edits("# A\r\n# B", &[created(8, 8)]);
        assert_eq!(apply_edits("# A\r\n# B", &edits), "# A\r\n# B\r\nnid: 8\r\n");
    }

    #[test]
    fn test_overlapping_edit_is_dropped() {
        let edits = vec![
            Edit { span: 0..3, replacement: "xyz".to_string() },
            Edit { span: 1..2, replacement: "!".to_string() },
        ];
        assert_eq!(apply_edits("abcd", &edits), "xyzd");
    }

    #[test]
    fn test_write_atomically_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "old").unwrap();

        write_atomically(&path, "new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_render_note() {
        let model = Model {
            id: 1,
            name: "Basic".to_string(),
            fields: vec!["Front".to_string(), "Back".to_string()],
            card_templates: 1,
            latex_pre: DEFAULT_LATEX_PRE.to_string(),
            latex_post: DEFAULT_LATEX_POST.to_string(),
        };
        let note = PersistedNote {
            id: 42,
            model_id: 1,
            model_name: "Basic".to_string(),
            fields: vec!["Capital of Norway?".to_string(), "Oslo<br />Norway".to_string()],
            tags: BTreeSet::from(["geo".to_string()]),
            deck: Some("Default".to_string()),
            card_count: 1,
            modified: 0,
        };
        assert_eq!(
            render_note(&note, &model),
            "# Note\nmodel: Basic\ntags: geo\nnid: 42\ndeck: Default\nmarkdown: false\n\n## Front\nCapital of Norway?\n\n## Back\nOslo\nNorway\n"
        );
    }
}
