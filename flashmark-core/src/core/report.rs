//! Human- and machine-readable summaries of a synchronization run.

use crate::{FieldChange, NoteId, Outcome, ReconciliationResult};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    Created,
    Updated,
    Unchanged,
    Skipped,
    Failed,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeckMove {
    pub from: String,
    pub to: String,
}

/// One block's line in the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    pub kind: EntryKind,
    pub note_id: Option<NoteId>,
    pub title: String,
    pub model: String,
    /// Source line of the block header.
    pub line: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldChange>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub tags_added: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub tags_removed: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deck: Option<DeckMove>,
    /// Skip reason or error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Tally {
    /// Returns `true` when committing would change the collection.
    pub fn has_changes(&self) -> bool {
        self.created + self.updated > 0
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.skipped + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub entries: Vec<ReportEntry>,
    pub tally: Tally,
}

impl SyncReport {
    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::Failed)
    }
}

/// Builds the report for a run's results, in document order.
pub fn summarize(results: &[ReconciliationResult]) -> SyncReport {
    let mut report = SyncReport::default();

    for result in results {
        let mut entry = ReportEntry {
            kind: EntryKind::Unchanged,
            note_id: result.outcome.note_id(),
            title: result.title.clone(),
            model: result.model.clone(),
            line: result.span.line,
            fields: Vec::new(),
            tags_added: BTreeSet::new(),
            tags_removed: BTreeSet::new(),
            deck: None,
            detail: None,
        };

        match &result.outcome {
            Outcome::Created { .. } => {
                entry.kind = EntryKind::Created;
                report.tally.created += 1;
            }
            Outcome::Updated { diff, .. } => {
                entry.kind = EntryKind::Updated;
                entry.fields = diff.fields.clone();
                entry.tags_added = diff.tags_added.clone();
                entry.tags_removed = diff.tags_removed.clone();
                entry.deck = diff.deck.as_ref().map(|(from, to)| DeckMove {
                    from: from.clone(),
                    to: to.clone(),
                });
                report.tally.updated += 1;
            }
            Outcome::Unchanged { .. } => report.tally.unchanged += 1,
            Outcome::Skipped { reason } => {
                entry.kind = EntryKind::Skipped;
                entry.detail = Some(reason.clone());
                report.tally.skipped += 1;
            }
            Outcome::Failed { error } => {
                entry.kind = EntryKind::Failed;
                entry.detail = Some(error.user_message());
                report.tally.failed += 1;
            }
        }
        report.entries.push(entry);
    }
    report
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entries.iter().filter(|e| e.kind != EntryKind::Unchanged) {
            write!(f, "{:<9} line {:<5}", entry.kind, entry.line)?;
            if let Some(id) = entry.note_id {
                write!(f, " note {id}")?;
            }
            write!(f, " \"{}\"", entry.title)?;
            match &entry.detail {
                Some(detail) => writeln!(f, ": {detail}")?,
                None => writeln!(f)?,
            }

            for change in &entry.fields {
                writeln!(f, "    ## {}", change.name)?;
                for line in change.before.lines() {
                    writeln!(f, "    - {line}")?;
                }
                for line in change.after.lines() {
                    writeln!(f, "    + {line}")?;
                }
            }
            if !entry.tags_added.is_empty() || !entry.tags_removed.is_empty() {
                let added = entry.tags_added.iter().map(|t| format!("+{t}"));
                let removed = entry.tags_removed.iter().map(|t| format!("-{t}"));
                writeln!(f, "    tags: {}", added.chain(removed).collect::<Vec<_>>().join(" "))?;
            }
            if let Some(deck) = &entry.deck {
                writeln!(f, "    deck: {} -> {}", deck.from, deck.to)?;
            }
        }

        let tally = &self.tally;
        write!(
            f,
            "{} created, {} updated, {} unchanged, {} skipped, {} failed",
            tally.created, tally.updated, tally.unchanged, tally.skipped, tally.failed
        )
    }
}
