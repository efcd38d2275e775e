//! Drives one document through parsing, reconciliation and rewriting.
//!
//! A run works in a single collection transaction. [`Synchronizer::prepare`]
//! reconciles every block and hands back a [`PendingSync`] so the caller can
//! look at the report before deciding to commit or roll back. The document is
//! only rewritten from a [`Committed`] run.

use crate::{
    apply_edits, parse_with, plan_id_edits, reconcile, summarize, write_atomically, Collection,
    CollectionTx, LatexRenderer, ModelTable, ReconcileContext, ReconciliationResult, Result,
    SyncConfig, SyncReport,
};
use std::path::Path;

pub struct Synchronizer<'a> {
    config: &'a SyncConfig,
    renderer: &'a dyn LatexRenderer,
}

impl<'a> Synchronizer<'a> {
    pub fn new(config: &'a SyncConfig, renderer: &'a dyn LatexRenderer) -> Self {
        Self { config, renderer }
    }

    /// Reconciles every block of `text` inside a new transaction.
    ///
    /// # Errors
    ///
    /// - [`crate::FlashmarkError::Parse`] if the document is malformed; no
    ///   transaction is opened.
    /// - [`crate::FlashmarkError::TransactionAborted`] if a fatal error occurs;
    ///   the transaction has been rolled back.
    pub fn prepare<'c>(&self, collection: &'c mut Collection, text: &str) -> Result<PendingSync<'c>> {
        let blocks = parse_with(text, &self.config.block_defaults())?;
        log::debug!("parsed {} note block(s)", blocks.len());

        let mut tx = collection.begin().map_err(|e| e.abort_at(None))?;
        let models = ModelTable::load(&tx, blocks.iter().map(|block| block.model.as_str()))
            .map_err(|e| e.abort_at(None))?;
        let mut ctx = ReconcileContext::new(self.config, &models, self.renderer);

        let mut results = Vec::with_capacity(blocks.len());
        for block in &blocks {
            match reconcile(block, &mut tx, &mut ctx) {
                Ok(result) => results.push(result),
                Err(error) => {
                    log::error!("aborting at line {}: {error}", block.span.line);
                    if let Err(rollback_error) = tx.rollback() {
                        log::error!("rollback failed: {rollback_error}");
                    }
                    return Err(error.abort_at(Some(block.span.line)));
                }
            }
        }

        let report = summarize(&results);
        Ok(PendingSync {
            tx,
            results,
            report,
        })
    }
}

/// A reconciled run whose transaction is still open.
///
/// Dropping it rolls the transaction back.
pub struct PendingSync<'c> {
    tx: CollectionTx<'c>,
    results: Vec<ReconciliationResult>,
    report: SyncReport,
}

impl PendingSync<'_> {
    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    pub fn results(&self) -> &[ReconciliationResult] {
        &self.results
    }

    /// Makes the run's writes permanent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::FlashmarkError::TransactionAborted`] if the commit fails.
    pub fn commit(self) -> Result<Committed> {
        self.tx.commit().map_err(|e| e.abort_at(None))?;
        log::info!("committed: {}", summary_line(&self.report));
        Ok(Committed {
            results: self.results,
            report: self.report,
        })
    }

    /// Discards the run's writes and returns its report.
    pub fn rollback(self) -> Result<SyncReport> {
        self.tx.rollback()?;
        log::info!("rolled back: {}", summary_line(&self.report));
        Ok(self.report)
    }
}

fn summary_line(report: &SyncReport) -> String {
    format!(
        "{} created, {} updated, {} failed",
        report.tally.created, report.tally.updated, report.tally.failed
    )
}

/// A run whose writes are persisted.
#[derive(Debug)]
pub struct Committed {
    pub results: Vec<ReconciliationResult>,
    pub report: SyncReport,
}

impl Committed {
    /// Returns `text` with `nid:` lines injected for the created notes, or
    /// `None` when nothing was created.
    pub fn rewrite(&self, text: &str) -> Option<String> {
        let edits = plan_id_edits(text, &self.results);
        if edits.is_empty() {
            return None;
        }
        Some(apply_edits(text, &edits))
    }
}

/// Synchronizes the document at `path` and commits. With `update_file`, the
/// identifiers of created notes are written back into the document.
///
/// # Errors
///
/// Returns an I/O error if the document cannot be read or written, and
/// otherwise the errors of [`Synchronizer::prepare`] and [`PendingSync::commit`].
pub fn sync_file(
    collection: &mut Collection,
    path: &Path,
    config: &SyncConfig,
    renderer: &dyn LatexRenderer,
    update_file: bool,
) -> Result<SyncReport> {
    let text = std::fs::read_to_string(path)?;
    let committed = Synchronizer::new(config, renderer)
        .prepare(collection, &text)?
        .commit()?;

    if update_file {
        if let Some(rewritten) = committed.rewrite(&text) {
            write_atomically(path, &rewritten)?;
            log::info!("updated {}", path.display());
        }
    }
    Ok(committed.report)
}
