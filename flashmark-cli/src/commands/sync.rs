use anyhow::{Context, Result};
use clap::Args;
use flashmark_core::{
    parse_tags, write_atomically, CommandRenderer, PendingSync, SyncReport, Synchronizer,
};
use serde::Serialize;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use crate::app::App;
use crate::OutputFormat;

#[derive(Args, Debug, Default)]
pub struct SyncOptions {
    /// Write the ids of new notes back into each document
    #[arg(long)]
    pub update_file: bool,
    /// Deck for new notes that name none
    #[arg(long)]
    pub deck: Option<String>,
    /// Model for blocks that name none
    #[arg(long)]
    pub model: Option<String>,
    /// Tags added to every block (space or comma separated)
    #[arg(long)]
    pub tags: Option<String>,
    /// Store block text as plain text with line breaks, not Markdown, unless a block says otherwise
    #[arg(long)]
    pub no_markdown: bool,
    /// Report what would change, then roll back
    #[arg(long, conflicts_with = "yes")]
    pub dry_run: bool,
    /// Commit without asking
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileReport<'a> {
    file: &'a Path,
    committed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rewritten: Option<bool>,
    report: &'a SyncReport,
}

pub fn run(mut app: App, files: &[PathBuf], options: &SyncOptions, format: OutputFormat) -> Result<()> {
    apply_overrides(&mut app, options);
    let renderer = CommandRenderer::new(app.config.latex_commands.clone());
    let synchronizer = Synchronizer::new(&app.config, &renderer);
    let mut collection = app.open_collection()?;
    let interactive = !options.yes && io::stdin().is_terminal();

    let mut failed = 0;
    for path in files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let pending = synchronizer
            .prepare(&mut collection, &text)
            .map_err(|e| anyhow::anyhow!(e.user_message()))
            .with_context(|| format!("synchronizing {}", path.display()))?;
        failed += pending.report().tally.failed;

        if format == OutputFormat::Plain {
            println!("{}:\n{}", path.display(), pending.report());
        }

        let decision = decide(&pending, options, interactive)?;
        let (report, committed, rewritten) = match decision {
            Decision::Commit => {
                let committed = pending.commit()?;
                let mut rewritten = None;
                if options.update_file {
                    let changed = match committed.rewrite(&text) {
                        Some(new_text) => {
                            write_atomically(path, &new_text)?;
                            log::info!("wrote note ids into {}", path.display());
                            true
                        }
                        None => false,
                    };
                    rewritten = Some(changed);
                }
                (committed.report, true, rewritten)
            }
            Decision::Discard => (pending.rollback()?, false, None),
        };

        match format {
            OutputFormat::Json => {
                let out = FileReport {
                    file: path,
                    committed,
                    rewritten,
                    report: &report,
                };
                println!("{}", serde_json::to_string(&out)?);
            }
            OutputFormat::Plain if !committed && report.tally.has_changes() => {
                println!("(not committed)");
            }
            OutputFormat::Plain => {}
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} note(s) could not be synchronized");
    }
    Ok(())
}

fn apply_overrides(app: &mut App, options: &SyncOptions) {
    let config = &mut app.config;
    if let Some(deck) = &options.deck {
        config.default_deck = deck.clone();
    }
    if let Some(model) = &options.model {
        config.default_model = Some(model.clone());
    }
    if let Some(tags) = &options.tags {
        config.default_tags.extend(parse_tags(tags));
    }
    if options.no_markdown {
        config.markdown = false;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Commit,
    Discard,
}

fn decide(pending: &PendingSync<'_>, options: &SyncOptions, interactive: bool) -> Result<Decision> {
    if options.dry_run || !pending.report().tally.has_changes() {
        return Ok(Decision::Discard);
    }
    if !interactive {
        return Ok(Decision::Commit);
    }
    let stdin = io::stdin();
    confirm(&mut stdin.lock(), &mut io::stderr())
}

fn confirm(input: &mut impl BufRead, prompt: &mut impl Write) -> Result<Decision> {
    write!(prompt, "Commit these changes? [y/N] ")?;
    prompt.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Ok(Decision::Commit),
        _ => Ok(Decision::Discard),
    }
}
