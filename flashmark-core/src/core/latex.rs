//! LaTeX snippets embedded in rich text and their rendering to images.

use crate::{FlashmarkError, Model, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;

static SNIPPET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\[latex\](.+?)\[/latex\]|\[\$\$\](.+?)\[/\$\$\]|\[\$\](.+?)\[/\$\]")
        .expect("valid latex snippet regex")
});
static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br regex"));

/// How a snippet was delimited in the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatexKind {
    /// `[$]…[/$]`
    Inline,
    /// `[$$]…[/$$]`
    Display,
    /// `[latex]…[/latex]`
    Block,
}

impl LatexKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Inline => "$",
            Self::Display => "$$",
            Self::Block => "latex",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatexSnippet {
    pub source: String,
    pub kind: LatexKind,
}

impl LatexSnippet {
    /// Media file name of the rendered image, derived from the snippet content.
    pub fn file_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.tag().as_bytes());
        hasher.update(self.source.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("latex-{}.png", &digest[..40])
    }

    /// The complete LaTeX document for this snippet, wrapped in the model's
    /// preamble and postamble.
    pub fn document(&self, model: &Model) -> String {
        let body = match self.kind {
            LatexKind::Inline => format!("${}$", self.source),
            LatexKind::Display => format!("\\[{}\\]", self.source),
            LatexKind::Block => self.source.clone(),
        };
        format!("{}{}\n{}", model.latex_pre, body, model.latex_post)
    }
}

/// Finds the LaTeX snippets in a rich-text field, without duplicates.
pub fn extract_latex(rich: &str) -> Vec<LatexSnippet> {
    let mut snippets: Vec<LatexSnippet> = Vec::new();
    for caps in SNIPPET_RE.captures_iter(rich) {
        let (raw, kind) = if let Some(m) = caps.get(1) {
            (m.as_str(), LatexKind::Block)
        } else if let Some(m) = caps.get(2) {
            (m.as_str(), LatexKind::Display)
        } else if let Some(m) = caps.get(3) {
            (m.as_str(), LatexKind::Inline)
        } else {
            continue;
        };
        let snippet = LatexSnippet {
            source: unescape(raw).trim().to_string(),
            kind,
        };
        if !snippets.contains(&snippet) {
            snippets.push(snippet);
        }
    }
    snippets
}

fn unescape(text: &str) -> String {
    BR_RE
        .replace_all(text, "\n")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Renders one snippet to an image file.
pub trait LatexRenderer {
    /// Renders `snippet` and writes the image to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`FlashmarkError::Render`] when the toolchain fails.
    fn render(&self, snippet: &LatexSnippet, model: &Model, target: &Path) -> Result<PathBuf>;
}

/// Command lines used by [`CommandRenderer`]. They run in a scratch directory
/// that holds the document as `tmp.tex`; the last one must leave `tmp.png`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LatexCommands {
    pub latex: Vec<String>,
    pub dvipng: Vec<String>,
}

impl Default for LatexCommands {
    fn default() -> Self {
        let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect();
        Self {
            latex: owned(&["latex", "-interaction=nonstopmode", "tmp.tex"]),
            dvipng: owned(&[
                "dvipng", "-bg", "Transparent", "-D", "200", "-T", "tight", "tmp.dvi", "-o", "tmp.png",
            ]),
        }
    }
}

/// Renders through the external `latex` and `dvipng` programs.
#[derive(Debug, Clone, Default)]
pub struct CommandRenderer {
    commands: LatexCommands,
}

impl CommandRenderer {
    pub fn new(commands: LatexCommands) -> Self {
        Self { commands }
    }

    fn run(&self, args: &[String], dir: &Path, snippet: &LatexSnippet) -> Result<()> {
        let failed = |message: String| FlashmarkError::Render {
            source_text: snippet.source.clone(),
            message,
        };
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| failed("empty command line".to_string()))?;

        let output = Command::new(program)
            .args(rest)
            .current_dir(dir)
            .output()
            .map_err(|e| failed(format!("could not run {program}: {e}")))?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut lines = stdout.lines().chain(stderr.lines());
            let detail = lines
                .clone()
                .find(|line| line.starts_with('!'))
                .or_else(|| lines.find(|line| !line.trim().is_empty()))
                .unwrap_or_default()
                .trim()
                .to_string();
            return Err(failed(format!("{program} exited with {}: {detail}", output.status)));
        }
        Ok(())
    }
}

impl LatexRenderer for CommandRenderer {
    fn render(&self, snippet: &LatexSnippet, model: &Model, target: &Path) -> Result<PathBuf> {
        // File system trouble here only affects this snippet's note.
        let failed = |action: &str, e: std::io::Error| FlashmarkError::Render {
            source_text: snippet.source.clone(),
            message: format!("{action}: {e}"),
        };

        let scratch = tempfile::tempdir().map_err(|e| failed("could not create scratch directory", e))?;
        std::fs::write(scratch.path().join("tmp.tex"), snippet.document(model))
            .map_err(|e| failed("could not write tmp.tex", e))?;

        self.run(&self.commands.latex, scratch.path(), snippet)?;
        self.run(&self.commands.dvipng, scratch.path(), snippet)?;

        let image = scratch.path().join("tmp.png");
        if !image.exists() {
            return Err(FlashmarkError::Render {
                source_text: snippet.source.clone(),
                message: "no image was produced".to_string(),
            });
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| failed(&format!("could not create {}", parent.display()), e))?;
        }
        std::fs::copy(&image, target)
            .map_err(|e| failed(&format!("could not write {}", target.display()), e))?;
        log::info!("rendered {}", target.display());
        Ok(target.to_path_buf())
    }
}
