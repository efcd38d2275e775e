//! Conversion between field plain text (Markdown, LaTeX, media references)
//! and the collection's rich-text field markup.
//!
//! [`decode`] turns the text a user writes into the markup stored in a note;
//! [`encode`] goes the other way. Rendered Markdown keeps its source in a
//! `data-original-markdown` attribute on the root element, so encoding a field
//! that was decoded here returns exactly the text it was decoded from.

use crate::{FieldValue, FlashmarkError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use once_cell::sync::Lazy;
use pulldown_cmark::{html as md_html, Event, Options, Parser, Tag, TagEnd};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

const ORIGINAL_ATTR: &str = "data-original-markdown";

static REALLY_PLAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\p{L}\p{N} ,.?+-]*$").expect("valid plain text regex"));
static DISPLAY_MATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\$\$(.+?)\$\$").expect("valid display math regex"));
static INLINE_MATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([^\s$](?:[^$\n]*[^\s$])?)\$").expect("valid inline math regex"));
static INLINE_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"``[^`]+``|`[^`\n]+`").expect("valid code span regex"));
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style>.*?</style>").expect("valid style regex"));
static ROOT_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*<[A-Za-z][A-Za-z0-9]*\b[^>]*?\bdata-original-markdown="([^"]*)""#)
        .expect("valid root attribute regex")
});
static ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\s+data-original-markdown="[^"]*""#).expect("valid attribute regex"));
static LATEX_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[latex\](.*?)\[/latex\]").expect("valid latex block regex"));
static LATEX_DISPLAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[\$\$\](.*?)\[/\$\$\]").expect("valid latex display regex"));
static LATEX_INLINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[\$\](.*?)\[/\$\]").expect("valid latex inline regex"));
static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br regex"));
static EMPTY_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<b>\s*</b>|<i>\s*</i>|<div>\s*</div>").expect("valid empty tag regex")
});
static IMG_SRC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img\b[^>]*?\bsrc="([^"]+)""#).expect("valid img regex"));
static SOUND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[sound:([^\]]+)\]").expect("valid sound regex"));

/// How math delimited by `$…$` and `$$…$$` is written into rich text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatexMode {
    /// `[$]…[/$]` and `[$$]…[/$$]`, rendered to images by LaTeX.
    #[default]
    Latex,
    /// `\(…\)` and `\[…\]`, rendered by MathJax at review time.
    Mathjax,
    /// Dollar signs are left as typed.
    Off,
}

/// Per-field settings for [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    /// Render the field as Markdown. When `false` the text is stored as plain
    /// text with line breaks.
    pub markdown: bool,
    pub latex_mode: LatexMode,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            markdown: true,
            latex_mode: LatexMode::default(),
        }
    }
}

/// Normalises field text the way [`decode`] sees it: non-breaking spaces
/// become spaces, leading blank lines and trailing whitespace are removed.
pub fn normalize(text: &str) -> String {
    let text = text.replace('\u{a0}', " ");
    let start = text
        .char_indices()
        .find(|&(_, c)| !c.is_whitespace())
        .map(|(i, _)| text[..i].rfind('\n').map_or(0, |nl| nl + 1))
        .unwrap_or(text.len());
    text[start..].trim_end().to_string()
}

/// Converts field plain text to rich text.
///
/// # Errors
///
/// Returns [`FlashmarkError::Format`] for an unterminated ```` ```latex ````
/// block, an unterminated `$$`, or a table whose body rows do not match the
/// header's cell count.
pub fn decode(plain: &str, options: &CodecOptions) -> Result<String> {
    let text = normalize(plain);

    if !options.markdown {
        return Ok(clean_html(&text.replace('\n', "<br />")));
    }

    if is_really_plain(&text) {
        return Ok(text);
    }

    let original = BASE64.encode(text.as_bytes());
    let mut math = Placeholders::new(&text, "FMMATH");
    let mut code = Placeholders::new(&text, "FMCODE");

    let prose = extract_fences(&text, &mut math, &mut code)?;
    let prose = INLINE_CODE_RE
        .replace_all(&prose, |caps: &Captures| code.insert(caps[0].to_string()))
        .into_owned();
    let prose = protect_math(&prose, &mut math, options.latex_mode)?;
    let markdown = code.restore(&prose);

    check_tables(&markdown)?;

    let html = math.restore(&render_markdown(&markdown));
    Ok(tag_root(html.trim_end(), &original))
}

/// Converts rich text back to plain text. Never fails.
pub fn encode(rich: &str) -> String {
    let field = STYLE_RE.replace_all(rich, "");

    if let Some(original) = original_markdown(&field) {
        return original;
    }
    markup_to_text(&field)
}

/// Converts the markup of `rich` to text, ignoring any stored original.
pub fn encode_markup(rich: &str) -> String {
    let field = STYLE_RE.replace_all(rich, "");
    markup_to_text(&ATTR_RE.replace_all(&field, ""))
}

/// Returns `true` when a field decoded from Markdown no longer holds the
/// markup its stored original decodes to.
///
/// Fields without a stored original are never considered edited.
pub fn markup_was_edited(rich: &str, latex_mode: LatexMode) -> bool {
    let field = STYLE_RE.replace_all(rich, "");
    let Some(original) = original_markdown(&field) else {
        return false;
    };
    let options = CodecOptions {
        markdown: true,
        latex_mode,
    };
    match decode(&original, &options) {
        Ok(expected) => ATTR_RE.replace_all(&expected, "") != ATTR_RE.replace_all(&field, ""),
        Err(_) => true,
    }
}

fn markup_to_text(field: &str) -> String {
    let text = LATEX_BLOCK_RE.replace_all(field, |caps: &Captures| {
        format!("\n```latex\n{}\n```\n", caps[1].trim_matches('\n'))
    });
    let text = LATEX_DISPLAY_RE.replace_all(&text, "$$$$$1$$$$");
    let text = LATEX_INLINE_RE.replace_all(&text, "$$$1$$");
    let text = BR_RE.replace_all(&text, "\n");
    let text = text.replace("<div>", "\n").replace("</div>", "");
    unescape_entities(&text).trim().to_string()
}

impl FieldValue {
    /// Decodes `plain`, keeping its normalised form.
    pub fn from_plain(plain: &str, options: &CodecOptions) -> Result<Self> {
        Ok(Self {
            plain: normalize(plain),
            rich: decode(plain, options)?,
        })
    }

    pub fn from_rich(rich: String) -> Self {
        Self {
            plain: encode(&rich),
            rich,
        }
    }
}

/// Returns `true` when `rich` was produced from Markdown by [`decode`].
pub fn is_markdown_field(rich: &str) -> bool {
    ROOT_ATTR_RE.is_match(rich)
}

/// Lists the media files a field refers to, in order of first appearance.
pub fn media_references(rich: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let images = IMG_SRC_RE.captures_iter(rich).map(|caps| caps[1].to_string());
    let sounds = SOUND_RE.captures_iter(rich).map(|caps| caps[1].to_string());
    for name in images.chain(sounds) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Renders Markdown with the extensions field text supports.
pub fn render_markdown(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    let parser = Parser::new_ext(text, options);
    let mut html_output = String::new();
    md_html::push_html(&mut html_output, parser);
    html_output
}

fn is_really_plain(text: &str) -> bool {
    !text.starts_with(char::is_whitespace) && REALLY_PLAIN_RE.is_match(text)
}

fn clean_html(text: &str) -> String {
    let text = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
        .replace("&nbsp;", " ");
    EMPTY_TAG_RE.replace_all(&text, "").trim().to_string()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

fn original_markdown(field: &str) -> Option<String> {
    let caps = ROOT_ATTR_RE.captures(field)?;
    let bytes = match BASE64.decode(caps[1].as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("ignoring undecodable {ORIGINAL_ATTR} attribute: {e}");
            return None;
        }
    };
    let text = String::from_utf8_lossy(&bytes).into_owned();
    // Older tools stored line breaks as `<br />` inside the attribute.
    if !text.contains('\n') && text.contains("<br />") {
        return Some(text.replace("<br />", "\n"));
    }
    Some(text)
}

/// Opaque alphanumeric stand-ins that survive Markdown rendering untouched.
struct Placeholders {
    prefix: String,
    values: Vec<String>,
}

impl Placeholders {
    fn new(text: &str, prefix: &str) -> Self {
        let mut prefix = prefix.to_string();
        while text.contains(&prefix) {
            prefix.push('Q');
        }
        Self {
            prefix,
            values: Vec::new(),
        }
    }

    fn insert(&mut self, value: String) -> String {
        let key = format!("{}{}Z", self.prefix, self.values.len());
        self.values.push(value);
        key
    }

    fn restore(&self, text: &str) -> String {
        let mut text = text.to_string();
        for (i, value) in self.values.iter().enumerate() {
            text = text.replace(&format!("{}{i}Z", self.prefix), value);
        }
        text
    }
}

/// Replaces fenced blocks with placeholders: ```` ```latex ```` and
/// ```` ```tex ```` blocks become `[latex]` math, other fences are code.
fn extract_fences(text: &str, math: &mut Placeholders, code: &mut Placeholders) -> Result<String> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < lines.len() {
        let Some((marker, info)) = fence_open(lines[i]) else {
            out.push_str(lines[i]);
            i += 1;
            continue;
        };
        let close = lines[i + 1..]
            .iter()
            .position(|line| is_fence_close(line, marker))
            .map(|offset| i + 1 + offset);
        let is_latex = matches!(info, "latex" | "tex");

        match (close, is_latex) {
            (None, true) => {
                return Err(FlashmarkError::Format(format!(
                    "unterminated ```{info} block starting at line {} of the field",
                    i + 1
                )))
            }
            (Some(close), true) => {
                let body: String = lines[i + 1..close].concat();
                let key = math.insert(format!(
                    "[latex]{}[/latex]",
                    escape_html(body.trim_end_matches('\n'))
                ));
                out.push_str(&key);
                out.push('\n');
                i = close + 1;
            }
            (close, false) => {
                let end = close.map_or(lines.len(), |close| close + 1);
                let block: String = lines[i..end].concat();
                let trailing_newline = block.ends_with('\n');
                out.push_str(&code.insert(block.trim_end_matches('\n').to_string()));
                if trailing_newline {
                    out.push('\n');
                }
                i = end;
            }
        }
    }
    Ok(out)
}

fn fence_open(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let fence_char = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let run = trimmed.len() - trimmed.trim_start_matches(fence_char).len();
    if run < 3 {
        return None;
    }
    Some((&trimmed[..run], trimmed[run..].trim()))
}

fn is_fence_close(line: &str, marker: &str) -> bool {
    let trimmed = line.trim();
    let fence_char = marker.chars().next().unwrap_or('`');
    trimmed.len() >= marker.len() && trimmed.chars().all(|c| c == fence_char)
}

/// Swaps `$$…$$` and `$…$` spans for placeholders holding their final markup.
fn protect_math(text: &str, math: &mut Placeholders, mode: LatexMode) -> Result<String> {
    let text = DISPLAY_MATH_RE.replace_all(text, |caps: &Captures| {
        let source = escape_html(&caps[1]);
        math.insert(match mode {
            LatexMode::Latex => format!("[$$]{source}[/$$]"),
            LatexMode::Mathjax => format!("\\[{source}\\]"),
            LatexMode::Off => format!("$${source}$$"),
        })
    });
    if text.contains("$$") {
        return Err(FlashmarkError::Format("unterminated $$ math block".to_string()));
    }
    let text = INLINE_MATH_RE.replace_all(&text, |caps: &Captures| {
        let source = escape_html(&caps[1]);
        math.insert(match mode {
            LatexMode::Latex => format!("[$]{source}[/$]"),
            LatexMode::Mathjax => format!("\\({source}\\)"),
            LatexMode::Off => format!("${source}$"),
        })
    });
    Ok(text.into_owned())
}

/// Rejects GFM tables whose body rows have a different cell count than the header.
fn check_tables(markdown: &str) -> Result<()> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    let mut columns = 0;
    let mut row = 0;

    for (event, range) in Parser::new_ext(markdown, options).into_offset_iter() {
        match event {
            Event::Start(Tag::Table(alignments)) => {
                columns = alignments.len();
                row = 0;
            }
            Event::Start(Tag::TableRow) => {
                row += 1;
                let source = &markdown[range.clone()];
                let cells = count_cells(source.lines().next().unwrap_or_default());
                if cells != columns {
                    return Err(FlashmarkError::Format(format!(
                        "table row {row} has {cells} cells but the header has {columns}"
                    )));
                }
            }
            Event::End(TagEnd::Table) => columns = 0,
            _ => {}
        }
    }
    Ok(())
}

fn count_cells(row: &str) -> usize {
    let mut row = row.trim();
    row = row.strip_prefix('|').unwrap_or(row);
    if row.ends_with('|') && !row.ends_with("\\|") {
        row = &row[..row.len() - 1];
    }
    let mut cells = 1;
    let mut escaped = false;
    for c in row.chars() {
        match c {
            '\\' if !escaped => {
                escaped = true;
                continue;
            }
            '|' if !escaped => cells += 1,
            _ => {}
        }
        escaped = false;
    }
    cells
}

/// Stores the original text on the first element, wrapping bare output in `<div>`.
fn tag_root(html: &str, original: &str) -> String {
    let attribute = format!(" {ORIGINAL_ATTR}=\"{original}\"");
    let trimmed = html.trim_start();
    let has_root = trimmed.starts_with('<')
        && trimmed[1..].starts_with(|c: char| c.is_ascii_alphabetic());
    if !has_root {
        let body = if html.is_empty() { "&nbsp;" } else { html };
        return format!("<div{attribute}>{body}</div>");
    }
    let name_end = trimmed[1..]
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .map_or(trimmed.len(), |i| i + 1);
    format!("{}{attribute}{}", &trimmed[..name_end], &trimmed[name_end..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn md() -> CodecOptions {
        CodecOptions::default()
    }

    fn with_mode(latex_mode: LatexMode) -> CodecOptions {
        CodecOptions {
            markdown: true,
            latex_mode,
        }
    }

    #[test]
    fn test_really_plain_text_is_stored_verbatim() {
        assert_eq!(decode("What is the capital of Norway?", &md()).unwrap(), "What is the capital of Norway?");
        assert_eq!(decode("Blåbærsyltetøy, 2+2", &md()).unwrap(), "Blåbærsyltetøy, 2+2");
        assert_eq!(decode("Q  \n", &md()).unwrap(), "Q");
    }

    #[test]
    fn test_markdown_is_rendered_with_original_attribute() {
        let rich = decode("Some **bold** text", &md()).unwrap();
        assert!(rich.starts_with("<p data-original-markdown=\""));
        assert!(rich.contains("<strong>bold</strong>"));
        assert!(is_markdown_field(&rich));
        assert_eq!(encode(&rich), "Some **bold** text");
    }

    #[test]
    fn test_round_trip_for_supported_markdown() {
        let samples = [
            "Line one\nline *two*",
            "- item\n- **item**\n\n> quote",
            "# Heading\n\n`code` and ~~gone~~",
            "| a | b |\n|---|---|\n| 1 | 2 |",
            "```rust\nfn main() {}\n```",
            "Energy $E = mc^2$ and\n\n$$\\int_0^1 x\\,dx$$",
            "![cat](cat.png) [link](https://example.com)",
            "Footnote[^1]\n\n[^1]: the note",
        ];
        for sample in samples {
            let rich = decode(sample, &md()).unwrap();
            assert_eq!(encode(&rich), sample, "round trip of {sample:?}");
        }
    }

    #[test]
    fn test_round_trip_normalises_trailing_whitespace() {
        let rich = decode("*x*  \n\n", &md()).unwrap();
        assert_eq!(encode(&rich), "*x*");
        let rich = decode("a\u{a0}*b*", &md()).unwrap();
        assert_eq!(encode(&rich), "a *b*");
    }

    #[test]
    fn test_math_modes() {
        let latex = decode("area $x^2$ and $$y_1$$", &md()).unwrap();
        assert!(latex.contains("[$]x^2[/$]"));
        assert!(latex.contains("[$$]y_1[/$$]"));

        let mathjax = decode("area $x^2$ and $$y_1$$", &with_mode(LatexMode::Mathjax)).unwrap();
        assert!(mathjax.contains("\\(x^2\\)"));
        assert!(mathjax.contains("\\[y_1\\]"));

        let off = decode("area $x^2$", &with_mode(LatexMode::Off)).unwrap();
        assert!(off.contains("$x^2$"));
    }

    #[test]
    fn test_math_is_not_touched_by_markdown() {
        let rich = decode("$a_1 * b_2 * c$", &md()).unwrap();
        assert!(rich.contains("[$]a_1 * b_2 * c[/$]"));
        assert!(!rich.contains("<em>"));
    }

    #[test]
    fn test_dollars_in_code_are_not_math() {
        let rich = decode("`$HOME` costs $5 and $6", &md()).unwrap();
        assert!(rich.contains("<code>$HOME</code>"));
        assert!(!rich.contains("[$]"));
    }

    #[test]
    fn test_latex_fence_becomes_latex_block() {
        let rich = decode("Proof:\n\n```latex\n\\begin{align}\na &< b\n\\end{align}\n```", &md()).unwrap();
        assert!(rich.contains("[latex]\\begin{align}\na &amp;&lt; b\n\\end{align}[/latex]"));
    }

    #[test]
    fn test_unterminated_latex_fence_is_format_error() {
        let err = decode("```tex\nx^2\n", &md()).unwrap_err();
        assert!(matches!(err, FlashmarkError::Format(msg) if msg.contains("unterminated")));
    }

    #[test]
    fn test_unterminated_display_math_is_format_error() {
        let err = decode("broken $$x^2 here", &md()).unwrap_err();
        assert!(matches!(err, FlashmarkError::Format(_)));
    }

    #[test]
    fn test_ragged_table_is_format_error() {
        let err = decode("| a | b |\n|---|---|\n| 1 | 2 |\n| 3 |", &md()).unwrap_err();
        assert_eq!(err.to_string(), "Format error: table row 2 has 1 cells but the header has 2");
    }

    #[test]
    fn test_plain_mode_uses_line_breaks() {
        let options = CodecOptions {
            markdown: false,
            latex_mode: LatexMode::Latex,
        };
        let rich = decode("first\nsecond <b></b>&amp; more", &options).unwrap();
        assert_eq!(rich, "first<br />second & more");
        assert_eq!(encode("first<br />second"), "first\nsecond");
    }

    #[test]
    fn test_encode_foreign_html() {
        let rich = "<style>.card{}</style><div>A &amp; B</div><div>[$]x[/$] [$$]y[/$$]</div>[latex]z[/latex]";
        assert_eq!(encode(rich), "A & B\n$x$ $$y$$\n```latex\nz\n```");
    }

    #[test]
    fn test_encode_legacy_attribute_with_br() {
        let legacy = format!(
            "<p data-original-markdown=\"{}\">x</p>",
            BASE64.encode("a<br />*b*")
        );
        assert_eq!(encode(&legacy), "a\n*b*");
    }

    #[test]
    fn test_empty_render_gets_div_with_nbsp() {
        assert_eq!(tag_root("", "AA=="), "<div data-original-markdown=\"AA==\">&nbsp;</div>");
    }

    #[test]
    fn test_media_references() {
        let rich = "<img src=\"a.png\"> [sound:b.mp3] <img class=\"x\" src=\"a.png\">";
        assert_eq!(media_references(rich), vec!["a.png", "b.mp3"]);
    }

    #[test]
    fn test_normalize_strips_leading_blank_lines_only() {
        assert_eq!(normalize("\n\n  indented\ntext \n"), "  indented\ntext");
    }

    #[test]
    fn test_markup_edited_after_decoding_is_detected() {
        let rich = decode("Some *a*", &md()).unwrap();
        assert!(!markup_was_edited(&rich, LatexMode::Latex));

        let edited = rich.replace("<em>a</em>", "<em>EDITED</em>");
        assert!(markup_was_edited(&edited, LatexMode::Latex));
        assert_eq!(encode(&edited), "Some *a*");
        assert_eq!(encode_markup(&edited), "<p>Some <em>EDITED</em></p>");

        assert!(!markup_was_edited("plain words", LatexMode::Latex));
        assert!(!markup_was_edited("<b>foreign</b>", LatexMode::Latex));
    }
}
