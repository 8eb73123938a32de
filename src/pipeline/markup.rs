//! Body markup: exchange text → HTML fragment.
//!
//! Plain text is escaped and its newlines become `<br>`. Rich text goes
//! through pulldown-cmark, but fenced code is handled separately:
//!
//! ```text
//! normalise ──▶ extract fences ──▶ pulldown-cmark ──▶ reinsert highlighted blocks
//!               (placeholders)     (tables, math)     (syntect / mermaid)
//! ```
//!
//! Feeding fences through the general converter loses their indentation
//! and mangles `<`, `&` and friends inside the code, so each block is lifted
//! out first, highlighted on its own, and substituted back by index.

use crate::config::BodyFormat;
use once_cell::sync::Lazy;
use pulldown_cmark::{html, Event, Options, Parser};
use regex::Regex;
use syntect::highlighting::ThemeSet;
use syntect::html::highlighted_html_for_string;
use syntect::parsing::SyntaxSet;
use tracing::warn;

const HIGHLIGHT_THEME: &str = "InspiredGitHub";

static SYNTAXES: Lazy<SyntaxSet> = Lazy::new(SyntaxSet::load_defaults_newlines);
static THEMES: Lazy<ThemeSet> = Lazy::new(ThemeSet::load_defaults);

/// Convert a text body according to its format.
pub fn to_markup(text: &str, format: BodyFormat) -> String {
    match format {
        BodyFormat::Plain => plain_to_html(text),
        BodyFormat::Markdown => markdown_to_html(text),
    }
}

/// Escape and turn newlines into `<br>`.
pub fn plain_to_html(text: &str) -> String {
    escape_html(&normalise_text(text)).replace('\n', "<br>")
}

/// Markdown with tables, math, strikethrough, task lists and footnotes.
/// Soft line breaks are kept as hard breaks; chat text is written that way.
pub fn markdown_to_html(text: &str) -> String {
    let normalised = normalise_text(text);
    let (source, blocks) = extract_fences(&normalised);

    let options = Options::ENABLE_TABLES
        | Options::ENABLE_MATH
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_FOOTNOTES;
    let parser = Parser::new_ext(&source, options).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        other => other,
    });

    let mut out = String::with_capacity(source.len() * 3 / 2);
    html::push_html(&mut out, parser);
    reinsert_blocks(&out, &blocks)
}

/// Minimal HTML escaping for text and attribute values.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + input.len() / 8);
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// ── Normalisation ────────────────────────────────────────────────────────────

pub(crate) fn normalise_text(input: &str) -> String {
    remove_invisible_chars(&normalise_line_endings(input))
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Fence extraction ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct FencedBlock {
    lang: String,
    code: String,
}

static RE_FENCE_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<indent>[ \t]*)(?P<fence>`{3,}|~{3,})[ \t]*(?P<lang>[^\s`{]*)").unwrap()
});

static RE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:<pre><code>|<p>)?CODEBLOCKPLACEHOLDER(\d+)END\n?(?:</code></pre>|</p>)?",
    )
    .unwrap()
});

fn placeholder(index: usize) -> String {
    format!("CODEBLOCKPLACEHOLDER{index}END")
}

/// Lift fenced blocks out of `text`, leaving a placeholder paragraph at the
/// fence's indentation. An unclosed fence runs to the end of the text.
fn extract_fences(text: &str) -> (String, Vec<FencedBlock>) {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(caps) = RE_FENCE_OPEN.captures(lines[i]) else {
            out.push(lines[i].to_string());
            i += 1;
            continue;
        };
        let indent = caps["indent"].to_string();
        let fence = &caps["fence"];
        let fence_char = fence.chars().next().unwrap_or('`');
        let fence_len = fence.len();
        let lang = caps
            .name("lang")
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();

        i += 1;
        let mut body: Vec<&str> = Vec::new();
        while i < lines.len() {
            let candidate = lines[i].trim();
            i += 1;
            if is_closing_fence(candidate, fence_char, fence_len) {
                break;
            }
            body.push(lines[i - 1]);
        }

        out.push(String::new());
        out.push(format!("{indent}{}", placeholder(blocks.len())));
        out.push(String::new());
        blocks.push(FencedBlock {
            lang,
            code: dedent(&body),
        });
    }

    (out.join("\n"), blocks)
}

fn is_closing_fence(line: &str, fence_char: char, min_len: usize) -> bool {
    line.len() >= min_len && line.chars().all(|c| c == fence_char)
}

/// Strip the common leading whitespace of all non-blank lines.
fn dedent(lines: &[&str]) -> String {
    let common = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.chars().take_while(|c| *c == ' ' || *c == '\t').count())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| l.chars().skip(common).collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Highlighting ─────────────────────────────────────────────────────────────

fn reinsert_blocks(html: &str, blocks: &[FencedBlock]) -> String {
    RE_PLACEHOLDER
        .replace_all(html, |caps: &regex::Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|idx| blocks.get(idx))
                .map(highlight_block)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn highlight_block(block: &FencedBlock) -> String {
    if block.lang == "mermaid" {
        return format!("<pre class=\"mermaid\">{}</pre>\n", escape_html(&block.code));
    }

    let syntax = if block.lang.is_empty() {
        None
    } else {
        SYNTAXES.find_syntax_by_token(&block.lang)
    }
    .unwrap_or_else(|| SYNTAXES.find_syntax_plain_text());

    let Some(theme) = THEMES.themes.get(HIGHLIGHT_THEME) else {
        return plain_code_block(block);
    };
    let mut code = block.code.clone();
    code.push('\n');
    match highlighted_html_for_string(&code, &SYNTAXES, syntax, theme) {
        Ok(highlighted) => format!(
            "<div class=\"code-block\" data-lang=\"{}\">{}</div>\n",
            escape_html(&block.lang),
            highlighted
        ),
        Err(e) => {
            warn!("Highlighting '{}' block failed: {}", block.lang, e);
            plain_code_block(block)
        }
    }
}

fn plain_code_block(block: &FencedBlock) -> String {
    format!("<pre><code>{}</code></pre>\n", escape_html(&block.code))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_escaped_with_breaks() {
        assert_eq!(
            plain_to_html("a < b\r\nc & \"d\""),
            "a &lt; b<br>c &amp; &quot;d&quot;"
        );
    }

    #[test]
    fn invisible_characters_are_removed() {
        assert_eq!(normalise_text("zero\u{200B}width\u{FEFF}"), "zerowidth");
    }

    #[test]
    fn extract_keeps_indentation_and_specials() {
        let text = "intro\n```python\ndef f(x):\n    return x < 1 && y\n```\noutro";
        let (source, blocks) = extract_fences(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lang, "python");
        assert_eq!(blocks[0].code, "def f(x):\n    return x < 1 && y");
        assert!(source.contains("CODEBLOCKPLACEHOLDER0END"));
        assert!(!source.contains("return"));
    }

    #[test]
    fn indented_fence_is_dedented() {
        let text = "1. step\n\n   ```sh\n   cargo run\n     --release\n   ```\n";
        let (source, blocks) = extract_fences(text);
        assert_eq!(blocks[0].code, "cargo run\n  --release");
        assert!(source.contains("   CODEBLOCKPLACEHOLDER0END"));
    }

    #[test]
    fn unclosed_fence_runs_to_end() {
        let (_, blocks) = extract_fences("```\nlet a = 1;\nlet b = 2;");
        assert_eq!(blocks[0].code, "let a = 1;\nlet b = 2;");
        assert_eq!(blocks[0].lang, "");
    }

    #[test]
    fn longer_fence_contains_shorter() {
        let text = "````md\n```rust\nfn main() {}\n```\n````";
        let (_, blocks) = extract_fences(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].code, "```rust\nfn main() {}\n```");
    }

    #[test]
    fn tilde_fences_are_recognised() {
        let (_, blocks) = extract_fences("~~~\nplain\n~~~");
        assert_eq!(blocks[0].code, "plain");
    }

    #[test]
    fn unknown_language_falls_back_to_plain_text() {
        let html = markdown_to_html("```nosuchlang\nfoo\n    bar <baz>\n```");
        assert!(html.contains("code-block"));
        assert!(html.contains("    bar &lt;baz&gt;"));
        assert!(!html.contains("CODEBLOCKPLACEHOLDER"));
        assert!(!html.contains("<p>"));
    }

    #[test]
    fn known_language_is_highlighted() {
        let html = markdown_to_html("```rust\nfn main() {}\n```");
        assert!(html.contains("data-lang=\"rust\""));
        assert!(html.contains("<span style="));
    }

    #[test]
    fn mermaid_becomes_diagram_block() {
        let html = markdown_to_html("```mermaid\ngraph TD; A-->B\n```");
        assert!(html.contains("<pre class=\"mermaid\">graph TD; A--&gt;B</pre>"));
    }

    #[test]
    fn tables_math_and_breaks() {
        let html = markdown_to_html("| a | b |\n|---|---|\n| 1 | 2 |\n\nline one\nline two $x^2$");
        assert!(html.contains("<table>"));
        assert!(html.contains("<br />"));
        assert!(html.contains("math-inline"));
    }

    #[test]
    fn multiple_blocks_keep_order() {
        let html = markdown_to_html("```\nalpha\n```\nmiddle\n```\nomega\n```");
        let a = html.find("alpha").unwrap();
        let b = html.find("middle").unwrap();
        let c = html.find("omega").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn to_markup_dispatches_on_format() {
        assert_eq!(to_markup("*x*", BodyFormat::Plain), "*x*");
        assert!(to_markup("*x*", BodyFormat::Markdown).contains("<em>x</em>"));
    }
}
