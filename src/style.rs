//! Page stylesheet and HTML shell.
//!
//! Every rendered page is a standalone HTML document: the render service
//! gets no network access to fetch assets, so the stylesheet is embedded
//! inline. Callers can replace it via
//! [`crate::config::ArchiveConfigBuilder::stylesheet`]; the constant here is
//! used only when no override is provided.
//!
//! Markdown math comes out as `math-inline` / `math-display` spans holding
//! TeX, and mermaid fences as `<pre class="mermaid">` holding diagram
//! source. Nothing here typesets them. Either the render service does, or
//! the operator supplies the scripts through
//! [`crate::config::ArchiveConfigBuilder::page_head`], which is placed
//! verbatim in every page's `<head>`.

/// Default stylesheet embedded in every page.
pub const DEFAULT_STYLESHEET: &str = r#"
@page { size: A4; margin: 18mm 16mm; }

body {
    font-family: "Roboto", "Noto Sans", "Helvetica Neue", Arial, sans-serif,
                 "Noto Color Emoji", "Apple Color Emoji", "Segoe UI Emoji";
    font-size: 11pt;
    line-height: 1.5;
    color: #1f2328;
}

h1 {
    font-size: 14pt;
    margin: 0 0 6pt 0;
    padding-bottom: 3pt;
    border-bottom: 1px solid #d0d7de;
}

section { margin-bottom: 18pt; }
section.user-message { background: #f6f8fa; padding: 8pt 10pt; border-radius: 4pt; }

pre, code { font-family: "JetBrains Mono", "Fira Code", Menlo, Consolas, monospace; font-size: 9.5pt; }
pre { white-space: pre-wrap; word-wrap: break-word; padding: 8pt; border-radius: 4pt; border: 1px solid #d0d7de; }
.code-block pre { margin: 6pt 0; }
pre.mermaid { border: none; text-align: center; }

table { border-collapse: collapse; margin: 6pt 0; }
th, td { border: 1px solid #d0d7de; padding: 3pt 6pt; vertical-align: top; }
th { background: #f6f8fa; }

figure { margin: 8pt 0; text-align: center; page-break-inside: avoid; }
figure img { max-width: 100%; max-height: 220mm; }
figcaption { font-size: 9pt; color: #57606a; margin-top: 3pt; }

.recovery h1 { font-size: 16pt; }
.recovery table { width: 100%; }
.recovery th { width: 28%; text-align: left; }
"#;

/// Wrap a body fragment into a complete document. `head` is extra markup
/// appended to `<head>` as is.
pub fn html_document(title: &str, stylesheet: &str, head: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n<title>{title}</title>\n<style>{stylesheet}</style>\n{head}</head>\n<body>\n{body}</body>\n</html>\n"
    )
}
